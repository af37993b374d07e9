//! Static table of auth server operations.
//!
//! Every remote call goes through [`Operation`]. The table fixes, per
//! operation, the HTTP method, how the 200 response body is decoded, and which
//! request parameter (if any) carries the gateway's service token.

use crate::error::GatewayError;
use std::fmt;
use std::str::FromStr;

/// HTTP method used for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// Parameters sent as a query string.
    Get,
    /// Parameters sent as a JSON body.
    Post,
}

/// How a successful response body is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    /// Body is a JWT signed with the shared secret.
    Jwt,
    /// Body is plain JSON.
    Json,
    /// Body is returned as a raw string.
    Text,
}

/// Table entry for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationEntry {
    pub method: HttpMethod,
    pub format: ResponseFormat,
    /// Request parameter holding the service token.
    pub service_token_field: Option<&'static str>,
}

/// Auth server operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetAuthorizationCode,
    GetServiceToken,
    ValidToken,
    GetUser,
    ServiceGetUser,
    GetUsers,
    SearchUser,
    AddUser,
    EditUser,
    GrantScopeRoles,
    DenyScopeRoles,
    GetMetadata,
    GetMetadataByService,
    SetAccountMetadata,
    ServiceSetAccountMetadata,
    ModifyScopeLimit,
    ServiceModifyScopeLimit,
    AddScope,
    GetTempToken,
    RetrieveTempData,
    CheckScopeId,
}

impl Operation {
    /// All operations, in table order.
    pub const ALL: [Operation; 21] = [
        Operation::GetAuthorizationCode,
        Operation::GetServiceToken,
        Operation::ValidToken,
        Operation::GetUser,
        Operation::ServiceGetUser,
        Operation::GetUsers,
        Operation::SearchUser,
        Operation::AddUser,
        Operation::EditUser,
        Operation::GrantScopeRoles,
        Operation::DenyScopeRoles,
        Operation::GetMetadata,
        Operation::GetMetadataByService,
        Operation::SetAccountMetadata,
        Operation::ServiceSetAccountMetadata,
        Operation::ModifyScopeLimit,
        Operation::ServiceModifyScopeLimit,
        Operation::AddScope,
        Operation::GetTempToken,
        Operation::RetrieveTempData,
        Operation::CheckScopeId,
    ];

    /// Wire name, which is also the URL path segment on the auth server.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Operation::GetAuthorizationCode => "get_authorization_code",
            Operation::GetServiceToken => "get_service_token",
            Operation::ValidToken => "valid_token",
            Operation::GetUser => "get_user",
            Operation::ServiceGetUser => "service_get_user",
            Operation::GetUsers => "get_users",
            Operation::SearchUser => "search_user",
            Operation::AddUser => "add_user",
            Operation::EditUser => "edit_user",
            Operation::GrantScopeRoles => "grant_scope_roles",
            Operation::DenyScopeRoles => "deny_scope_roles",
            Operation::GetMetadata => "get_metadata",
            Operation::GetMetadataByService => "get_metadata_by_service",
            Operation::SetAccountMetadata => "set_account_metadata",
            Operation::ServiceSetAccountMetadata => "service_set_account_metadata",
            Operation::ModifyScopeLimit => "modify_scope_limit",
            Operation::ServiceModifyScopeLimit => "service_modify_scope_limit",
            Operation::AddScope => "add_scope",
            Operation::GetTempToken => "get_temp_token",
            Operation::RetrieveTempData => "retrieve_temp_data",
            Operation::CheckScopeId => "check_scope_id",
        }
    }

    /// Table entry for this operation.
    #[must_use]
    pub fn entry(self) -> OperationEntry {
        use HttpMethod::{Get, Post};
        use ResponseFormat::{Json, Jwt, Text};

        let (method, format, service_token_field) = match self {
            Operation::GetAuthorizationCode => (Post, Jwt, Some("service_token")),
            Operation::GetServiceToken => (Post, Jwt, None),
            Operation::ValidToken => (Post, Jwt, Some("code")),
            Operation::GetTempToken => (Post, Text, Some("service_token")),
            Operation::RetrieveTempData => (Get, Json, None),
            Operation::CheckScopeId => (Get, Json, Some("service_token")),
            Operation::GetUser
            | Operation::ServiceGetUser
            | Operation::GetUsers
            | Operation::SearchUser
            | Operation::AddUser
            | Operation::EditUser
            | Operation::GrantScopeRoles
            | Operation::DenyScopeRoles
            | Operation::GetMetadata
            | Operation::GetMetadataByService
            | Operation::SetAccountMetadata
            | Operation::ServiceSetAccountMetadata
            | Operation::ModifyScopeLimit
            | Operation::ServiceModifyScopeLimit
            | Operation::AddScope => (Post, Json, Some("service_token")),
        };

        OperationEntry {
            method,
            format,
            service_token_field,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = GatewayError;

    /// Resolve a wire name. Unknown names are a programming error.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.name() == name)
            .ok_or_else(|| GatewayError::UnknownOperation(name.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_core_table_entries() {
        let jwt_posts = [
            Operation::GetAuthorizationCode,
            Operation::GetServiceToken,
            Operation::ValidToken,
        ];
        for op in jwt_posts {
            let entry = op.entry();
            assert_eq!(entry.method, HttpMethod::Post, "{op}");
            assert_eq!(entry.format, ResponseFormat::Jwt, "{op}");
        }

        let json_posts = [Operation::GetUser, Operation::GetUsers, Operation::SearchUser];
        for op in json_posts {
            let entry = op.entry();
            assert_eq!(entry.method, HttpMethod::Post, "{op}");
            assert_eq!(entry.format, ResponseFormat::Json, "{op}");
        }
    }

    #[test]
    fn test_service_token_request_carries_no_service_token() {
        assert_eq!(Operation::GetServiceToken.entry().service_token_field, None);
        assert_eq!(Operation::ValidToken.entry().service_token_field, Some("code"));
    }

    #[test]
    fn test_get_operations() {
        assert_eq!(Operation::RetrieveTempData.entry().method, HttpMethod::Get);
        assert_eq!(Operation::CheckScopeId.entry().method, HttpMethod::Get);
        assert_eq!(Operation::GetTempToken.entry().format, ResponseFormat::Text);
    }

    #[test]
    fn test_from_str_round_trips_every_name() {
        for op in Operation::ALL {
            assert_eq!(op.name().parse::<Operation>().unwrap(), op);
        }
    }

    #[test]
    fn test_from_str_unknown_fails_fast() {
        let result = "drop_all_users".parse::<Operation>();
        assert!(matches!(result, Err(GatewayError::UnknownOperation(name)) if name == "drop_all_users"));
    }

    #[test]
    fn test_display_is_wire_name() {
        assert_eq!(Operation::GetServiceToken.to_string(), "get_service_token");
    }
}
