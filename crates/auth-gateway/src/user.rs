//! Authenticated user record built from the auth server's user lookup.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// A user whose token was verified and whose record was fetched remotely.
///
/// Immutable once built; the cache shares it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedUser {
    pub id: String,
    pub display_name: String,
    #[serde(skip)]
    pub raw_token: String,
    pub roles: BTreeSet<String>,
    pub groups: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
    /// The remote record as received.
    pub raw_data: Map<String, Value>,
}

impl ValidatedUser {
    /// Build a user from a `get_user` response.
    ///
    /// `roles`, `groups` and `permissions` may each be an array of names or an
    /// object keyed by name; missing or null collections are empty. Returns
    /// `None` if the record is not an object or lacks a string `attr_id`.
    #[must_use]
    pub fn from_remote(
        data: Value,
        attr_id: &str,
        display_name: String,
        raw_token: String,
    ) -> Option<Self> {
        let Value::Object(raw_data) = data else {
            return None;
        };
        let id = raw_data.get(attr_id)?.as_str()?.to_string();

        Some(Self {
            id,
            display_name,
            raw_token,
            roles: names(raw_data.get("roles")),
            groups: names(raw_data.get("groups")),
            permissions: names(raw_data.get("permissions")),
            raw_data,
        })
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

/// Names from an array of strings or the keys of an object.
fn names(value: Option<&Value>) -> BTreeSet<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        _ => BTreeSet::new(),
    }
}
