//! Fixed test constants for deterministic tests

// Shared JWT secret used by the mock auth server and the gateway under test
pub const TEST_JWT_SECRET: &str = "test-jwt-secret-do-not-use-in-production";

// Gateway client credentials
pub const TEST_CLIENT_ID: &str = "gateway-test-client";
pub const TEST_CLIENT_PASSWORD: &str = "test-password-do-not-use-in-production";

// Logins
pub const TEST_LOGIN_ALICE: &str = "alice";
pub const TEST_LOGIN_BOB: &str = "bob";

// Scopes
pub const TEST_SCOPE: &str = "test-scope";

// Service tokens issued by the mock server
pub const TEST_SERVICE_TOKEN_1: &str = "service-token-0001";
pub const TEST_SERVICE_TOKEN_2: &str = "service-token-0002";
