//! Storage key constants.

/// Storage keys used for persisted session credentials
pub struct StorageKeys;

impl StorageKeys {
    /// Refresh token value
    pub const REFRESH_TOKEN: &'static str = "auth_refresh_token";

    /// Refresh token identifier
    pub const REFRESH_TOKEN_ID: &'static str = "auth_refresh_token_id";

    /// When the access token expires (ISO timestamp)
    pub const ACCESS_TOKEN_EXPIRES_AT: &'static str = "auth_jwt_expires_at";
}
