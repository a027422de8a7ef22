//! Authentication error taxonomy.
//!
//! Errors carry a numeric status class:
//! `0` network (no response), `1` uncategorized, `10` client-side validation,
//! `20` machine-state conflict, or the HTTP status reported by the backend.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status used when a request never produced a response.
pub const NETWORK_ERROR_CODE: u16 = 0;
/// Status used for uncategorized local failures.
pub const OTHER_ERROR_CODE: u16 = 1;
/// Status used when client-side input validation rejects a request.
pub const VALIDATION_ERROR_CODE: u16 = 10;
/// Status used for machine-state conflicts ("already signed in", ...).
pub const STATE_ERROR_CODE: u16 = 20;

/// Error code the backend reports for an unverified email address.
pub const UNVERIFIED_USER: &str = "unverified-user";
/// Error code reported when a social user already exists during auto-sign-in.
pub const SOCIAL_USER_ALREADY_EXISTS: &str = "social-user-already-exists";

/// Authentication error type.
///
/// All terminal errors are surfaced to callers through rejected operations;
/// the machine itself never halts on one.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthError {
    /// The request never reached the backend
    #[error("Network error: {message}")]
    Network { message: String },

    /// The backend rejected the request
    #[error("{message}")]
    Api {
        status: u16,
        error: String,
        message: String,
    },

    /// Client-side input validation rejected the request before any network call
    #[error("{message}")]
    Validation { error: String, message: String },

    /// The operation conflicts with the current machine state
    #[error("{message}")]
    State { error: String, message: String },

    /// Storage backend failure
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Uncategorized local failure
    #[error("{message}")]
    Other { message: String },
}

impl AuthError {
    pub fn network(message: impl Into<String>) -> Self {
        AuthError::Network {
            message: message.into(),
        }
    }

    pub fn api(status: u16, error: impl Into<String>, message: impl Into<String>) -> Self {
        AuthError::Api {
            status,
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn validation(error: impl Into<String>, message: impl Into<String>) -> Self {
        AuthError::Validation {
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn state(error: impl Into<String>, message: impl Into<String>) -> Self {
        AuthError::State {
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        AuthError::Other {
            message: message.into(),
        }
    }

    pub fn invalid_email() -> Self {
        Self::validation("invalid-email", "Email is incorrectly formatted")
    }

    pub fn invalid_password() -> Self {
        Self::validation("invalid-password", "Password is incorrectly formatted")
    }

    pub fn invalid_phone_number() -> Self {
        Self::validation("invalid-phone-number", "Phone number is incorrectly formatted")
    }

    pub fn invalid_mfa_ticket() -> Self {
        Self::validation("invalid-mfa-ticket", "MFA ticket is invalid")
    }

    pub fn no_mfa_ticket() -> Self {
        Self::validation("no-mfa-ticket", "No MFA ticket has been provided")
    }

    pub fn already_signed_in() -> Self {
        Self::state("already-signed-in", "User is already signed in")
    }

    pub fn not_signed_in() -> Self {
        Self::state("not-signed-in", "User is not signed in")
    }

    pub fn user_not_anonymous() -> Self {
        Self::state("user-not-anonymous", "User is not anonymous")
    }

    /// Numeric status class of this error.
    pub fn status(&self) -> u16 {
        match self {
            AuthError::Network { .. } => NETWORK_ERROR_CODE,
            AuthError::Api { status, .. } => *status,
            AuthError::Validation { .. } => VALIDATION_ERROR_CODE,
            AuthError::State { .. } => STATE_ERROR_CODE,
            AuthError::Storage { .. } | AuthError::Other { .. } => OTHER_ERROR_CODE,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &str {
        match self {
            AuthError::Network { .. } => "network",
            AuthError::Api { error, .. } => error,
            AuthError::Validation { error, .. } => error,
            AuthError::State { error, .. } => error,
            AuthError::Storage { .. } => "storage",
            AuthError::Other { .. } => "other",
        }
    }

    /// Returns true if this error is transient and the operation can be
    /// retried: network failures and HTTP 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Network { .. } => true,
            AuthError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if the backend rejected the credentials because the email
    /// address has not been verified yet.
    pub fn is_unverified(&self) -> bool {
        matches!(self, AuthError::Api { status: 401, error, .. } if error == UNVERIFIED_USER)
    }

    /// Returns true for an HTTP 401 from the backend.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AuthError::Api { status: 401, .. })
    }
}

impl From<session_storage::StorageError> for AuthError {
    fn from(error: session_storage::StorageError) -> Self {
        AuthError::Storage {
            message: error.to_string(),
        }
    }
}

/// Result type alias using AuthError.
pub type AuthResult<T> = Result<T, AuthError>;
