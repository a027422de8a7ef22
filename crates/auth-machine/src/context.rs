//! Session context: the single mutable state container of the machine.

use crate::error::AuthError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// User identity as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
}

/// A full session as carried on the wire and across the broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    /// Lifetime of the access token in seconds
    pub access_token_expires_in: i64,
    pub refresh_token: String,
    #[serde(default)]
    pub refresh_token_id: Option<String>,
    pub user: User,
}

/// Short-lived credential. `value` absent implies the holder is not
/// authenticated for resource access.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessToken {
    pub value: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expires_in_seconds: Option<i64>,
}

/// Long-lived credential used to mint new access tokens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshToken {
    pub value: Option<String>,
    pub id: Option<String>,
    /// Personal access tokens are never auto-refreshed.
    pub is_pat: bool,
}

/// Outstanding MFA challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaChallenge {
    pub ticket: String,
}

/// Bookkeeping for the refresh backoff algorithm.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshTimer {
    pub started_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
}

/// Category under which the last error of a region is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    Registration,
    Signout,
}

/// The single mutable state container. Mutated only by machine transition
/// actions; discarded on teardown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    pub user: Option<User>,
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    pub mfa: Option<MfaChallenge>,
    pub refresh_timer: RefreshTimer,
    pub import_token_attempts: u32,
    pub errors: HashMap<ErrorCategory, AuthError>,
}

impl SessionContext {
    /// Build a context from an externally supplied initial session
    /// (server-rendered bootstrapping).
    pub fn from_initial_session(session: &Session, now: DateTime<Utc>) -> Self {
        let mut ctx = Self::default();
        ctx.apply_session(session, now);
        ctx
    }

    /// The holder is signed in iff both the user and the access token value
    /// are present.
    pub fn is_signed_in(&self) -> bool {
        self.user.is_some() && self.access_token.value.is_some()
    }

    /// Replace identity and credentials from a freshly minted session.
    pub fn apply_session(&mut self, session: &Session, now: DateTime<Utc>) {
        self.user = Some(session.user.clone());
        self.access_token = AccessToken {
            value: Some(session.access_token.clone()),
            expires_at: Some(now + Duration::seconds(session.access_token_expires_in)),
            expires_in_seconds: Some(session.access_token_expires_in),
        };
        self.refresh_token = RefreshToken {
            value: Some(session.refresh_token.clone()),
            id: session.refresh_token_id.clone(),
            is_pat: false,
        };
        self.mfa = None;
    }

    /// Rebuild the wire session from the in-memory credentials, when complete.
    pub fn current_session(&self) -> Option<Session> {
        let user = self.user.clone()?;
        let access_token = self.access_token.value.clone()?;
        let refresh_token = self.refresh_token.value.clone()?;
        Some(Session {
            access_token,
            access_token_expires_in: self.access_token.expires_in_seconds.unwrap_or(0),
            refresh_token,
            refresh_token_id: self.refresh_token.id.clone(),
            user,
        })
    }

    /// Reset everything to defaults.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Reset everything except the refresh token, which the sign-out service
    /// still needs to revoke.
    pub fn clear_except_refresh_token(&mut self) {
        let refresh_token = self.refresh_token.clone();
        *self = Self::default();
        self.refresh_token = refresh_token;
    }

    /// Restart the refresh timer bookkeeping.
    pub fn reset_timer(&mut self, now: DateTime<Utc>) {
        self.refresh_timer = RefreshTimer {
            started_at: Some(now),
            attempts: 0,
            last_attempt: None,
        };
    }

    /// Record a failed refresh attempt.
    pub fn save_refresh_attempt(&mut self, now: DateTime<Utc>) {
        self.refresh_timer.attempts += 1;
        self.refresh_timer.last_attempt = Some(now);
    }

    /// Record the last error of a category.
    pub fn save_error(&mut self, category: ErrorCategory, error: AuthError) {
        self.errors.insert(category, error);
    }

    /// Drop the recorded error of one category. An error only lives as long
    /// as its owning region stays in the failure sub-state.
    pub fn clear_error(&mut self, category: ErrorCategory) {
        self.errors.remove(&category);
    }

    /// Clear all recorded errors and the import attempt counter.
    pub fn reset_errors(&mut self) {
        self.errors.clear();
        self.import_token_attempts = 0;
    }
}
