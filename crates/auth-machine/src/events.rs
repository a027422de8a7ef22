//! Events consumed by the machine and commands it emits.
//!
//! The machine itself is synchronous. Anything that needs the network or a
//! timer comes back out of a transition as a [`Command`] for the driver to
//! execute; the eventual result re-enters as [`AuthEvent::ServiceDone`].

use crate::context::{MfaChallenge, Session};
use crate::error::AuthError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier of one service invocation.
///
/// Each region records the id it is waiting for and drops completions that
/// carry any other id, so results of superseded invocations never mutate the
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvokeId(pub u64);

/// Options shared by the sign-up flavors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_roles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// External events fed into the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    // Sign-in requests
    SignInPassword {
        email: String,
        password: String,
    },
    SignInAnonymous,
    SignInPat {
        pat: String,
    },
    SignInIdToken {
        provider: String,
        id_token: String,
        nonce: Option<String>,
    },
    SignInSecurityKey {
        email: Option<String>,
    },
    SignInMfaTotp {
        otp: String,
        ticket: Option<String>,
    },
    SignInSmsOtp {
        phone_number: String,
        otp: String,
    },

    // Sign-up / passwordless requests (registration region)
    SignUpEmailPassword {
        email: String,
        password: String,
        options: SignUpOptions,
    },
    SignUpSecurityKey {
        email: String,
        options: SignUpOptions,
    },
    PasswordlessEmail {
        email: String,
        options: SignUpOptions,
    },
    PasswordlessSms {
        phone_number: String,
        options: SignUpOptions,
    },
    SignInEmailOtp {
        email: String,
    },
    VerifyEmailOtp {
        email: String,
        otp: String,
    },

    SignOut {
        all: bool,
    },

    /// Externally obtained session, e.g. from another tab.
    SessionUpdate {
        session: Session,
    },
    /// Directly supplied refresh token (token region).
    TryToken {
        token: String,
    },

    /// Scheduler tick, delivered roughly once per second while signed in.
    Tick,
    /// The retry-import delay elapsed.
    RetryImport,

    /// A service invocation finished.
    ServiceDone {
        id: InvokeId,
        outcome: ServiceOutcome,
    },
}

/// Synthetic events a transition re-injects into the machine itself. Drained
/// before the next external event.
#[derive(Debug, Clone, PartialEq)]
pub enum InternalEvent {
    SignedIn,
    SignedOut,
    TokenChanged,
}

/// Service invocations the driver executes against the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCall {
    /// Bootstrap token import (url parameter or persisted token exchange).
    ImportToken,
    /// Exchange a refresh token for a fresh session.
    RefreshToken { refresh_token: String },
    SignOut { refresh_token: String, all: bool },
    SignInPassword {
        email: String,
        password: String,
    },
    SignInAnonymous,
    SignInPat {
        pat: String,
    },
    SignInIdToken {
        provider: String,
        id_token: String,
        nonce: Option<String>,
    },
    SignInSecurityKey {
        email: Option<String>,
    },
    SignInMfaTotp {
        otp: String,
        ticket: String,
    },
    SignInSmsOtp {
        phone_number: String,
        otp: String,
    },
    SignUpEmailPassword {
        email: String,
        password: String,
        options: SignUpOptions,
    },
    SignUpSecurityKey {
        email: String,
        options: SignUpOptions,
    },
    PasswordlessEmail {
        email: String,
        options: SignUpOptions,
    },
    PasswordlessSms {
        phone_number: String,
        options: SignUpOptions,
    },
    SignInEmailOtp {
        email: String,
    },
    VerifyEmailOtp {
        email: String,
        otp: String,
    },
}

/// What a completed service produced.
///
/// A successful completion may carry a full session, an MFA challenge, or
/// neither (e.g. a passwordless request that only sent an email).
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceOutcome {
    Ok(ServiceResult),
    Err(AuthError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceResult {
    pub session: Option<Session>,
    pub mfa: Option<MfaChallenge>,
}

impl ServiceResult {
    pub fn with_session(session: Session) -> Self {
        Self {
            session: Some(session),
            mfa: None,
        }
    }

    pub fn with_mfa(mfa: MfaChallenge) -> Self {
        Self {
            session: None,
            mfa: Some(mfa),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Effects the driver must execute after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a service; deliver the result as `ServiceDone { id, .. }`.
    Invoke { id: InvokeId, call: ServiceCall },
    /// Sleep for `delay`, then send `RetryImport`.
    ScheduleImportRetry { delay: Duration },
}
