//! Shared test doubles.

use crate::backend::{
    AuthApi, CreatedPat, DeanonymizeMethod, SecurityKey, SignInResponse, SignUpResponse,
    TotpSecret,
};
use async_trait::async_trait;
use auth_machine::{AuthError, AuthResult, Session, SignUpOptions, User};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

pub(crate) fn fake_user(id: &str) -> User {
    User {
        id: id.to_string(),
        email: Some(format!("{id}@example.com")),
        display_name: None,
        avatar_url: None,
        is_anonymous: false,
    }
}

pub(crate) fn fake_session(refresh_token: &str) -> Session {
    Session {
        access_token: format!("access-for-{refresh_token}"),
        access_token_expires_in: 900,
        refresh_token: refresh_token.to_string(),
        refresh_token_id: None,
        user: fake_user("user-1"),
    }
}

/// Scripted [`AuthApi`]. Each method pops its next canned response; an
/// empty queue yields an error so an unexpected call fails the test.
#[derive(Default)]
pub(crate) struct MockApi {
    pub refresh: Mutex<VecDeque<AuthResult<Session>>>,
    pub refresh_calls: Mutex<Vec<String>>,
    pub password: Mutex<VecDeque<AuthResult<SignInResponse>>>,
    pub anonymous: Mutex<VecDeque<AuthResult<Session>>>,
    pub pat: Mutex<VecDeque<AuthResult<Session>>>,
    pub mfa_totp: Mutex<VecDeque<AuthResult<Session>>>,
    pub sign_out: Mutex<VecDeque<AuthResult<()>>>,
    pub sign_out_calls: Mutex<Vec<(String, bool)>>,
    pub passwordless_email: Mutex<VecDeque<AuthResult<()>>>,
    pub sign_up: Mutex<VecDeque<AuthResult<SignUpResponse>>>,
    pub change_password: Mutex<VecDeque<AuthResult<()>>>,
}

fn pop<T>(queue: &Mutex<VecDeque<AuthResult<T>>>, what: &str) -> AuthResult<T> {
    queue
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(AuthError::other(format!("Unexpected call: {what}"))))
}

#[async_trait]
impl AuthApi for MockApi {
    async fn refresh_token(&self, refresh_token: &str) -> AuthResult<Session> {
        self.refresh_calls
            .lock()
            .unwrap()
            .push(refresh_token.to_string());
        pop(&self.refresh, "refresh_token")
    }

    async fn sign_out(&self, refresh_token: &str, all: bool) -> AuthResult<()> {
        self.sign_out_calls
            .lock()
            .unwrap()
            .push((refresh_token.to_string(), all));
        pop(&self.sign_out, "sign_out")
    }

    async fn sign_in_email_password(&self, _: &str, _: &str) -> AuthResult<SignInResponse> {
        pop(&self.password, "sign_in_email_password")
    }

    async fn sign_in_anonymous(&self) -> AuthResult<Session> {
        pop(&self.anonymous, "sign_in_anonymous")
    }

    async fn sign_in_pat(&self, _: &str) -> AuthResult<Session> {
        pop(&self.pat, "sign_in_pat")
    }

    async fn sign_in_id_token(&self, _: &str, _: &str, _: Option<&str>) -> AuthResult<Session> {
        Err(AuthError::other("Unexpected call: sign_in_id_token"))
    }

    async fn sign_in_mfa_totp(&self, _: &str, _: &str) -> AuthResult<Session> {
        pop(&self.mfa_totp, "sign_in_mfa_totp")
    }

    async fn sign_in_webauthn_challenge(&self, _: Option<&str>) -> AuthResult<serde_json::Value> {
        Err(AuthError::other("Unexpected call: sign_in_webauthn_challenge"))
    }

    async fn sign_in_webauthn_verify(
        &self,
        _: Option<&str>,
        _: serde_json::Value,
    ) -> AuthResult<Session> {
        Err(AuthError::other("Unexpected call: sign_in_webauthn_verify"))
    }

    async fn sign_in_passwordless_email(&self, _: &str, _: &SignUpOptions) -> AuthResult<()> {
        pop(&self.passwordless_email, "sign_in_passwordless_email")
    }

    async fn sign_in_passwordless_sms(&self, _: &str, _: &SignUpOptions) -> AuthResult<()> {
        Err(AuthError::other("Unexpected call: sign_in_passwordless_sms"))
    }

    async fn sign_in_sms_otp(&self, _: &str, _: &str) -> AuthResult<Session> {
        Err(AuthError::other("Unexpected call: sign_in_sms_otp"))
    }

    async fn sign_in_email_otp(&self, _: &str) -> AuthResult<()> {
        Err(AuthError::other("Unexpected call: sign_in_email_otp"))
    }

    async fn verify_email_otp(&self, _: &str, _: &str) -> AuthResult<Session> {
        Err(AuthError::other("Unexpected call: verify_email_otp"))
    }

    async fn sign_up_email_password(
        &self,
        _: &str,
        _: &str,
        _: &SignUpOptions,
    ) -> AuthResult<SignUpResponse> {
        pop(&self.sign_up, "sign_up_email_password")
    }

    async fn sign_up_webauthn_challenge(
        &self,
        _: &str,
        _: &SignUpOptions,
    ) -> AuthResult<serde_json::Value> {
        Err(AuthError::other("Unexpected call: sign_up_webauthn_challenge"))
    }

    async fn sign_up_webauthn_verify(
        &self,
        _: serde_json::Value,
        _: &SignUpOptions,
    ) -> AuthResult<SignUpResponse> {
        Err(AuthError::other("Unexpected call: sign_up_webauthn_verify"))
    }

    async fn deanonymize(
        &self,
        _: &str,
        _: DeanonymizeMethod,
        _: &str,
        _: Option<&str>,
        _: &SignUpOptions,
    ) -> AuthResult<()> {
        Err(AuthError::other("Unexpected call: deanonymize"))
    }

    async fn change_password(
        &self,
        _: Option<&str>,
        _: &str,
        _: Option<&str>,
    ) -> AuthResult<()> {
        pop(&self.change_password, "change_password")
    }

    async fn reset_password(&self, _: &str, _: Option<&str>) -> AuthResult<()> {
        Err(AuthError::other("Unexpected call: reset_password"))
    }

    async fn change_email(&self, _: &str, _: &str, _: Option<&str>) -> AuthResult<()> {
        Err(AuthError::other("Unexpected call: change_email"))
    }

    async fn send_verification_email(&self, _: &str, _: Option<&str>) -> AuthResult<()> {
        Err(AuthError::other("Unexpected call: send_verification_email"))
    }

    async fn set_mfa(&self, _: &str, _: &str, _: &str) -> AuthResult<()> {
        Err(AuthError::other("Unexpected call: set_mfa"))
    }

    async fn generate_totp_secret(&self, _: &str) -> AuthResult<TotpSecret> {
        Err(AuthError::other("Unexpected call: generate_totp_secret"))
    }

    async fn create_pat(
        &self,
        _: &str,
        _: DateTime<Utc>,
        _: Option<serde_json::Value>,
    ) -> AuthResult<CreatedPat> {
        Err(AuthError::other("Unexpected call: create_pat"))
    }

    async fn link_id_token(&self, _: &str, _: &str, _: &str, _: Option<&str>) -> AuthResult<()> {
        Err(AuthError::other("Unexpected call: link_id_token"))
    }

    async fn add_security_key_challenge(&self, _: &str) -> AuthResult<serde_json::Value> {
        Err(AuthError::other("Unexpected call: add_security_key_challenge"))
    }

    async fn add_security_key_verify(
        &self,
        _: &str,
        _: serde_json::Value,
        _: Option<&str>,
    ) -> AuthResult<SecurityKey> {
        Err(AuthError::other("Unexpected call: add_security_key_verify"))
    }
}
