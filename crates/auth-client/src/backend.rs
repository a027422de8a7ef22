//! HTTP client for the authentication backend.
//!
//! [`AuthApi`] is the service contract the machine's invocations run
//! against; [`HttpAuthApi`] is the reqwest implementation. Every call is a
//! JSON `POST` unless noted, with an optional bearer token.

use async_trait::async_trait;
use auth_machine::{AuthError, AuthResult, MfaChallenge, Session, SignUpOptions};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

/// Successful sign-in: either a full session, or an MFA ticket when a
/// second factor is still required.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInResponse {
    #[serde(default)]
    pub session: Option<Session>,
    #[serde(default)]
    pub mfa: Option<MfaChallenge>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpResponse {
    #[serde(default)]
    pub session: Option<Session>,
}

/// TOTP secret issued by `/mfa/totp/generate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotpSecret {
    pub image_url: String,
    pub totp_secret: String,
}

/// Personal access token issued by `/pat`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedPat {
    pub id: String,
    pub personal_access_token: String,
}

/// Security key registered through `/user/webauthn/verify`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityKey {
    pub id: String,
    #[serde(default)]
    pub nickname: Option<String>,
}

/// Error body the backend returns on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// How a sign-up is attached to an anonymous user during deanonymization.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeanonymizeMethod {
    EmailPassword,
    Passwordless,
}

/// Backend contract. One method per endpoint; the machine's service
/// invocations and the façade's direct user-management calls both go
/// through this trait, which keeps the façade testable with a mock.
#[async_trait]
pub trait AuthApi: Send + Sync {
    // --- token lifecycle ---
    async fn refresh_token(&self, refresh_token: &str) -> AuthResult<Session>;
    async fn sign_out(&self, refresh_token: &str, all: bool) -> AuthResult<()>;

    // --- sign-in ---
    async fn sign_in_email_password(&self, email: &str, password: &str)
        -> AuthResult<SignInResponse>;
    async fn sign_in_anonymous(&self) -> AuthResult<Session>;
    async fn sign_in_pat(&self, pat: &str) -> AuthResult<Session>;
    async fn sign_in_id_token(
        &self,
        provider: &str,
        id_token: &str,
        nonce: Option<&str>,
    ) -> AuthResult<Session>;
    async fn sign_in_mfa_totp(&self, otp: &str, ticket: &str) -> AuthResult<Session>;
    async fn sign_in_webauthn_challenge(&self, email: Option<&str>)
        -> AuthResult<serde_json::Value>;
    async fn sign_in_webauthn_verify(
        &self,
        email: Option<&str>,
        credential: serde_json::Value,
    ) -> AuthResult<Session>;
    async fn sign_in_passwordless_email(
        &self,
        email: &str,
        options: &SignUpOptions,
    ) -> AuthResult<()>;
    async fn sign_in_passwordless_sms(
        &self,
        phone_number: &str,
        options: &SignUpOptions,
    ) -> AuthResult<()>;
    async fn sign_in_sms_otp(&self, phone_number: &str, otp: &str) -> AuthResult<Session>;
    async fn sign_in_email_otp(&self, email: &str) -> AuthResult<()>;
    async fn verify_email_otp(&self, email: &str, otp: &str) -> AuthResult<Session>;

    // --- sign-up ---
    async fn sign_up_email_password(
        &self,
        email: &str,
        password: &str,
        options: &SignUpOptions,
    ) -> AuthResult<SignUpResponse>;
    async fn sign_up_webauthn_challenge(
        &self,
        email: &str,
        options: &SignUpOptions,
    ) -> AuthResult<serde_json::Value>;
    async fn sign_up_webauthn_verify(
        &self,
        credential: serde_json::Value,
        options: &SignUpOptions,
    ) -> AuthResult<SignUpResponse>;
    async fn deanonymize(
        &self,
        access_token: &str,
        method: DeanonymizeMethod,
        email: &str,
        password: Option<&str>,
        options: &SignUpOptions,
    ) -> AuthResult<()>;

    // --- user management (bearer-authenticated) ---
    async fn change_password(
        &self,
        access_token: Option<&str>,
        new_password: &str,
        ticket: Option<&str>,
    ) -> AuthResult<()>;
    async fn reset_password(&self, email: &str, redirect_to: Option<&str>) -> AuthResult<()>;
    async fn change_email(
        &self,
        access_token: &str,
        new_email: &str,
        redirect_to: Option<&str>,
    ) -> AuthResult<()>;
    async fn send_verification_email(
        &self,
        email: &str,
        redirect_to: Option<&str>,
    ) -> AuthResult<()>;
    async fn set_mfa(&self, access_token: &str, code: &str, active_mfa_type: &str)
        -> AuthResult<()>;
    async fn generate_totp_secret(&self, access_token: &str) -> AuthResult<TotpSecret>;
    async fn create_pat(
        &self,
        access_token: &str,
        expires_at: DateTime<Utc>,
        metadata: Option<serde_json::Value>,
    ) -> AuthResult<CreatedPat>;
    async fn link_id_token(
        &self,
        access_token: &str,
        provider: &str,
        id_token: &str,
        nonce: Option<&str>,
    ) -> AuthResult<()>;
    async fn add_security_key_challenge(&self, access_token: &str)
        -> AuthResult<serde_json::Value>;
    async fn add_security_key_verify(
        &self,
        access_token: &str,
        credential: serde_json::Value,
        nickname: Option<&str>,
    ) -> AuthResult<SecurityKey>;
}

/// Map a transport failure to the error taxonomy: anything that never
/// produced a response is a network error.
pub(crate) fn request_error(error: reqwest::Error) -> AuthError {
    if error.is_connect() || error.is_timeout() || error.is_request() {
        AuthError::network(error.to_string())
    } else {
        AuthError::other(error.to_string())
    }
}

/// reqwest-backed [`AuthApi`].
#[derive(Clone)]
pub struct HttpAuthApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpAuthApi {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn endpoint(&self, path: &str) -> AuthResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|error| AuthError::other(format!("Invalid endpoint {path}: {error}")))
    }

    async fn decode_error(response: reqwest::Response) -> AuthError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(parsed) => AuthError::api(
                status,
                parsed.error.unwrap_or_else(|| "unknown".to_string()),
                parsed
                    .message
                    .unwrap_or_else(|| format!("Request failed with status {status}")),
            ),
            Err(_) => AuthError::api(
                status,
                "unknown",
                format!("Request failed with status {status}"),
            ),
        }
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> AuthResult<T> {
        let url = self.endpoint(path)?;
        tracing::debug!(%url, "POST");
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(request_error)?;
        if !response.status().is_success() {
            let error = Self::decode_error(response).await;
            tracing::debug!(path, %error, "Request rejected");
            return Err(error);
        }
        response
            .json()
            .await
            .map_err(|error| AuthError::other(format!("Malformed response body: {error}")))
    }

    async fn post_no_content<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> AuthResult<()> {
        let url = self.endpoint(path)?;
        tracing::debug!(%url, "POST");
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(Self::decode_error(response).await);
        }
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, bearer: &str) -> AuthResult<T> {
        let url = self.endpoint(path)?;
        tracing::debug!(%url, "GET");
        let response = self
            .client
            .get(url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(Self::decode_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|error| AuthError::other(format!("Malformed response body: {error}")))
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn refresh_token(&self, refresh_token: &str) -> AuthResult<Session> {
        self.post(
            "/token",
            &serde_json::json!({ "refreshToken": refresh_token }),
            None,
        )
        .await
    }

    async fn sign_out(&self, refresh_token: &str, all: bool) -> AuthResult<()> {
        self.post_no_content(
            "/signout",
            &serde_json::json!({ "refreshToken": refresh_token, "all": all }),
            None,
        )
        .await
    }

    async fn sign_in_email_password(
        &self,
        email: &str,
        password: &str,
    ) -> AuthResult<SignInResponse> {
        self.post(
            "/signin/email-password",
            &serde_json::json!({ "email": email, "password": password }),
            None,
        )
        .await
    }

    async fn sign_in_anonymous(&self) -> AuthResult<Session> {
        let response: SignInResponse = self
            .post("/signin/anonymous", &serde_json::json!({}), None)
            .await?;
        response
            .session
            .ok_or_else(|| AuthError::other("Anonymous sign-in returned no session"))
    }

    async fn sign_in_pat(&self, pat: &str) -> AuthResult<Session> {
        let response: SignInResponse = self
            .post(
                "/signin/pat",
                &serde_json::json!({ "personalAccessToken": pat }),
                None,
            )
            .await?;
        response
            .session
            .ok_or_else(|| AuthError::other("PAT sign-in returned no session"))
    }

    async fn sign_in_id_token(
        &self,
        provider: &str,
        id_token: &str,
        nonce: Option<&str>,
    ) -> AuthResult<Session> {
        let response: SignInResponse = self
            .post(
                "/signin/idtoken",
                &serde_json::json!({
                    "provider": provider,
                    "idToken": id_token,
                    "nonce": nonce,
                }),
                None,
            )
            .await?;
        response
            .session
            .ok_or_else(|| AuthError::other("ID-token sign-in returned no session"))
    }

    async fn sign_in_mfa_totp(&self, otp: &str, ticket: &str) -> AuthResult<Session> {
        let response: SignInResponse = self
            .post(
                "/signin/mfa/totp",
                &serde_json::json!({ "otp": otp, "ticket": ticket }),
                None,
            )
            .await?;
        response
            .session
            .ok_or_else(|| AuthError::other("MFA sign-in returned no session"))
    }

    async fn sign_in_webauthn_challenge(
        &self,
        email: Option<&str>,
    ) -> AuthResult<serde_json::Value> {
        self.post(
            "/signin/webauthn",
            &serde_json::json!({ "email": email }),
            None,
        )
        .await
    }

    async fn sign_in_webauthn_verify(
        &self,
        email: Option<&str>,
        credential: serde_json::Value,
    ) -> AuthResult<Session> {
        let response: SignInResponse = self
            .post(
                "/signin/webauthn/verify",
                &serde_json::json!({ "email": email, "credential": credential }),
                None,
            )
            .await?;
        response
            .session
            .ok_or_else(|| AuthError::other("Security-key sign-in returned no session"))
    }

    async fn sign_in_passwordless_email(
        &self,
        email: &str,
        options: &SignUpOptions,
    ) -> AuthResult<()> {
        self.post_no_content(
            "/signin/passwordless/email",
            &serde_json::json!({ "email": email, "options": options }),
            None,
        )
        .await
    }

    async fn sign_in_passwordless_sms(
        &self,
        phone_number: &str,
        options: &SignUpOptions,
    ) -> AuthResult<()> {
        self.post_no_content(
            "/signin/passwordless/sms",
            &serde_json::json!({ "phoneNumber": phone_number, "options": options }),
            None,
        )
        .await
    }

    async fn sign_in_sms_otp(&self, phone_number: &str, otp: &str) -> AuthResult<Session> {
        let response: SignInResponse = self
            .post(
                "/signin/passwordless/sms/otp",
                &serde_json::json!({ "phoneNumber": phone_number, "otp": otp }),
                None,
            )
            .await?;
        response
            .session
            .ok_or_else(|| AuthError::other("SMS OTP verification returned no session"))
    }

    async fn sign_in_email_otp(&self, email: &str) -> AuthResult<()> {
        self.post_no_content(
            "/signin/otp/email",
            &serde_json::json!({ "email": email }),
            None,
        )
        .await
    }

    async fn verify_email_otp(&self, email: &str, otp: &str) -> AuthResult<Session> {
        let response: SignInResponse = self
            .post(
                "/signin/otp/email/verify",
                &serde_json::json!({ "email": email, "otp": otp }),
                None,
            )
            .await?;
        response
            .session
            .ok_or_else(|| AuthError::other("Email OTP verification returned no session"))
    }

    async fn sign_up_email_password(
        &self,
        email: &str,
        password: &str,
        options: &SignUpOptions,
    ) -> AuthResult<SignUpResponse> {
        self.post(
            "/signup/email-password",
            &serde_json::json!({ "email": email, "password": password, "options": options }),
            None,
        )
        .await
    }

    async fn sign_up_webauthn_challenge(
        &self,
        email: &str,
        options: &SignUpOptions,
    ) -> AuthResult<serde_json::Value> {
        self.post(
            "/signup/webauthn",
            &serde_json::json!({ "email": email, "options": options }),
            None,
        )
        .await
    }

    async fn sign_up_webauthn_verify(
        &self,
        credential: serde_json::Value,
        options: &SignUpOptions,
    ) -> AuthResult<SignUpResponse> {
        self.post(
            "/signup/webauthn/verify",
            &serde_json::json!({ "credential": credential, "options": options }),
            None,
        )
        .await
    }

    async fn deanonymize(
        &self,
        access_token: &str,
        method: DeanonymizeMethod,
        email: &str,
        password: Option<&str>,
        options: &SignUpOptions,
    ) -> AuthResult<()> {
        self.post_no_content(
            "/user/deanonymize",
            &serde_json::json!({
                "signInMethod": method,
                "email": email,
                "password": password,
                "options": options,
            }),
            Some(access_token),
        )
        .await
    }

    async fn change_password(
        &self,
        access_token: Option<&str>,
        new_password: &str,
        ticket: Option<&str>,
    ) -> AuthResult<()> {
        self.post_no_content(
            "/user/password",
            &serde_json::json!({ "newPassword": new_password, "ticket": ticket }),
            access_token,
        )
        .await
    }

    async fn reset_password(&self, email: &str, redirect_to: Option<&str>) -> AuthResult<()> {
        self.post_no_content(
            "/user/password/reset",
            &serde_json::json!({ "email": email, "options": { "redirectTo": redirect_to } }),
            None,
        )
        .await
    }

    async fn change_email(
        &self,
        access_token: &str,
        new_email: &str,
        redirect_to: Option<&str>,
    ) -> AuthResult<()> {
        self.post_no_content(
            "/user/email/change",
            &serde_json::json!({ "newEmail": new_email, "options": { "redirectTo": redirect_to } }),
            Some(access_token),
        )
        .await
    }

    async fn send_verification_email(
        &self,
        email: &str,
        redirect_to: Option<&str>,
    ) -> AuthResult<()> {
        self.post_no_content(
            "/user/email/send-verification-email",
            &serde_json::json!({ "email": email, "options": { "redirectTo": redirect_to } }),
            None,
        )
        .await
    }

    async fn set_mfa(
        &self,
        access_token: &str,
        code: &str,
        active_mfa_type: &str,
    ) -> AuthResult<()> {
        self.post_no_content(
            "/user/mfa",
            &serde_json::json!({ "code": code, "activeMfaType": active_mfa_type }),
            Some(access_token),
        )
        .await
    }

    async fn generate_totp_secret(&self, access_token: &str) -> AuthResult<TotpSecret> {
        self.get("/mfa/totp/generate", access_token).await
    }

    async fn create_pat(
        &self,
        access_token: &str,
        expires_at: DateTime<Utc>,
        metadata: Option<serde_json::Value>,
    ) -> AuthResult<CreatedPat> {
        self.post(
            "/pat",
            &serde_json::json!({
                "expiresAt": expires_at.to_rfc3339(),
                "metadata": metadata,
            }),
            Some(access_token),
        )
        .await
    }

    async fn link_id_token(
        &self,
        access_token: &str,
        provider: &str,
        id_token: &str,
        nonce: Option<&str>,
    ) -> AuthResult<()> {
        self.post_no_content(
            "/link/idtoken",
            &serde_json::json!({
                "provider": provider,
                "idToken": id_token,
                "nonce": nonce,
            }),
            Some(access_token),
        )
        .await
    }

    async fn add_security_key_challenge(
        &self,
        access_token: &str,
    ) -> AuthResult<serde_json::Value> {
        self.post("/user/webauthn/add", &serde_json::json!({}), Some(access_token))
            .await
    }

    async fn add_security_key_verify(
        &self,
        access_token: &str,
        credential: serde_json::Value,
        nickname: Option<&str>,
    ) -> AuthResult<SecurityKey> {
        self.post(
            "/user/webauthn/verify",
            &serde_json::json!({ "credential": credential, "nickname": nickname }),
            Some(access_token),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_join_keeps_base_path() {
        let api = HttpAuthApi::new(Url::parse("https://auth.example.com/v1/").unwrap());
        assert_eq!(
            api.endpoint("/signin/email-password").unwrap().as_str(),
            "https://auth.example.com/v1/signin/email-password"
        );
    }

    #[test]
    fn sign_in_response_decodes_mfa_only_body() {
        let response: SignInResponse =
            serde_json::from_str(r#"{"session":null,"mfa":{"ticket":"mfaTotp:abc"}}"#).unwrap();
        assert!(response.session.is_none());
        assert_eq!(response.mfa.unwrap().ticket, "mfaTotp:abc");
    }

    #[test]
    fn deanonymize_method_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_value(DeanonymizeMethod::EmailPassword).unwrap(),
            "email-password"
        );
        assert_eq!(
            serde_json::to_value(DeanonymizeMethod::Passwordless).unwrap(),
            "passwordless"
        );
    }
}
