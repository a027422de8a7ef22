//! Startup token import.
//!
//! Runs once when the machine enters `starting` (and again on each retry).
//! Precedence: a complete in-memory session short-circuits inside the
//! machine before this service is ever invoked; here the order is URL
//! token first (when auto-sign-in is enabled), then the persisted refresh
//! token.

use crate::backend::AuthApi;
use auth_machine::error::SOCIAL_USER_ALREADY_EXISTS;
use auth_machine::{AuthError, AuthResult, Session, UrlParamKeys, UrlParams};
use session_storage::SessionStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct TokenImporter {
    api: Arc<dyn AuthApi>,
    store: Arc<SessionStore>,
    url: Arc<dyn UrlParams>,
    auto_sign_in: bool,
}

impl TokenImporter {
    pub fn new(
        api: Arc<dyn AuthApi>,
        store: Arc<SessionStore>,
        url: Arc<dyn UrlParams>,
        auto_sign_in: bool,
    ) -> Self {
        Self {
            api,
            store,
            url,
            auto_sign_in,
        }
    }

    fn strip_url_params(&self) {
        for name in [
            UrlParamKeys::REFRESH_TOKEN,
            UrlParamKeys::TYPE,
            UrlParamKeys::ERROR,
            UrlParamKeys::ERROR_DESCRIPTION,
        ] {
            self.url.remove(name);
        }
    }

    /// Attempt to resume a session. `Ok(None)` means no credentials were
    /// found anywhere; the holder simply starts signed out.
    pub async fn import(&self) -> AuthResult<Option<Session>> {
        if self.auto_sign_in {
            if let Some(error) = self.url.get(UrlParamKeys::ERROR) {
                let description = self
                    .url
                    .get(UrlParamKeys::ERROR_DESCRIPTION)
                    .unwrap_or_else(|| error.clone());
                self.strip_url_params();
                tracing::warn!(error, "Redirect carried an authentication error");
                return Err(AuthError::validation(error, description));
            }

            if let Some(token) = self.url.get(UrlParamKeys::REFRESH_TOKEN) {
                self.strip_url_params();
                tracing::debug!("Exchanging one-time URL refresh token");
                match self.api.refresh_token(&token).await {
                    Ok(session) => return Ok(Some(session)),
                    // The account already existed under a social provider;
                    // fall back to any persisted token instead of failing
                    Err(error) if error.code() == SOCIAL_USER_ALREADY_EXISTS => {
                        tracing::debug!("URL token belongs to an existing social user");
                    }
                    Err(error) => return Err(error),
                }
            }
        }

        let persisted = match self.store.load() {
            Ok(persisted) => persisted,
            Err(error) => return Err(AuthError::from(error)),
        };
        match persisted {
            Some(persisted) => {
                tracing::debug!("Exchanging persisted refresh token");
                let session = self.api.refresh_token(&persisted.refresh_token).await?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }
}
