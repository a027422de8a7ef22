//! Async client façade.
//!
//! One [`AuthClient`] wraps one machine instance. All machine mutation
//! happens on a driver task fed by an mpsc queue, so transitions run to
//! completion in order without locks. Each operation sends its event, then
//! resolves or rejects by watching the transition stream for the matching
//! terminal state; an event every region's guard rejected resolves
//! immediately with a state-conflict error instead of waiting forever.

use crate::backend::{AuthApi, CreatedPat, DeanonymizeMethod, HttpAuthApi, SecurityKey, TotpSecret};
use crate::bootstrap::TokenImporter;
use crate::hub::{BroadcastHub, Envelope};
use crate::validators::{
    validate_email, validate_mfa_ticket, validate_password, validate_phone_number,
};
use async_trait::async_trait;
use auth_machine::{
    AuthError, AuthEvent, AuthMachine, AuthResult, AuthenticationState, BroadcastMessage, Command,
    ErrorCategory, MachineConfig, MfaChallenge, NoBroadcast, NoUrlParams, RegistrationState,
    RegistrationStatus, ServiceCall, ServiceOutcome, ServiceResult, Session, SessionBroadcast,
    SignUpOptions, SignedOutStatus, StateSnapshot, TokenState, TokenStatus, UrlParams, User,
    REFRESH_TICK_MS,
};
use chrono::{DateTime, Utc};
use session_storage::{MemoryStorage, SessionStorage, SessionStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use url::Url;
use uuid::Uuid;

/// Client-side half of a WebAuthn ceremony. The machine fetches the
/// challenge options and posts the credential; turning options into a
/// credential requires a platform authenticator the core cannot provide.
#[async_trait]
pub trait SecurityKeyCeremony: Send + Sync {
    /// Registration ceremony (`navigator.credentials.create` equivalent).
    async fn create(&self, options: serde_json::Value) -> AuthResult<serde_json::Value>;
    /// Authentication ceremony (`navigator.credentials.get` equivalent).
    async fn get(&self, options: serde_json::Value) -> AuthResult<serde_json::Value>;
}

/// Default ceremony for holders without an authenticator.
pub struct UnsupportedCeremony;

#[async_trait]
impl SecurityKeyCeremony for UnsupportedCeremony {
    async fn create(&self, _options: serde_json::Value) -> AuthResult<serde_json::Value> {
        Err(AuthError::validation(
            "security-keys-not-supported",
            "No security key authenticator is available",
        ))
    }

    async fn get(&self, _options: serde_json::Value) -> AuthResult<serde_json::Value> {
        Err(AuthError::validation(
            "security-keys-not-supported",
            "No security key authenticator is available",
        ))
    }
}

/// Outcome of a password sign-in: a session, an MFA challenge to complete,
/// or a parked needs-verification state.
#[derive(Debug, Clone)]
pub struct SignInResult {
    pub session: Option<Session>,
    pub mfa: Option<MfaChallenge>,
    pub needs_email_verification: bool,
}

#[derive(Debug, Clone)]
pub struct SignUpResult {
    pub session: Option<Session>,
    pub needs_email_verification: bool,
}

pub struct AuthClientBuilder {
    backend_url: String,
    storage: Option<Box<dyn SessionStorage>>,
    broadcast_key: Option<String>,
    auto_refresh: bool,
    auto_sign_in: bool,
    refresh_interval: Option<Duration>,
    initial_session: Option<Session>,
    url_params: Option<Arc<dyn UrlParams>>,
    ceremony: Option<Arc<dyn SecurityKeyCeremony>>,
    api: Option<Arc<dyn AuthApi>>,
}

impl AuthClientBuilder {
    pub fn storage(mut self, storage: Box<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Share session updates and sign-outs with other clients using the
    /// same key.
    pub fn broadcast_key(mut self, key: impl Into<String>) -> Self {
        self.broadcast_key = Some(key.into());
        self
    }

    pub fn auto_refresh(mut self, enabled: bool) -> Self {
        self.auto_refresh = enabled;
        self
    }

    pub fn auto_sign_in(mut self, enabled: bool) -> Self {
        self.auto_sign_in = enabled;
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Externally supplied starting session (server-rendered hydration);
    /// short-circuits the startup token import.
    pub fn initial_session(mut self, session: Session) -> Self {
        self.initial_session = Some(session);
        self
    }

    pub fn url_params(mut self, params: Arc<dyn UrlParams>) -> Self {
        self.url_params = Some(params);
        self
    }

    pub fn security_key_ceremony(mut self, ceremony: Arc<dyn SecurityKeyCeremony>) -> Self {
        self.ceremony = Some(ceremony);
        self
    }

    /// Replace the HTTP backend, mainly for tests.
    pub fn api(mut self, api: Arc<dyn AuthApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Spawn the driver task and return the client. Must be called within
    /// a Tokio runtime.
    pub fn build(self) -> AuthResult<AuthClient> {
        let api: Arc<dyn AuthApi> = match self.api {
            Some(api) => api,
            None => {
                let mut base = self.backend_url;
                if !base.ends_with('/') {
                    base.push('/');
                }
                let base = Url::parse(&base)
                    .map_err(|error| AuthError::other(format!("Invalid backend URL: {error}")))?;
                Arc::new(HttpAuthApi::new(base))
            }
        };
        let store = Arc::new(SessionStore::new(
            self.storage
                .unwrap_or_else(|| Box::new(MemoryStorage::new())),
        ));
        let url: Arc<dyn UrlParams> = self.url_params.unwrap_or_else(|| Arc::new(NoUrlParams));
        let ceremony: Arc<dyn SecurityKeyCeremony> =
            self.ceremony.unwrap_or_else(|| Arc::new(UnsupportedCeremony));

        let holder = Uuid::new_v4();
        let (broadcaster, broadcast_rx): (Box<dyn SessionBroadcast>, _) = match self.broadcast_key {
            Some(key) => {
                let (poster, rx) = BroadcastHub::global().connect(&key, holder);
                (Box::new(poster), Some(rx))
            }
            None => (Box::new(NoBroadcast), None),
        };

        let config = MachineConfig {
            auto_refresh: self.auto_refresh,
            auto_sign_in: self.auto_sign_in,
            refresh_interval: self.refresh_interval,
        };
        let machine = AuthMachine::new(
            config,
            store.clone(),
            broadcaster,
            url.clone(),
            self.initial_session,
            Utc::now(),
        );
        let importer = TokenImporter::new(api.clone(), store, url, self.auto_sign_in);

        let (event_tx, event_rx) = mpsc::channel(64);
        let (watch_tx, watch_rx) = watch::channel(machine.snapshot());
        let (transition_tx, _) = broadcast::channel(256);

        let driver = Driver {
            machine,
            api: api.clone(),
            importer,
            ceremony: ceremony.clone(),
            loop_tx: event_tx.clone(),
            watch_tx,
            transition_tx: transition_tx.clone(),
            holder,
        };
        tokio::spawn(driver.run(event_rx, broadcast_rx));

        Ok(AuthClient {
            events: event_tx,
            watch: watch_rx,
            transitions: transition_tx,
            api,
            ceremony,
        })
    }
}

type EventEnvelope = (AuthEvent, Option<oneshot::Sender<bool>>);

struct Driver {
    machine: AuthMachine,
    api: Arc<dyn AuthApi>,
    importer: TokenImporter,
    ceremony: Arc<dyn SecurityKeyCeremony>,
    loop_tx: mpsc::Sender<EventEnvelope>,
    watch_tx: watch::Sender<StateSnapshot>,
    transition_tx: broadcast::Sender<StateSnapshot>,
    holder: Uuid,
}

impl Driver {
    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<EventEnvelope>,
        mut broadcast_rx: Option<broadcast::Receiver<Envelope>>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_millis(REFRESH_TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await; // the first tick completes immediately

        let commands = self.machine.start(Utc::now());
        self.publish();
        self.execute(commands);

        // Every client handle holds a watch receiver; once the last one is
        // dropped there is nobody left to observe the machine
        let clients_gone = self.watch_tx.clone();
        loop {
            tokio::select! {
                received = event_rx.recv() => {
                    let Some((event, ack)) = received else { break };
                    self.step(event, ack);
                }
                _ = tick.tick() => {
                    self.step(AuthEvent::Tick, None);
                }
                envelope = recv_broadcast(&mut broadcast_rx) => {
                    if let Some(event) = self.map_broadcast(envelope) {
                        self.step(event, None);
                    }
                }
                _ = clients_gone.closed() => break,
            }
        }
        tracing::debug!("Auth client driver stopped");
    }

    fn step(&mut self, event: AuthEvent, ack: Option<oneshot::Sender<bool>>) {
        let result = self.machine.handle(event, Utc::now());
        if let Some(ack) = ack {
            let _ = ack.send(result.changed);
        }
        if result.changed {
            self.publish();
        }
        self.execute(result.commands);
    }

    fn publish(&self) {
        let snapshot = self.machine.snapshot();
        let _ = self.watch_tx.send(snapshot.clone());
        let _ = self.transition_tx.send(snapshot);
    }

    fn execute(&self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Invoke { id, call } => {
                    let api = self.api.clone();
                    let importer = self.importer.clone();
                    let ceremony = self.ceremony.clone();
                    let snapshot = self.machine.snapshot();
                    let events = self.loop_tx.clone();
                    tokio::spawn(async move {
                        let outcome = run_service(api, importer, ceremony, snapshot, call).await;
                        let _ = events
                            .send((AuthEvent::ServiceDone { id, outcome }, None))
                            .await;
                    });
                }
                Command::ScheduleImportRetry { delay } => {
                    let events = self.loop_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = events.send((AuthEvent::RetryImport, None)).await;
                    });
                }
            }
        }
    }

    fn map_broadcast(&self, envelope: Option<Envelope>) -> Option<AuthEvent> {
        let envelope = envelope?;
        if envelope.sender == self.holder {
            return None;
        }
        match BroadcastMessage::decode(&envelope.raw)? {
            BroadcastMessage::BroadcastSession { payload } => Some(AuthEvent::SessionUpdate {
                session: Session {
                    access_token: payload.access_token,
                    access_token_expires_in: payload.expires_in_seconds,
                    refresh_token: payload.token,
                    refresh_token_id: None,
                    user: payload.user,
                },
            }),
            // Token-only messages carry no user; the full-session message
            // that accompanies them is the one we act on
            BroadcastMessage::BroadcastToken { .. } => None,
            BroadcastMessage::Signout => Some(AuthEvent::SignOut { all: false }),
        }
    }
}

async fn recv_broadcast(rx: &mut Option<broadcast::Receiver<Envelope>>) -> Option<Envelope> {
    match rx {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Broadcast receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
            }
        },
        None => std::future::pending().await,
    }
}

fn anonymous_access_token(snapshot: &StateSnapshot) -> Option<String> {
    let user = snapshot.context.user.as_ref()?;
    if user.is_anonymous {
        snapshot.context.access_token.value.clone()
    } else {
        None
    }
}

async fn run_service(
    api: Arc<dyn AuthApi>,
    importer: TokenImporter,
    ceremony: Arc<dyn SecurityKeyCeremony>,
    snapshot: StateSnapshot,
    call: ServiceCall,
) -> ServiceOutcome {
    let result: AuthResult<ServiceResult> = async {
        match call {
            ServiceCall::ImportToken => Ok(match importer.import().await? {
                Some(session) => ServiceResult::with_session(session),
                None => ServiceResult::empty(),
            }),
            ServiceCall::RefreshToken { refresh_token } => Ok(ServiceResult::with_session(
                api.refresh_token(&refresh_token).await?,
            )),
            ServiceCall::SignOut { refresh_token, all } => {
                api.sign_out(&refresh_token, all).await?;
                Ok(ServiceResult::empty())
            }
            ServiceCall::SignInPassword { email, password } => {
                let response = api.sign_in_email_password(&email, &password).await?;
                Ok(ServiceResult {
                    session: response.session,
                    mfa: response.mfa,
                })
            }
            ServiceCall::SignInAnonymous => {
                Ok(ServiceResult::with_session(api.sign_in_anonymous().await?))
            }
            ServiceCall::SignInPat { pat } => {
                Ok(ServiceResult::with_session(api.sign_in_pat(&pat).await?))
            }
            ServiceCall::SignInIdToken {
                provider,
                id_token,
                nonce,
            } => Ok(ServiceResult::with_session(
                api.sign_in_id_token(&provider, &id_token, nonce.as_deref())
                    .await?,
            )),
            ServiceCall::SignInMfaTotp { otp, ticket } => Ok(ServiceResult::with_session(
                api.sign_in_mfa_totp(&otp, &ticket).await?,
            )),
            ServiceCall::SignInSecurityKey { email } => {
                let options = api.sign_in_webauthn_challenge(email.as_deref()).await?;
                let credential = ceremony.get(options).await?;
                Ok(ServiceResult::with_session(
                    api.sign_in_webauthn_verify(email.as_deref(), credential)
                        .await?,
                ))
            }
            ServiceCall::SignInSmsOtp { phone_number, otp } => Ok(ServiceResult::with_session(
                api.sign_in_sms_otp(&phone_number, &otp).await?,
            )),
            ServiceCall::SignUpEmailPassword {
                email,
                password,
                options,
            } => match anonymous_access_token(&snapshot) {
                Some(token) => {
                    api.deanonymize(
                        &token,
                        DeanonymizeMethod::EmailPassword,
                        &email,
                        Some(&password),
                        &options,
                    )
                    .await?;
                    Ok(ServiceResult::empty())
                }
                None => {
                    let response = api.sign_up_email_password(&email, &password, &options).await?;
                    Ok(ServiceResult {
                        session: response.session,
                        mfa: None,
                    })
                }
            },
            ServiceCall::SignUpSecurityKey { email, options } => {
                let challenge = api.sign_up_webauthn_challenge(&email, &options).await?;
                let credential = ceremony.create(challenge).await?;
                let response = api.sign_up_webauthn_verify(credential, &options).await?;
                Ok(ServiceResult {
                    session: response.session,
                    mfa: None,
                })
            }
            ServiceCall::PasswordlessEmail { email, options } => {
                match anonymous_access_token(&snapshot) {
                    Some(token) => {
                        api.deanonymize(
                            &token,
                            DeanonymizeMethod::Passwordless,
                            &email,
                            None,
                            &options,
                        )
                        .await?
                    }
                    None => api.sign_in_passwordless_email(&email, &options).await?,
                }
                Ok(ServiceResult::empty())
            }
            ServiceCall::PasswordlessSms {
                phone_number,
                options,
            } => {
                api.sign_in_passwordless_sms(&phone_number, &options).await?;
                Ok(ServiceResult::empty())
            }
            ServiceCall::SignInEmailOtp { email } => {
                api.sign_in_email_otp(&email).await?;
                Ok(ServiceResult::empty())
            }
            ServiceCall::VerifyEmailOtp { email, otp } => Ok(ServiceResult::with_session(
                api.verify_email_otp(&email, &otp).await?,
            )),
        }
    }
    .await;

    match result {
        Ok(result) => ServiceOutcome::Ok(result),
        Err(error) => ServiceOutcome::Err(error),
    }
}

/// Handle to a running auth client. Cheap to clone.
#[derive(Clone)]
pub struct AuthClient {
    events: mpsc::Sender<EventEnvelope>,
    watch: watch::Receiver<StateSnapshot>,
    transitions: broadcast::Sender<StateSnapshot>,
    api: Arc<dyn AuthApi>,
    ceremony: Arc<dyn SecurityKeyCeremony>,
}

impl AuthClient {
    pub fn builder(backend_url: impl Into<String>) -> AuthClientBuilder {
        AuthClientBuilder {
            backend_url: backend_url.into(),
            storage: None,
            broadcast_key: None,
            auto_refresh: true,
            auto_sign_in: true,
            refresh_interval: None,
            initial_session: None,
            url_params: None,
            ceremony: None,
            api: None,
        }
    }

    // --- state access ---

    pub fn snapshot(&self) -> StateSnapshot {
        self.watch.borrow().clone()
    }

    /// Subscribe to every machine transition.
    pub fn subscribe(&self) -> broadcast::Receiver<StateSnapshot> {
        self.transitions.subscribe()
    }

    pub fn is_signed_in(&self) -> bool {
        self.watch.borrow().is_signed_in()
    }

    pub fn session(&self) -> Option<Session> {
        self.watch.borrow().context.current_session()
    }

    pub fn user(&self) -> Option<User> {
        self.watch.borrow().context.user.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.watch.borrow().context.access_token.value.clone()
    }

    /// Wait for the startup import to settle.
    pub async fn wait_until_ready(&self) -> AuthResult<()> {
        let mut rx = self.subscribe();
        if !self.watch.borrow().is_loading() {
            return Ok(());
        }
        loop {
            let snapshot = recv_transition(&mut rx).await?;
            if !snapshot.is_loading() {
                return Ok(());
            }
        }
    }

    // --- sign-in operations ---

    pub async fn sign_in_email_password(
        &self,
        email: &str,
        password: &str,
    ) -> AuthResult<SignInResult> {
        validate_email(email)?;
        validate_password(password)?;
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::SignInPassword {
                email: email.to_string(),
                password: password.to_string(),
            },
            AuthError::already_signed_in(),
        )
        .await?;
        await_sign_in(rx).await
    }

    pub async fn sign_in_anonymous(&self) -> AuthResult<Session> {
        let rx = self.subscribe();
        self.send_or_conflict(AuthEvent::SignInAnonymous, AuthError::already_signed_in())
            .await?;
        await_session(rx).await
    }

    pub async fn sign_in_pat(&self, pat: &str) -> AuthResult<Session> {
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::SignInPat {
                pat: pat.to_string(),
            },
            AuthError::already_signed_in(),
        )
        .await?;
        await_session(rx).await
    }

    pub async fn sign_in_id_token(
        &self,
        provider: &str,
        id_token: &str,
        nonce: Option<&str>,
    ) -> AuthResult<Session> {
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::SignInIdToken {
                provider: provider.to_string(),
                id_token: id_token.to_string(),
                nonce: nonce.map(str::to_string),
            },
            AuthError::already_signed_in(),
        )
        .await?;
        await_session(rx).await
    }

    pub async fn sign_in_security_key(&self, email: Option<&str>) -> AuthResult<Session> {
        if let Some(email) = email {
            validate_email(email)?;
        }
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::SignInSecurityKey {
                email: email.map(str::to_string),
            },
            AuthError::already_signed_in(),
        )
        .await?;
        await_session(rx).await
    }

    /// Complete a password sign-in that answered with an MFA challenge.
    /// Without an explicit ticket, the one stored from the challenge is
    /// used.
    pub async fn sign_in_mfa_totp(&self, otp: &str, ticket: Option<&str>) -> AuthResult<Session> {
        if let Some(ticket) = ticket {
            validate_mfa_ticket(ticket)?;
        }
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::SignInMfaTotp {
                otp: otp.to_string(),
                ticket: ticket.map(str::to_string),
            },
            AuthError::already_signed_in(),
        )
        .await?;
        await_session(rx).await
    }

    pub async fn sign_in_passwordless_email(
        &self,
        email: &str,
        options: SignUpOptions,
    ) -> AuthResult<()> {
        validate_email(email)?;
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::PasswordlessEmail {
                email: email.to_string(),
                options,
            },
            AuthError::already_signed_in(),
        )
        .await?;
        await_registration_parked(rx, RegistrationStatus::NeedsEmailVerification).await
    }

    pub async fn sign_in_passwordless_sms(
        &self,
        phone_number: &str,
        options: SignUpOptions,
    ) -> AuthResult<()> {
        validate_phone_number(phone_number)?;
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::PasswordlessSms {
                phone_number: phone_number.to_string(),
                options,
            },
            AuthError::already_signed_in(),
        )
        .await?;
        await_registration_parked(rx, RegistrationStatus::NeedsOtp).await
    }

    pub async fn sign_in_sms_otp(&self, phone_number: &str, otp: &str) -> AuthResult<Session> {
        validate_phone_number(phone_number)?;
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::SignInSmsOtp {
                phone_number: phone_number.to_string(),
                otp: otp.to_string(),
            },
            AuthError::already_signed_in(),
        )
        .await?;
        await_registration_session(rx).await
    }

    pub async fn sign_in_email_otp(&self, email: &str) -> AuthResult<()> {
        validate_email(email)?;
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::SignInEmailOtp {
                email: email.to_string(),
            },
            AuthError::already_signed_in(),
        )
        .await?;
        await_registration_parked(rx, RegistrationStatus::NeedsOtp).await
    }

    pub async fn verify_email_otp(&self, email: &str, otp: &str) -> AuthResult<Session> {
        validate_email(email)?;
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::VerifyEmailOtp {
                email: email.to_string(),
                otp: otp.to_string(),
            },
            AuthError::already_signed_in(),
        )
        .await?;
        await_registration_session(rx).await
    }

    // --- sign-up operations ---

    pub async fn sign_up_email_password(
        &self,
        email: &str,
        password: &str,
        options: SignUpOptions,
    ) -> AuthResult<SignUpResult> {
        validate_email(email)?;
        validate_password(password)?;
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::SignUpEmailPassword {
                email: email.to_string(),
                password: password.to_string(),
                options,
            },
            AuthError::already_signed_in(),
        )
        .await?;
        await_sign_up(rx).await
    }

    pub async fn sign_up_security_key(
        &self,
        email: &str,
        options: SignUpOptions,
    ) -> AuthResult<SignUpResult> {
        validate_email(email)?;
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::SignUpSecurityKey {
                email: email.to_string(),
                options,
            },
            AuthError::already_signed_in(),
        )
        .await?;
        await_sign_up(rx).await
    }

    // --- session lifecycle ---

    pub async fn sign_out(&self, all: bool) -> AuthResult<()> {
        let rx = self.subscribe();
        self.send_or_conflict(AuthEvent::SignOut { all }, AuthError::not_signed_in())
            .await?;
        await_sign_out(rx).await
    }

    /// Exchange a refresh token for a fresh session, forcing the signed-in
    /// state on success. Without an explicit token the current one is used.
    pub async fn refresh_session(&self, refresh_token: Option<&str>) -> AuthResult<Session> {
        let token = match refresh_token.map(str::to_string) {
            Some(token) => token,
            None => self
                .watch
                .borrow()
                .context
                .refresh_token
                .value
                .clone()
                .ok_or_else(AuthError::not_signed_in)?,
        };
        let rx = self.subscribe();
        self.send_or_conflict(
            AuthEvent::TryToken { token },
            AuthError::state("refresher-already-running", "A token refresh is already running"),
        )
        .await?;
        await_token_region(rx).await
    }

    // --- user management (direct authenticated calls) ---

    pub async fn change_password(&self, new_password: &str, ticket: Option<&str>) -> AuthResult<()> {
        validate_password(new_password)?;
        let access_token = self.access_token();
        if access_token.is_none() && ticket.is_none() {
            return Err(AuthError::not_signed_in());
        }
        self.api
            .change_password(access_token.as_deref(), new_password, ticket)
            .await
    }

    pub async fn reset_password(&self, email: &str, redirect_to: Option<&str>) -> AuthResult<()> {
        validate_email(email)?;
        self.api.reset_password(email, redirect_to).await
    }

    pub async fn change_email(&self, new_email: &str, redirect_to: Option<&str>) -> AuthResult<()> {
        validate_email(new_email)?;
        let token = self.require_access_token()?;
        self.api.change_email(&token, new_email, redirect_to).await
    }

    pub async fn send_verification_email(
        &self,
        email: &str,
        redirect_to: Option<&str>,
    ) -> AuthResult<()> {
        validate_email(email)?;
        self.api.send_verification_email(email, redirect_to).await
    }

    /// Activate or deactivate TOTP MFA (`active_mfa_type` empty disables).
    pub async fn set_mfa(&self, code: &str, active_mfa_type: &str) -> AuthResult<()> {
        let token = self.require_access_token()?;
        self.api.set_mfa(&token, code, active_mfa_type).await
    }

    pub async fn generate_totp_secret(&self) -> AuthResult<TotpSecret> {
        let token = self.require_access_token()?;
        self.api.generate_totp_secret(&token).await
    }

    pub async fn create_pat(
        &self,
        expires_at: DateTime<Utc>,
        metadata: Option<serde_json::Value>,
    ) -> AuthResult<CreatedPat> {
        let token = self.require_access_token()?;
        self.api.create_pat(&token, expires_at, metadata).await
    }

    pub async fn link_id_token(
        &self,
        provider: &str,
        id_token: &str,
        nonce: Option<&str>,
    ) -> AuthResult<()> {
        let token = self.require_access_token()?;
        self.api
            .link_id_token(&token, provider, id_token, nonce)
            .await
    }

    /// Register an additional security key for the signed-in user.
    pub async fn add_security_key(&self, nickname: Option<&str>) -> AuthResult<SecurityKey> {
        let token = self.require_access_token()?;
        let options = self.api.add_security_key_challenge(&token).await?;
        let credential = self.ceremony.create(options).await?;
        self.api
            .add_security_key_verify(&token, credential, nickname)
            .await
    }

    // --- internals ---

    fn require_access_token(&self) -> AuthResult<String> {
        self.access_token().ok_or_else(AuthError::not_signed_in)
    }

    async fn send_or_conflict(&self, event: AuthEvent, conflict: AuthError) -> AuthResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.events
            .send((event, Some(ack_tx)))
            .await
            .map_err(|_| AuthError::other("Client driver stopped"))?;
        let accepted = ack_rx
            .await
            .map_err(|_| AuthError::other("Client driver stopped"))?;
        if accepted {
            Ok(())
        } else {
            Err(conflict)
        }
    }
}

async fn recv_transition(
    rx: &mut broadcast::Receiver<StateSnapshot>,
) -> AuthResult<StateSnapshot> {
    loop {
        match rx.recv().await {
            Ok(snapshot) => return Ok(snapshot),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                return Err(AuthError::other("Client driver stopped"))
            }
        }
    }
}

fn authentication_error(snapshot: &StateSnapshot) -> AuthError {
    snapshot
        .error(ErrorCategory::Authentication)
        .cloned()
        .unwrap_or_else(|| AuthError::other("Authentication failed"))
}

async fn await_sign_in(mut rx: broadcast::Receiver<StateSnapshot>) -> AuthResult<SignInResult> {
    loop {
        let snapshot = recv_transition(&mut rx).await?;
        match snapshot.authentication {
            AuthenticationState::SignedIn => {
                let session = snapshot
                    .context
                    .current_session()
                    .ok_or_else(|| AuthError::other("Signed in without a session"))?;
                return Ok(SignInResult {
                    session: Some(session),
                    mfa: None,
                    needs_email_verification: false,
                });
            }
            AuthenticationState::SignedOut(SignedOutStatus::NeedsMfa) => {
                return Ok(SignInResult {
                    session: None,
                    mfa: snapshot.context.mfa.clone(),
                    needs_email_verification: false,
                });
            }
            AuthenticationState::SignedOut(SignedOutStatus::Failed) => {
                return Err(authentication_error(&snapshot));
            }
            AuthenticationState::SignedOut(SignedOutStatus::NoErrors)
                if snapshot.registration
                    == RegistrationState::Incomplete(RegistrationStatus::NeedsEmailVerification) =>
            {
                return Ok(SignInResult {
                    session: None,
                    mfa: None,
                    needs_email_verification: true,
                });
            }
            _ => {}
        }
    }
}

async fn await_session(mut rx: broadcast::Receiver<StateSnapshot>) -> AuthResult<Session> {
    loop {
        let snapshot = recv_transition(&mut rx).await?;
        match snapshot.authentication {
            AuthenticationState::SignedIn => {
                return snapshot
                    .context
                    .current_session()
                    .ok_or_else(|| AuthError::other("Signed in without a session"));
            }
            AuthenticationState::SignedOut(SignedOutStatus::Failed) => {
                return Err(authentication_error(&snapshot));
            }
            AuthenticationState::SignedOut(SignedOutStatus::NeedsMfa) => {
                return Err(AuthError::state(
                    "mfa-required",
                    "A second authentication factor is required",
                ));
            }
            _ => {}
        }
    }
}

async fn await_sign_up(mut rx: broadcast::Receiver<StateSnapshot>) -> AuthResult<SignUpResult> {
    loop {
        let snapshot = recv_transition(&mut rx).await?;
        if snapshot.authentication == AuthenticationState::SignedIn
            && snapshot.registration == RegistrationState::Complete
        {
            return Ok(SignUpResult {
                session: snapshot.context.current_session(),
                needs_email_verification: false,
            });
        }
        match snapshot.registration {
            RegistrationState::Incomplete(RegistrationStatus::NeedsEmailVerification) => {
                return Ok(SignUpResult {
                    session: None,
                    needs_email_verification: true,
                });
            }
            RegistrationState::Incomplete(RegistrationStatus::Failed) => {
                return Err(snapshot
                    .error(ErrorCategory::Registration)
                    .cloned()
                    .unwrap_or_else(|| AuthError::other("Sign-up failed")));
            }
            _ => {}
        }
    }
}

async fn await_registration_parked(
    mut rx: broadcast::Receiver<StateSnapshot>,
    parked: RegistrationStatus,
) -> AuthResult<()> {
    loop {
        let snapshot = recv_transition(&mut rx).await?;
        match snapshot.registration {
            RegistrationState::Incomplete(status) if status == parked => return Ok(()),
            RegistrationState::Incomplete(RegistrationStatus::Failed) => {
                return Err(snapshot
                    .error(ErrorCategory::Registration)
                    .cloned()
                    .unwrap_or_else(|| AuthError::other("Request failed")));
            }
            _ => {}
        }
    }
}

async fn await_registration_session(
    mut rx: broadcast::Receiver<StateSnapshot>,
) -> AuthResult<Session> {
    loop {
        let snapshot = recv_transition(&mut rx).await?;
        if snapshot.authentication == AuthenticationState::SignedIn {
            return snapshot
                .context
                .current_session()
                .ok_or_else(|| AuthError::other("Signed in without a session"));
        }
        if snapshot.registration == RegistrationState::Incomplete(RegistrationStatus::Failed) {
            return Err(snapshot
                .error(ErrorCategory::Registration)
                .cloned()
                .unwrap_or_else(|| AuthError::other("Verification failed")));
        }
    }
}

async fn await_sign_out(mut rx: broadcast::Receiver<StateSnapshot>) -> AuthResult<()> {
    loop {
        let snapshot = recv_transition(&mut rx).await?;
        match snapshot.authentication {
            AuthenticationState::SignedOut(SignedOutStatus::Success) => return Ok(()),
            AuthenticationState::SignedOut(SignedOutStatus::Failed) => {
                return Err(snapshot
                    .error(ErrorCategory::Signout)
                    .cloned()
                    .unwrap_or_else(|| authentication_error(&snapshot)));
            }
            _ => {}
        }
    }
}

async fn await_token_region(mut rx: broadcast::Receiver<StateSnapshot>) -> AuthResult<Session> {
    let mut saw_running = false;
    loop {
        let snapshot = recv_transition(&mut rx).await?;
        match snapshot.token {
            TokenState::Running => saw_running = true,
            TokenState::Idle(TokenStatus::NoErrors) if saw_running => {
                return snapshot
                    .context
                    .current_session()
                    .ok_or_else(|| AuthError::other("Refresh returned no session"));
            }
            TokenState::Idle(TokenStatus::Error) => {
                return Err(snapshot
                    .error(ErrorCategory::Authentication)
                    .cloned()
                    .unwrap_or_else(|| {
                        AuthError::api(401, "invalid-refresh-token", "Token refresh failed")
                    }));
            }
            _ => {}
        }
    }
}
