//! The authentication state machine.
//!
//! Three top-level regions run in parallel: `authentication` (sign-in
//! lifecycle, with the refresh timer nested under `signedIn`), `token`
//! (directly supplied refresh tokens), and `registration` (sign-up flows).
//! The machine is synchronous; every transition runs to completion and
//! returns the commands the driver must execute. Service results re-enter
//! through [`AuthEvent::ServiceDone`] and are matched against the invocation
//! id each region is waiting for, so superseded invocations never mutate
//! the context.

use crate::broadcast::{BroadcastMessage, SessionBroadcast, SessionPayload, TokenPayload};
use crate::context::{ErrorCategory, Session, SessionContext};
use crate::error::AuthError;
use crate::events::{
    AuthEvent, Command, InternalEvent, InvokeId, ServiceCall, ServiceOutcome, ServiceResult,
};
use crate::scheduler::{should_refresh, Backoff};
use crate::url::{UrlParamKeys, UrlParams};
use chrono::{DateTime, Utc};
use session_storage::{PersistedSession, SessionStore};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Region A: the sign-in lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationState {
    Starting,
    RetryTokenImport,
    SignedOut(SignedOutStatus),
    Authenticating(SignInMethod),
    SignedIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedOutStatus {
    NoErrors,
    Success,
    NeedsSmsOtp,
    NeedsMfa,
    Failed,
    SigningOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInMethod {
    Password,
    Anonymous,
    Pat,
    IdToken,
    SecurityKey,
    MfaTotp,
}

/// Refresh timer, nested under `signedIn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTimerState {
    /// Auto-refresh off, or the token is a PAT.
    Disabled,
    Stopped,
    /// Waiting for a refresh token to appear.
    Idle,
    /// Ticking; the refresh decision is evaluated every tick.
    Pending,
    Refreshing,
}

/// Region B: directly supplied refresh tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Idle(TokenStatus),
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    NoErrors,
    Error,
}

/// Region C: sign-up flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Incomplete(RegistrationStatus),
    SigningUp(SignUpMethod),
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    NoErrors,
    NeedsEmailVerification,
    NeedsOtp,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignUpMethod {
    EmailPassword,
    SecurityKey,
    PasswordlessEmail,
    PasswordlessSms,
    SmsOtpVerify,
    EmailOtp,
    EmailOtpVerify,
}

impl AuthenticationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthenticationState::Starting => "starting",
            AuthenticationState::RetryTokenImport => "retryTokenImport",
            AuthenticationState::SignedOut(_) => "signedOut",
            AuthenticationState::Authenticating(_) => "authenticating",
            AuthenticationState::SignedIn => "signedIn",
        }
    }
}

/// Construction-time options.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Keep the access token fresh while signed in.
    pub auto_refresh: bool,
    /// Consume one-time URL parameters during bootstrap.
    pub auto_sign_in: bool,
    /// Optional caller-supplied ceiling on token age.
    pub refresh_interval: Option<Duration>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            auto_sign_in: true,
            refresh_interval: None,
        }
    }
}

/// Immutable view of the machine published after every step.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub authentication: AuthenticationState,
    pub timer: RefreshTimerState,
    pub token: TokenState,
    pub registration: RegistrationState,
    pub context: SessionContext,
}

impl StateSnapshot {
    pub fn is_loading(&self) -> bool {
        matches!(
            self.authentication,
            AuthenticationState::Starting | AuthenticationState::RetryTokenImport
        )
    }

    pub fn is_signed_in(&self) -> bool {
        self.authentication == AuthenticationState::SignedIn
    }

    pub fn error(&self, category: ErrorCategory) -> Option<&AuthError> {
        self.context.errors.get(&category)
    }
}

/// Result of feeding one event into the machine.
#[derive(Debug)]
pub struct StepResult {
    /// False when every region's guard rejected the event.
    pub changed: bool,
    pub commands: Vec<Command>,
}

pub struct AuthMachine {
    config: MachineConfig,
    ctx: SessionContext,
    authentication: AuthenticationState,
    timer: RefreshTimerState,
    token: TokenState,
    registration: RegistrationState,

    store: Arc<SessionStore>,
    broadcaster: Box<dyn SessionBroadcast>,
    url: Arc<dyn UrlParams>,

    next_invoke: u64,
    auth_invoke: Option<InvokeId>,
    timer_invoke: Option<InvokeId>,
    token_invoke: Option<InvokeId>,
    registration_invoke: Option<InvokeId>,

    internal: VecDeque<InternalEvent>,
}

impl AuthMachine {
    pub fn new(
        config: MachineConfig,
        store: Arc<SessionStore>,
        broadcaster: Box<dyn SessionBroadcast>,
        url: Arc<dyn UrlParams>,
        initial_session: Option<Session>,
        now: DateTime<Utc>,
    ) -> Self {
        let ctx = match &initial_session {
            Some(session) => SessionContext::from_initial_session(session, now),
            None => SessionContext::default(),
        };
        Self {
            config,
            ctx,
            authentication: AuthenticationState::Starting,
            timer: RefreshTimerState::Stopped,
            token: TokenState::Idle(TokenStatus::NoErrors),
            registration: RegistrationState::Incomplete(RegistrationStatus::NoErrors),
            store,
            broadcaster,
            url,
            next_invoke: 0,
            auth_invoke: None,
            timer_invoke: None,
            token_invoke: None,
            registration_invoke: None,
            internal: VecDeque::new(),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            authentication: self.authentication,
            timer: self.timer,
            token: self.token,
            registration: self.registration,
            context: self.ctx.clone(),
        }
    }

    /// Run the `starting` entry. A complete in-memory session short-circuits
    /// the import service.
    pub fn start(&mut self, now: DateTime<Utc>) -> Vec<Command> {
        let mut commands = Vec::new();
        if self.ctx.is_signed_in() {
            tracing::debug!("Bootstrapping from supplied initial session");
            self.enter_signed_in(now, &mut commands);
        } else {
            self.invoke_import(&mut commands);
        }
        self.drain_internal(now, &mut commands);
        commands
    }

    /// Feed one external event through the machine, then drain any synthetic
    /// events the transition re-injected.
    pub fn handle(&mut self, event: AuthEvent, now: DateTime<Utc>) -> StepResult {
        let mut commands = Vec::new();
        let changed = self.dispatch(event, now, &mut commands);
        self.drain_internal(now, &mut commands);
        StepResult { changed, commands }
    }

    fn drain_internal(&mut self, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        while let Some(event) = self.internal.pop_front() {
            self.dispatch_internal(event, now, commands);
        }
    }

    fn dispatch(&mut self, event: AuthEvent, now: DateTime<Utc>, commands: &mut Vec<Command>) -> bool {
        match event {
            AuthEvent::SessionUpdate { session } => self.on_session_update(session, now, commands),
            AuthEvent::TryToken { token } => self.on_try_token(token, commands),
            AuthEvent::SignOut { all } => self.on_sign_out(all, commands),
            AuthEvent::Tick => self.on_tick(now, commands),
            AuthEvent::RetryImport => self.on_retry_import(commands),
            AuthEvent::ServiceDone { id, outcome } => self.on_service_done(id, outcome, now, commands),

            AuthEvent::SignInPassword { email, password } => self.begin_sign_in(
                SignInMethod::Password,
                ServiceCall::SignInPassword { email, password },
                commands,
            ),
            AuthEvent::SignInAnonymous => {
                self.begin_sign_in(SignInMethod::Anonymous, ServiceCall::SignInAnonymous, commands)
            }
            AuthEvent::SignInPat { pat } => {
                self.begin_sign_in(SignInMethod::Pat, ServiceCall::SignInPat { pat }, commands)
            }
            AuthEvent::SignInIdToken {
                provider,
                id_token,
                nonce,
            } => self.begin_sign_in(
                SignInMethod::IdToken,
                ServiceCall::SignInIdToken {
                    provider,
                    id_token,
                    nonce,
                },
                commands,
            ),
            AuthEvent::SignInSecurityKey { email } => self.begin_sign_in(
                SignInMethod::SecurityKey,
                ServiceCall::SignInSecurityKey { email },
                commands,
            ),
            AuthEvent::SignInMfaTotp { otp, ticket } => self.on_sign_in_mfa(otp, ticket, commands),

            AuthEvent::SignUpEmailPassword {
                email,
                password,
                options,
            } => self.begin_sign_up(
                SignUpMethod::EmailPassword,
                ServiceCall::SignUpEmailPassword {
                    email,
                    password,
                    options,
                },
                commands,
            ),
            AuthEvent::SignUpSecurityKey { email, options } => self.begin_sign_up(
                SignUpMethod::SecurityKey,
                ServiceCall::SignUpSecurityKey { email, options },
                commands,
            ),
            AuthEvent::PasswordlessEmail { email, options } => self.begin_sign_up(
                SignUpMethod::PasswordlessEmail,
                ServiceCall::PasswordlessEmail { email, options },
                commands,
            ),
            AuthEvent::PasswordlessSms {
                phone_number,
                options,
            } => self.begin_sign_up(
                SignUpMethod::PasswordlessSms,
                ServiceCall::PasswordlessSms {
                    phone_number,
                    options,
                },
                commands,
            ),
            AuthEvent::SignInSmsOtp { phone_number, otp } => self.begin_sign_up(
                SignUpMethod::SmsOtpVerify,
                ServiceCall::SignInSmsOtp { phone_number, otp },
                commands,
            ),
            AuthEvent::SignInEmailOtp { email } => self.begin_sign_up(
                SignUpMethod::EmailOtp,
                ServiceCall::SignInEmailOtp { email },
                commands,
            ),
            AuthEvent::VerifyEmailOtp { email, otp } => self.begin_sign_up(
                SignUpMethod::EmailOtpVerify,
                ServiceCall::VerifyEmailOtp { email, otp },
                commands,
            ),
        }
    }

    fn dispatch_internal(
        &mut self,
        event: InternalEvent,
        now: DateTime<Utc>,
        _commands: &mut [Command],
    ) {
        match event {
            InternalEvent::SignedIn => {
                let anonymous = self
                    .ctx
                    .user
                    .as_ref()
                    .map(|user| user.is_anonymous)
                    .unwrap_or(false);
                self.registration = if anonymous {
                    RegistrationState::Incomplete(RegistrationStatus::NoErrors)
                } else {
                    RegistrationState::Complete
                };
            }
            InternalEvent::SignedOut => {
                self.registration = RegistrationState::Incomplete(RegistrationStatus::NoErrors);
            }
            InternalEvent::TokenChanged => {
                if self.authentication == AuthenticationState::SignedIn {
                    self.timer = self.timer_state_for_token(now);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Region A: authentication
    // ---------------------------------------------------------------------

    fn begin_sign_in(
        &mut self,
        method: SignInMethod,
        call: ServiceCall,
        commands: &mut Vec<Command>,
    ) -> bool {
        if !matches!(self.authentication, AuthenticationState::SignedOut(_)) {
            tracing::debug!(state = self.authentication.as_str(), "Sign-in rejected");
            return false;
        }
        self.leave_signing_out();
        self.ctx.clear_error(ErrorCategory::Authentication);
        self.set_authentication(AuthenticationState::Authenticating(method));
        let id = self.next_id();
        self.auth_invoke = Some(id);
        commands.push(Command::Invoke { id, call });
        true
    }

    fn on_sign_in_mfa(
        &mut self,
        otp: String,
        ticket: Option<String>,
        commands: &mut Vec<Command>,
    ) -> bool {
        if !matches!(self.authentication, AuthenticationState::SignedOut(_)) {
            return false;
        }
        let ticket = match ticket.or_else(|| self.ctx.mfa.as_ref().map(|mfa| mfa.ticket.clone())) {
            Some(ticket) => ticket,
            None => {
                self.leave_signing_out();
                self.ctx
                    .save_error(ErrorCategory::Authentication, AuthError::no_mfa_ticket());
                self.set_authentication(AuthenticationState::SignedOut(SignedOutStatus::Failed));
                return true;
            }
        };
        self.begin_sign_in(
            SignInMethod::MfaTotp,
            ServiceCall::SignInMfaTotp { otp, ticket },
            commands,
        )
    }

    fn on_sign_out(&mut self, all: bool, commands: &mut Vec<Command>) -> bool {
        match self.authentication {
            AuthenticationState::SignedOut(_) => return false,
            AuthenticationState::Starting
            | AuthenticationState::RetryTokenImport
            | AuthenticationState::Authenticating(_)
            | AuthenticationState::SignedIn => {}
        }

        let refresh_token = self.ctx.refresh_token.value.clone();
        self.ctx.clear_except_refresh_token();
        if let Err(error) = self.store.clear() {
            tracing::warn!(%error, "Failed to clear persisted credentials");
        }
        self.timer = RefreshTimerState::Stopped;

        match refresh_token {
            Some(token) => {
                self.set_authentication(AuthenticationState::SignedOut(SignedOutStatus::SigningOut));
                let id = self.next_id();
                self.auth_invoke = Some(id);
                commands.push(Command::Invoke {
                    id,
                    call: ServiceCall::SignOut {
                        refresh_token: token,
                        all,
                    },
                });
            }
            None => {
                // Nothing to revoke
                self.finish_sign_out(Ok(()));
            }
        }
        true
    }

    /// Exit action of `signedOut.signingOut`: whenever the state is left
    /// before the sign-out service reports back, the refresh token is
    /// destroyed anyway and the in-flight completion is abandoned.
    fn leave_signing_out(&mut self) {
        if self.authentication == AuthenticationState::SignedOut(SignedOutStatus::SigningOut) {
            self.ctx.refresh_token = Default::default();
            self.auth_invoke = None;
            self.internal.push_back(InternalEvent::TokenChanged);
        }
    }

    fn finish_sign_out(&mut self, result: Result<(), AuthError>) {
        // Exit action: the refresh token is destroyed regardless of outcome
        self.ctx.refresh_token = Default::default();
        self.auth_invoke = None;
        match result {
            Ok(()) => {
                self.broadcaster.post(&BroadcastMessage::Signout);
                self.set_authentication(AuthenticationState::SignedOut(SignedOutStatus::Success));
            }
            Err(error) => {
                self.ctx.save_error(ErrorCategory::Signout, error);
                self.set_authentication(AuthenticationState::SignedOut(SignedOutStatus::Failed));
            }
        }
        self.internal.push_back(InternalEvent::SignedOut);
    }

    fn on_session_update(
        &mut self,
        session: Session,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) -> bool {
        if session.access_token.is_empty() {
            return false;
        }
        if self.ctx.refresh_token.value.as_deref() == Some(session.refresh_token.as_str()) {
            // Same token; nothing new to adopt
            return false;
        }
        self.auth_invoke = None;
        self.save_session(&session, now);
        self.enter_signed_in(now, commands);
        true
    }

    fn on_retry_import(&mut self, commands: &mut Vec<Command>) -> bool {
        if self.authentication != AuthenticationState::RetryTokenImport {
            return false;
        }
        self.set_authentication(AuthenticationState::Starting);
        self.invoke_import(commands);
        true
    }

    fn invoke_import(&mut self, commands: &mut Vec<Command>) {
        self.set_authentication(AuthenticationState::Starting);
        let id = self.next_id();
        self.auth_invoke = Some(id);
        commands.push(Command::Invoke {
            id,
            call: ServiceCall::ImportToken,
        });
    }

    // ---------------------------------------------------------------------
    // Region B: token
    // ---------------------------------------------------------------------

    fn on_try_token(&mut self, token: String, commands: &mut Vec<Command>) -> bool {
        if self.token == TokenState::Running {
            tracing::debug!("Refresher already running, TRY_TOKEN rejected");
            return false;
        }
        self.token = TokenState::Running;
        let id = self.next_id();
        self.token_invoke = Some(id);
        commands.push(Command::Invoke {
            id,
            call: ServiceCall::RefreshToken {
                refresh_token: token,
            },
        });
        true
    }

    // ---------------------------------------------------------------------
    // Refresh timer
    // ---------------------------------------------------------------------

    fn on_tick(&mut self, now: DateTime<Utc>, commands: &mut Vec<Command>) -> bool {
        if self.authentication != AuthenticationState::SignedIn {
            return false;
        }
        match self.timer {
            RefreshTimerState::Idle => {
                if self.ctx.refresh_token.value.is_some() {
                    self.timer = RefreshTimerState::Pending;
                    return true;
                }
                false
            }
            RefreshTimerState::Pending => {
                if !should_refresh(&self.ctx, self.config.refresh_interval, now) {
                    return false;
                }
                let refresh_token = match self.ctx.refresh_token.value.clone() {
                    Some(token) => token,
                    None => return false,
                };
                self.timer = RefreshTimerState::Refreshing;
                let id = self.next_id();
                self.timer_invoke = Some(id);
                commands.push(Command::Invoke {
                    id,
                    call: ServiceCall::RefreshToken { refresh_token },
                });
                true
            }
            _ => false,
        }
    }

    fn timer_state_for_token(&self, _now: DateTime<Utc>) -> RefreshTimerState {
        if !self.config.auto_refresh || self.ctx.refresh_token.is_pat {
            RefreshTimerState::Disabled
        } else if self.ctx.refresh_token.value.is_some() {
            RefreshTimerState::Pending
        } else {
            RefreshTimerState::Idle
        }
    }

    // ---------------------------------------------------------------------
    // Region C: registration
    // ---------------------------------------------------------------------

    fn begin_sign_up(
        &mut self,
        method: SignUpMethod,
        call: ServiceCall,
        commands: &mut Vec<Command>,
    ) -> bool {
        if matches!(self.registration, RegistrationState::SigningUp(_)) {
            return false;
        }
        let anonymous = self
            .ctx
            .user
            .as_ref()
            .map(|user| user.is_anonymous)
            .unwrap_or(false);
        if self.ctx.is_signed_in() && !anonymous {
            tracing::debug!("Sign-up rejected, user already signed in");
            return false;
        }
        self.ctx.clear_error(ErrorCategory::Registration);
        self.registration = RegistrationState::SigningUp(method);
        let id = self.next_id();
        self.registration_invoke = Some(id);
        commands.push(Command::Invoke { id, call });
        true
    }

    // ---------------------------------------------------------------------
    // Service completion
    // ---------------------------------------------------------------------

    fn on_service_done(
        &mut self,
        id: InvokeId,
        outcome: ServiceOutcome,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) -> bool {
        if self.auth_invoke == Some(id) {
            self.auth_invoke = None;
            self.on_auth_service_done(outcome, now, commands)
        } else if self.timer_invoke == Some(id) {
            self.timer_invoke = None;
            self.on_timer_service_done(outcome, now, commands)
        } else if self.token_invoke == Some(id) {
            self.token_invoke = None;
            self.on_token_service_done(outcome, now, commands)
        } else if self.registration_invoke == Some(id) {
            self.registration_invoke = None;
            self.on_registration_service_done(outcome, now, commands)
        } else {
            tracing::debug!(id = id.0, "Dropping stale service completion");
            false
        }
    }

    fn on_auth_service_done(
        &mut self,
        outcome: ServiceOutcome,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) -> bool {
        match self.authentication {
            AuthenticationState::Starting => self.on_import_done(outcome, now, commands),
            AuthenticationState::Authenticating(method) => {
                self.on_authenticating_done(method, outcome, now, commands)
            }
            AuthenticationState::SignedOut(SignedOutStatus::SigningOut) => {
                let result = match outcome {
                    ServiceOutcome::Ok(_) => Ok(()),
                    ServiceOutcome::Err(error) => Err(error),
                };
                self.finish_sign_out(result);
                true
            }
            _ => false,
        }
    }

    fn on_import_done(
        &mut self,
        outcome: ServiceOutcome,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) -> bool {
        match outcome {
            ServiceOutcome::Ok(ServiceResult {
                session: Some(session),
                ..
            }) => {
                self.save_session(&session, now);
                self.enter_signed_in(now, commands);
            }
            ServiceOutcome::Ok(_) => {
                self.set_authentication(AuthenticationState::SignedOut(SignedOutStatus::NoErrors));
            }
            ServiceOutcome::Err(error) => {
                let backoff = Backoff::standard();
                self.ctx.import_token_attempts += 1;
                if error.is_transient() && !backoff.exhausted(self.ctx.import_token_attempts) {
                    let delay = backoff.delay_for_attempt(self.ctx.import_token_attempts);
                    tracing::debug!(
                        attempts = self.ctx.import_token_attempts,
                        ?delay,
                        "Token import failed, retrying"
                    );
                    self.set_authentication(AuthenticationState::RetryTokenImport);
                    commands.push(Command::ScheduleImportRetry { delay });
                } else {
                    tracing::warn!(%error, "Token import failed permanently");
                    self.ctx.save_error(ErrorCategory::Authentication, error);
                    self.set_authentication(AuthenticationState::SignedOut(SignedOutStatus::Failed));
                }
            }
        }
        true
    }

    fn on_authenticating_done(
        &mut self,
        method: SignInMethod,
        outcome: ServiceOutcome,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) -> bool {
        match outcome {
            ServiceOutcome::Ok(ServiceResult {
                session: Some(session),
                ..
            }) => {
                self.save_session(&session, now);
                if method == SignInMethod::Pat {
                    self.ctx.refresh_token.is_pat = true;
                }
                self.enter_signed_in(now, commands);
            }
            ServiceOutcome::Ok(ServiceResult { mfa: Some(mfa), .. }) => {
                self.ctx.mfa = Some(mfa);
                self.set_authentication(AuthenticationState::SignedOut(SignedOutStatus::NeedsMfa));
            }
            ServiceOutcome::Ok(_) => {
                // Security-key flows may complete without a session (e.g. the
                // ceremony was abandoned); treat like a plain sign-out.
                self.set_authentication(AuthenticationState::SignedOut(SignedOutStatus::NoErrors));
            }
            ServiceOutcome::Err(error) if error.is_unverified() => {
                self.registration =
                    RegistrationState::Incomplete(RegistrationStatus::NeedsEmailVerification);
                self.set_authentication(AuthenticationState::SignedOut(SignedOutStatus::NoErrors));
            }
            ServiceOutcome::Err(error) => {
                self.ctx.save_error(ErrorCategory::Authentication, error);
                self.set_authentication(AuthenticationState::SignedOut(SignedOutStatus::Failed));
            }
        }
        true
    }

    fn on_timer_service_done(
        &mut self,
        outcome: ServiceOutcome,
        now: DateTime<Utc>,
        _commands: &mut Vec<Command>,
    ) -> bool {
        if self.timer != RefreshTimerState::Refreshing {
            return false;
        }
        match outcome {
            ServiceOutcome::Ok(ServiceResult {
                session: Some(session),
                ..
            }) => {
                self.save_session(&session, now);
                self.ctx.reset_timer(now);
                self.timer = RefreshTimerState::Pending;
                self.broadcaster.post(&BroadcastMessage::BroadcastToken {
                    payload: TokenPayload {
                        token: session.refresh_token.clone(),
                    },
                });
                self.internal.push_back(InternalEvent::TokenChanged);
            }
            ServiceOutcome::Ok(_) => {
                // Refresh endpoint returned nothing useful; count it as a failure
                self.ctx
                    .save_refresh_attempt(now);
                self.timer = RefreshTimerState::Pending;
            }
            ServiceOutcome::Err(error) if error.is_unauthorized() => {
                // The refresh token is dead; no amount of retrying heals it
                tracing::warn!(%error, "Refresh token rejected, signing out");
                self.ctx.clear();
                if let Err(storage_error) = self.store.clear() {
                    tracing::warn!(error = %storage_error, "Failed to clear persisted credentials");
                }
                self.ctx.save_error(ErrorCategory::Authentication, error);
                self.timer = RefreshTimerState::Stopped;
                self.set_authentication(AuthenticationState::SignedOut(SignedOutStatus::Failed));
                self.internal.push_back(InternalEvent::SignedOut);
            }
            ServiceOutcome::Err(error) => {
                tracing::debug!(%error, attempts = self.ctx.refresh_timer.attempts + 1, "Refresh failed");
                self.ctx.save_refresh_attempt(now);
                self.timer = RefreshTimerState::Pending;
            }
        }
        true
    }

    fn on_token_service_done(
        &mut self,
        outcome: ServiceOutcome,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) -> bool {
        match outcome {
            ServiceOutcome::Ok(ServiceResult {
                session: Some(session),
                ..
            }) => {
                self.token = TokenState::Idle(TokenStatus::NoErrors);
                self.save_session(&session, now);
                self.enter_signed_in(now, commands);
            }
            ServiceOutcome::Ok(_) => {
                self.token = TokenState::Idle(TokenStatus::NoErrors);
            }
            ServiceOutcome::Err(error) => {
                self.token = TokenState::Idle(TokenStatus::Error);
                // When another flow already signed the holder in, a failed
                // side-channel token is not worth surfacing
                if !self.ctx.is_signed_in() {
                    self.ctx.save_error(ErrorCategory::Authentication, error);
                    if matches!(self.authentication, AuthenticationState::SignedOut(_)) {
                        self.set_authentication(AuthenticationState::SignedOut(
                            SignedOutStatus::Failed,
                        ));
                    }
                }
            }
        }
        true
    }

    fn on_registration_service_done(
        &mut self,
        outcome: ServiceOutcome,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) -> bool {
        let method = match self.registration {
            RegistrationState::SigningUp(method) => method,
            _ => return false,
        };
        match outcome {
            ServiceOutcome::Ok(ServiceResult {
                session: Some(session),
                ..
            }) => {
                self.registration = RegistrationState::Complete;
                self.save_session(&session, now);
                self.enter_signed_in(now, commands);
            }
            ServiceOutcome::Ok(_) => {
                self.registration = match method {
                    SignUpMethod::EmailPassword
                    | SignUpMethod::SecurityKey
                    | SignUpMethod::PasswordlessEmail => {
                        RegistrationState::Incomplete(RegistrationStatus::NeedsEmailVerification)
                    }
                    SignUpMethod::PasswordlessSms | SignUpMethod::EmailOtp => {
                        if method == SignUpMethod::PasswordlessSms {
                            if let AuthenticationState::SignedOut(_) = self.authentication {
                                self.set_authentication(AuthenticationState::SignedOut(
                                    SignedOutStatus::NeedsSmsOtp,
                                ));
                            }
                        }
                        RegistrationState::Incomplete(RegistrationStatus::NeedsOtp)
                    }
                    SignUpMethod::SmsOtpVerify | SignUpMethod::EmailOtpVerify => {
                        // Verification endpoints always return a session on
                        // success; anything else is a failure
                        self.ctx.save_error(
                            ErrorCategory::Registration,
                            AuthError::other("Verification returned no session"),
                        );
                        RegistrationState::Incomplete(RegistrationStatus::Failed)
                    }
                };
            }
            ServiceOutcome::Err(error) if error.is_unverified() => {
                self.registration =
                    RegistrationState::Incomplete(RegistrationStatus::NeedsEmailVerification);
            }
            ServiceOutcome::Err(error) => {
                self.ctx.save_error(ErrorCategory::Registration, error);
                self.registration = RegistrationState::Incomplete(RegistrationStatus::Failed);
            }
        }
        true
    }

    // ---------------------------------------------------------------------
    // Shared actions
    // ---------------------------------------------------------------------

    fn save_session(&mut self, session: &Session, now: DateTime<Utc>) {
        self.ctx.apply_session(session, now);
        let persisted = PersistedSession {
            refresh_token: session.refresh_token.clone(),
            refresh_token_id: session.refresh_token_id.clone(),
            expires_at: self.ctx.access_token.expires_at,
        };
        if let Err(error) = self.store.persist(&persisted) {
            tracing::warn!(%error, "Failed to persist session credentials");
        }
    }

    fn enter_signed_in(&mut self, now: DateTime<Utc>, _commands: &mut Vec<Command>) {
        if self.config.auto_sign_in {
            for name in [
                UrlParamKeys::REFRESH_TOKEN,
                UrlParamKeys::TYPE,
                UrlParamKeys::ERROR,
                UrlParamKeys::ERROR_DESCRIPTION,
            ] {
                self.url.remove(name);
            }
        }
        if let (Some(user), Some(access_token), Some(refresh_token)) = (
            self.ctx.user.clone(),
            self.ctx.access_token.value.clone(),
            self.ctx.refresh_token.value.clone(),
        ) {
            self.broadcaster.post(&BroadcastMessage::BroadcastSession {
                payload: SessionPayload {
                    token: refresh_token,
                    user,
                    access_token,
                    expires_in_seconds: self.ctx.access_token.expires_in_seconds.unwrap_or(0),
                },
            });
        }
        self.ctx.reset_errors();
        self.ctx.reset_timer(now);
        self.set_authentication(AuthenticationState::SignedIn);
        self.timer = self.timer_state_for_token(now);
        self.internal.push_back(InternalEvent::SignedIn);
        self.internal.push_back(InternalEvent::TokenChanged);
    }

    fn set_authentication(&mut self, next: AuthenticationState) {
        if self.authentication != next {
            tracing::debug!(
                from = ?self.authentication,
                to = ?next,
                "Authentication transition"
            );
            self.authentication = next;
        }
    }

    fn next_id(&mut self) -> InvokeId {
        self.next_invoke += 1;
        InvokeId(self.next_invoke)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NoBroadcast;
    use crate::context::User;
    use crate::url::MemoryUrlParams;
    use session_storage::{MemoryStorage, SessionStorage, StorageKeys};
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct RecordingBroadcast {
        messages: Arc<Mutex<Vec<BroadcastMessage>>>,
    }

    impl SessionBroadcast for RecordingBroadcast {
        fn post(&self, message: &BroadcastMessage) {
            self.messages.lock().unwrap().push(message.clone());
        }
    }

    fn fake_session(refresh_token: &str) -> Session {
        Session {
            access_token: "access-1".to_string(),
            access_token_expires_in: 900,
            refresh_token: refresh_token.to_string(),
            refresh_token_id: None,
            user: User {
                id: "user-1".to_string(),
                email: Some("user@example.com".to_string()),
                display_name: None,
                avatar_url: None,
                is_anonymous: false,
            },
        }
    }

    fn new_machine() -> AuthMachine {
        AuthMachine::new(
            MachineConfig::default(),
            Arc::new(SessionStore::new(Box::new(MemoryStorage::new()))),
            Box::new(NoBroadcast),
            Arc::new(MemoryUrlParams::new()),
            None,
            Utc::now(),
        )
    }

    fn invoke_of(commands: &[Command]) -> (InvokeId, ServiceCall) {
        commands
            .iter()
            .find_map(|command| match command {
                Command::Invoke { id, call } => Some((*id, call.clone())),
                _ => None,
            })
            .expect("expected an invoke command")
    }

    fn sign_in(machine: &mut AuthMachine) {
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::with_session(fake_session("refresh-1"))),
            },
            now,
        );
        assert!(machine.snapshot().is_signed_in());
    }

    #[test]
    fn start_without_credentials_invokes_import() {
        let mut machine = new_machine();
        let commands = machine.start(Utc::now());
        let (_, call) = invoke_of(&commands);
        assert_eq!(call, ServiceCall::ImportToken);
        assert!(machine.snapshot().is_loading());
    }

    #[test]
    fn initial_session_skips_import() {
        let now = Utc::now();
        let mut machine = AuthMachine::new(
            MachineConfig::default(),
            Arc::new(SessionStore::new(Box::new(MemoryStorage::new()))),
            Box::new(NoBroadcast),
            Arc::new(MemoryUrlParams::new()),
            Some(fake_session("refresh-initial")),
            now,
        );
        let commands = machine.start(now);
        assert!(commands.is_empty());
        let snapshot = machine.snapshot();
        assert!(snapshot.is_signed_in());
        assert_eq!(snapshot.registration, RegistrationState::Complete);
    }

    #[test]
    fn import_without_session_lands_signed_out() {
        let mut machine = new_machine();
        let commands = machine.start(Utc::now());
        let (id, _) = invoke_of(&commands);
        let result = machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            Utc::now(),
        );
        assert!(result.changed);
        assert_eq!(
            machine.snapshot().authentication,
            AuthenticationState::SignedOut(SignedOutStatus::NoErrors)
        );
    }

    #[test]
    fn transient_import_failure_schedules_backoff_retry() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);

        let result = machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Err(AuthError::network("offline")),
            },
            now,
        );
        assert_eq!(
            machine.snapshot().authentication,
            AuthenticationState::RetryTokenImport
        );
        assert!(result
            .commands
            .contains(&Command::ScheduleImportRetry {
                delay: Duration::from_millis(5_000)
            }));

        // The retry doubles the delay on the next failure
        let result = machine.handle(AuthEvent::RetryImport, now);
        let (id, _) = invoke_of(&result.commands);
        let result = machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Err(AuthError::api(503, "unavailable", "down")),
            },
            now,
        );
        assert!(result
            .commands
            .contains(&Command::ScheduleImportRetry {
                delay: Duration::from_millis(10_000)
            }));
    }

    #[test]
    fn terminal_import_failure_records_error() {
        let mut machine = new_machine();
        let commands = machine.start(Utc::now());
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Err(AuthError::api(401, "invalid-refresh-token", "nope")),
            },
            Utc::now(),
        );
        let snapshot = machine.snapshot();
        assert_eq!(
            snapshot.authentication,
            AuthenticationState::SignedOut(SignedOutStatus::Failed)
        );
        assert!(snapshot.error(ErrorCategory::Authentication).is_some());
    }

    #[test]
    fn password_sign_in_success() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(
            AuthEvent::SignInPassword {
                email: "user@example.com".to_string(),
                password: "secret123".to_string(),
            },
            now,
        );
        assert!(result.changed);
        let (id, call) = invoke_of(&result.commands);
        assert!(matches!(call, ServiceCall::SignInPassword { .. }));
        assert_eq!(
            machine.snapshot().authentication,
            AuthenticationState::Authenticating(SignInMethod::Password)
        );

        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::with_session(fake_session("refresh-1"))),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert!(snapshot.is_signed_in());
        assert_eq!(snapshot.timer, RefreshTimerState::Pending);
        assert_eq!(snapshot.registration, RegistrationState::Complete);
        assert!(snapshot.context.errors.is_empty());
    }

    #[test]
    fn sign_in_while_signed_in_is_rejected() {
        let mut machine = new_machine();
        sign_in(&mut machine);
        let result = machine.handle(
            AuthEvent::SignInPassword {
                email: "other@example.com".to_string(),
                password: "secret123".to_string(),
            },
            Utc::now(),
        );
        assert!(!result.changed);
        assert!(result.commands.is_empty());
    }

    #[test]
    fn mfa_challenge_parks_in_needs_mfa_then_totp_completes() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(
            AuthEvent::SignInPassword {
                email: "user@example.com".to_string(),
                password: "secret123".to_string(),
            },
            now,
        );
        let (id, _) = invoke_of(&result.commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::with_mfa(crate::context::MfaChallenge {
                    ticket: "mfa-ticket".to_string(),
                })),
            },
            now,
        );
        assert_eq!(
            machine.snapshot().authentication,
            AuthenticationState::SignedOut(SignedOutStatus::NeedsMfa)
        );

        // The stored ticket is used when the caller does not supply one
        let result = machine.handle(
            AuthEvent::SignInMfaTotp {
                otp: "123456".to_string(),
                ticket: None,
            },
            now,
        );
        let (id, call) = invoke_of(&result.commands);
        assert_eq!(
            call,
            ServiceCall::SignInMfaTotp {
                otp: "123456".to_string(),
                ticket: "mfa-ticket".to_string(),
            }
        );
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::with_session(fake_session("refresh-1"))),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert!(snapshot.is_signed_in());
        assert!(snapshot.context.mfa.is_none());
    }

    #[test]
    fn mfa_totp_without_ticket_fails() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(
            AuthEvent::SignInMfaTotp {
                otp: "123456".to_string(),
                ticket: None,
            },
            now,
        );
        assert!(result.changed);
        assert!(result.commands.is_empty());
        let snapshot = machine.snapshot();
        assert_eq!(
            snapshot.authentication,
            AuthenticationState::SignedOut(SignedOutStatus::Failed)
        );
        assert_eq!(
            snapshot.error(ErrorCategory::Authentication),
            Some(&AuthError::no_mfa_ticket())
        );
    }

    #[test]
    fn unverified_sign_in_moves_to_registration_region() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(
            AuthEvent::SignInPassword {
                email: "user@example.com".to_string(),
                password: "secret123".to_string(),
            },
            now,
        );
        let (id, _) = invoke_of(&result.commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Err(AuthError::api(
                    401,
                    crate::error::UNVERIFIED_USER,
                    "Email is not verified",
                )),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert_eq!(
            snapshot.authentication,
            AuthenticationState::SignedOut(SignedOutStatus::NoErrors)
        );
        assert_eq!(
            snapshot.registration,
            RegistrationState::Incomplete(RegistrationStatus::NeedsEmailVerification)
        );
        assert!(snapshot.error(ErrorCategory::Authentication).is_none());
    }

    #[test]
    fn pat_sign_in_disables_refresh_timer() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(
            AuthEvent::SignInPat {
                pat: "pat-token".to_string(),
            },
            now,
        );
        let (id, _) = invoke_of(&result.commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::with_session(fake_session("pat-token"))),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert!(snapshot.is_signed_in());
        assert_eq!(snapshot.timer, RefreshTimerState::Disabled);
        assert!(snapshot.context.refresh_token.is_pat);

        // Ticks never start a refresh for a PAT session
        let result = machine.handle(AuthEvent::Tick, now + chrono::Duration::seconds(3600));
        assert!(!result.changed);
        assert!(result.commands.is_empty());
    }

    #[test]
    fn session_update_with_new_token_signs_in_without_network() {
        let mut machine = new_machine();
        let now = Utc::now();
        machine.start(now);

        let result = machine.handle(
            AuthEvent::SessionUpdate {
                session: fake_session("broadcast-token"),
            },
            now,
        );
        assert!(result.changed);
        assert!(result.commands.is_empty());
        let snapshot = machine.snapshot();
        assert!(snapshot.is_signed_in());
        assert_eq!(
            snapshot.context.refresh_token.value.as_deref(),
            Some("broadcast-token")
        );
    }

    #[test]
    fn session_update_with_same_token_is_noop() {
        let mut machine = new_machine();
        sign_in(&mut machine);
        let result = machine.handle(
            AuthEvent::SessionUpdate {
                session: fake_session("refresh-1"),
            },
            Utc::now(),
        );
        assert!(!result.changed);
    }

    #[test]
    fn signout_clears_context_and_storage() {
        let storage = Arc::new(MemoryStorage::new());

        struct SharedStorage(Arc<MemoryStorage>);
        impl SessionStorage for SharedStorage {
            fn set(&self, key: &str, value: &str) -> session_storage::StorageResult<()> {
                self.0.set(key, value)
            }
            fn get(&self, key: &str) -> session_storage::StorageResult<Option<String>> {
                self.0.get(key)
            }
            fn delete(&self, key: &str) -> session_storage::StorageResult<bool> {
                self.0.delete(key)
            }
        }

        let broadcast = RecordingBroadcast::default();
        let mut machine = AuthMachine::new(
            MachineConfig::default(),
            Arc::new(SessionStore::new(Box::new(SharedStorage(storage.clone())))),
            Box::new(broadcast.clone()),
            Arc::new(MemoryUrlParams::new()),
            None,
            Utc::now(),
        );
        sign_in(&mut machine);
        assert!(storage.get(StorageKeys::REFRESH_TOKEN).unwrap().is_some());

        let now = Utc::now();
        let result = machine.handle(AuthEvent::SignOut { all: false }, now);
        assert!(result.changed);
        let (id, call) = invoke_of(&result.commands);
        assert_eq!(
            call,
            ServiceCall::SignOut {
                refresh_token: "refresh-1".to_string(),
                all: false,
            }
        );
        assert!(storage.get(StorageKeys::REFRESH_TOKEN).unwrap().is_none());
        assert_eq!(
            machine.snapshot().authentication,
            AuthenticationState::SignedOut(SignedOutStatus::SigningOut)
        );

        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert_eq!(
            snapshot.authentication,
            AuthenticationState::SignedOut(SignedOutStatus::Success)
        );
        assert!(snapshot.context.refresh_token.value.is_none());
        assert!(broadcast
            .messages
            .lock()
            .unwrap()
            .contains(&BroadcastMessage::Signout));
    }

    #[test]
    fn signout_during_authenticating_wins() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (import_id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id: import_id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );
        let result = machine.handle(
            AuthEvent::SignInPassword {
                email: "user@example.com".to_string(),
                password: "secret123".to_string(),
            },
            now,
        );
        let (signin_id, _) = invoke_of(&result.commands);

        machine.handle(AuthEvent::SignOut { all: false }, now);

        // The in-flight sign-in resolving late must not resurrect the session
        let result = machine.handle(
            AuthEvent::ServiceDone {
                id: signin_id,
                outcome: ServiceOutcome::Ok(ServiceResult::with_session(fake_session("late"))),
            },
            now,
        );
        assert!(!result.changed);
        let snapshot = machine.snapshot();
        assert!(!snapshot.is_signed_in());
        assert!(snapshot.context.access_token.value.is_none());
    }

    #[test]
    fn tick_refreshes_inside_margin() {
        let mut machine = new_machine();
        let now = Utc::now();
        sign_in(&mut machine);

        // Far from expiry: no refresh
        let result = machine.handle(AuthEvent::Tick, now);
        assert!(result.commands.is_empty());

        // Inside the margin: refresh starts
        let later = now + chrono::Duration::seconds(700);
        let result = machine.handle(AuthEvent::Tick, later);
        let (_, call) = invoke_of(&result.commands);
        assert_eq!(
            call,
            ServiceCall::RefreshToken {
                refresh_token: "refresh-1".to_string(),
            }
        );
        assert_eq!(machine.snapshot().timer, RefreshTimerState::Refreshing);
    }

    #[test]
    fn refresh_success_restarts_timer() {
        let mut machine = new_machine();
        let now = Utc::now();
        sign_in(&mut machine);
        let later = now + chrono::Duration::seconds(700);
        let result = machine.handle(AuthEvent::Tick, later);
        let (id, _) = invoke_of(&result.commands);

        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::with_session(fake_session("refresh-2"))),
            },
            later,
        );
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.timer, RefreshTimerState::Pending);
        assert_eq!(snapshot.context.refresh_timer.attempts, 0);
        assert_eq!(
            snapshot.context.refresh_token.value.as_deref(),
            Some("refresh-2")
        );
    }

    #[test]
    fn refresh_failure_counts_attempt() {
        let mut machine = new_machine();
        let now = Utc::now();
        sign_in(&mut machine);
        let later = now + chrono::Duration::seconds(700);
        let result = machine.handle(AuthEvent::Tick, later);
        let (id, _) = invoke_of(&result.commands);

        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Err(AuthError::network("offline")),
            },
            later,
        );
        let snapshot = machine.snapshot();
        assert!(snapshot.is_signed_in());
        assert_eq!(snapshot.timer, RefreshTimerState::Pending);
        assert_eq!(snapshot.context.refresh_timer.attempts, 1);
        assert!(snapshot.context.refresh_timer.last_attempt.is_some());

        // Backoff holds the next attempt until 5 s have passed
        let result = machine.handle(AuthEvent::Tick, later + chrono::Duration::seconds(2));
        assert!(result.commands.is_empty());
        let result = machine.handle(AuthEvent::Tick, later + chrono::Duration::seconds(6));
        assert!(!result.commands.is_empty());
    }

    #[test]
    fn refresh_401_forces_sign_out() {
        let mut machine = new_machine();
        let now = Utc::now();
        sign_in(&mut machine);
        let later = now + chrono::Duration::seconds(700);
        let result = machine.handle(AuthEvent::Tick, later);
        let (id, _) = invoke_of(&result.commands);

        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Err(AuthError::api(
                    401,
                    "invalid-refresh-token",
                    "Invalid or expired refresh token",
                )),
            },
            later,
        );
        let snapshot = machine.snapshot();
        assert_eq!(
            snapshot.authentication,
            AuthenticationState::SignedOut(SignedOutStatus::Failed)
        );
        assert!(snapshot.context.access_token.value.is_none());
        assert!(snapshot.context.refresh_token.value.is_none());
        assert!(snapshot.error(ErrorCategory::Authentication).is_some());
    }

    #[test]
    fn try_token_success_forces_signed_in() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(
            AuthEvent::TryToken {
                token: "external-token".to_string(),
            },
            now,
        );
        assert!(result.changed);
        assert_eq!(machine.snapshot().token, TokenState::Running);
        let (id, _) = invoke_of(&result.commands);

        // A second TRY_TOKEN while running is rejected
        let rejected = machine.handle(
            AuthEvent::TryToken {
                token: "another".to_string(),
            },
            now,
        );
        assert!(!rejected.changed);

        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::with_session(fake_session("rotated"))),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert!(snapshot.is_signed_in());
        assert_eq!(snapshot.token, TokenState::Idle(TokenStatus::NoErrors));
    }

    #[test]
    fn try_token_failure_is_silent_when_signed_in() {
        let mut machine = new_machine();
        let now = Utc::now();
        sign_in(&mut machine);

        let result = machine.handle(
            AuthEvent::TryToken {
                token: "bad-token".to_string(),
            },
            now,
        );
        let (id, _) = invoke_of(&result.commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Err(AuthError::api(401, "invalid-refresh-token", "nope")),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert!(snapshot.is_signed_in());
        assert_eq!(snapshot.token, TokenState::Idle(TokenStatus::Error));
        assert!(snapshot.error(ErrorCategory::Authentication).is_none());
    }

    #[test]
    fn stale_service_done_is_dropped() {
        let mut machine = new_machine();
        let now = Utc::now();
        machine.start(now);
        let result = machine.handle(
            AuthEvent::ServiceDone {
                id: InvokeId(9999),
                outcome: ServiceOutcome::Ok(ServiceResult::with_session(fake_session("stale"))),
            },
            now,
        );
        assert!(!result.changed);
        assert!(!machine.snapshot().is_signed_in());
    }

    #[test]
    fn passwordless_sms_then_otp_completes_sign_in() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(
            AuthEvent::PasswordlessSms {
                phone_number: "+15551234567".to_string(),
                options: Default::default(),
            },
            now,
        );
        let (id, _) = invoke_of(&result.commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert_eq!(
            snapshot.authentication,
            AuthenticationState::SignedOut(SignedOutStatus::NeedsSmsOtp)
        );
        assert_eq!(
            snapshot.registration,
            RegistrationState::Incomplete(RegistrationStatus::NeedsOtp)
        );

        let result = machine.handle(
            AuthEvent::SignInSmsOtp {
                phone_number: "+15551234567".to_string(),
                otp: "123456".to_string(),
            },
            now,
        );
        let (id, _) = invoke_of(&result.commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::with_session(fake_session("refresh-1"))),
            },
            now,
        );
        assert!(machine.snapshot().is_signed_in());
    }

    #[test]
    fn email_otp_flow_completes_sign_in() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(
            AuthEvent::SignInEmailOtp {
                email: "user@example.com".to_string(),
            },
            now,
        );
        let (id, _) = invoke_of(&result.commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );
        assert_eq!(
            machine.snapshot().registration,
            RegistrationState::Incomplete(RegistrationStatus::NeedsOtp)
        );

        let result = machine.handle(
            AuthEvent::VerifyEmailOtp {
                email: "user@example.com".to_string(),
                otp: "123456".to_string(),
            },
            now,
        );
        let (id, _) = invoke_of(&result.commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::with_session(fake_session("refresh-1"))),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert!(snapshot.is_signed_in());
        assert_eq!(snapshot.registration, RegistrationState::Complete);
    }

    #[test]
    fn sign_up_failure_records_registration_error() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(
            AuthEvent::SignUpEmailPassword {
                email: "user@example.com".to_string(),
                password: "secret123".to_string(),
                options: Default::default(),
            },
            now,
        );
        let (id, _) = invoke_of(&result.commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Err(AuthError::api(409, "email-already-in-use", "taken")),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert_eq!(
            snapshot.registration,
            RegistrationState::Incomplete(RegistrationStatus::Failed)
        );
        assert!(snapshot.error(ErrorCategory::Registration).is_some());
    }

    #[test]
    fn sign_up_with_verification_email_parks_incomplete() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(
            AuthEvent::SignUpEmailPassword {
                email: "user@example.com".to_string(),
                password: "secret123".to_string(),
                options: Default::default(),
            },
            now,
        );
        let (id, _) = invoke_of(&result.commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );
        assert_eq!(
            machine.snapshot().registration,
            RegistrationState::Incomplete(RegistrationStatus::NeedsEmailVerification)
        );
    }

    #[test]
    fn signed_in_entry_broadcasts_session_and_cleans_url() {
        let broadcast = RecordingBroadcast::default();
        let url = MemoryUrlParams::new()
            .with_param(UrlParamKeys::REFRESH_TOKEN, "url-token")
            .with_param(UrlParamKeys::TYPE, "signinPasswordless");
        let mut machine = AuthMachine::new(
            MachineConfig::default(),
            Arc::new(SessionStore::new(Box::new(MemoryStorage::new()))),
            Box::new(broadcast.clone()),
            Arc::new(url),
            None,
            Utc::now(),
        );
        sign_in(&mut machine);

        let messages = broadcast.messages.lock().unwrap();
        assert!(messages.iter().any(|message| matches!(
            message,
            BroadcastMessage::BroadcastSession { payload } if payload.token == "refresh-1"
        )));
    }

    #[test]
    fn anonymous_user_keeps_registration_incomplete() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(AuthEvent::SignInAnonymous, now);
        let (id, _) = invoke_of(&result.commands);
        let mut session = fake_session("anon-refresh");
        session.user.is_anonymous = true;
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::with_session(session)),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert!(snapshot.is_signed_in());
        assert_eq!(
            snapshot.registration,
            RegistrationState::Incomplete(RegistrationStatus::NoErrors)
        );

        // An anonymous holder may still sign up (deanonymize)
        let result = machine.handle(
            AuthEvent::SignUpEmailPassword {
                email: "user@example.com".to_string(),
                password: "secret123".to_string(),
                options: Default::default(),
            },
            now,
        );
        assert!(result.changed);
    }

    #[test]
    fn new_sign_in_clears_the_previous_error() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(
            AuthEvent::SignInPassword {
                email: "user@example.com".to_string(),
                password: "wrong".to_string(),
            },
            now,
        );
        let (id, _) = invoke_of(&result.commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Err(AuthError::api(
                    401,
                    "invalid-email-password",
                    "Incorrect email or password",
                )),
            },
            now,
        );
        assert!(machine
            .snapshot()
            .error(ErrorCategory::Authentication)
            .is_some());

        // The second attempt enters authenticating with a clean slate
        machine.handle(
            AuthEvent::SignInPassword {
                email: "user@example.com".to_string(),
                password: "secret123".to_string(),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert_eq!(
            snapshot.authentication,
            AuthenticationState::Authenticating(SignInMethod::Password)
        );
        assert!(snapshot.error(ErrorCategory::Authentication).is_none());
    }

    #[test]
    fn new_sign_up_clears_the_previous_error() {
        let mut machine = new_machine();
        let now = Utc::now();
        let commands = machine.start(now);
        let (id, _) = invoke_of(&commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );

        let result = machine.handle(
            AuthEvent::SignUpEmailPassword {
                email: "user@example.com".to_string(),
                password: "secret123".to_string(),
                options: Default::default(),
            },
            now,
        );
        let (id, _) = invoke_of(&result.commands);
        machine.handle(
            AuthEvent::ServiceDone {
                id,
                outcome: ServiceOutcome::Err(AuthError::api(
                    409,
                    "email-already-in-use",
                    "Email already in use",
                )),
            },
            now,
        );
        assert_eq!(
            machine.snapshot().registration,
            RegistrationState::Incomplete(RegistrationStatus::Failed)
        );
        assert!(machine
            .snapshot()
            .error(ErrorCategory::Registration)
            .is_some());

        machine.handle(
            AuthEvent::SignUpEmailPassword {
                email: "other@example.com".to_string(),
                password: "secret123".to_string(),
                options: Default::default(),
            },
            now,
        );
        let snapshot = machine.snapshot();
        assert_eq!(
            snapshot.registration,
            RegistrationState::SigningUp(SignUpMethod::EmailPassword)
        );
        assert!(snapshot.error(ErrorCategory::Registration).is_none());
    }

    #[test]
    fn sign_in_during_sign_out_destroys_the_refresh_token() {
        let mut machine = new_machine();
        sign_in(&mut machine);
        let now = Utc::now();

        let result = machine.handle(AuthEvent::SignOut { all: false }, now);
        let (signout_id, _) = invoke_of(&result.commands);
        assert_eq!(
            machine.snapshot().authentication,
            AuthenticationState::SignedOut(SignedOutStatus::SigningOut)
        );

        // Leaving signingOut destroys the token even though the sign-out
        // service has not reported back yet
        let result = machine.handle(
            AuthEvent::SignInPassword {
                email: "user@example.com".to_string(),
                password: "secret123".to_string(),
            },
            now,
        );
        assert!(result.changed);
        let snapshot = machine.snapshot();
        assert_eq!(
            snapshot.authentication,
            AuthenticationState::Authenticating(SignInMethod::Password)
        );
        assert_eq!(snapshot.context.refresh_token.value, None);

        // The superseded sign-out completion is dropped
        let result = machine.handle(
            AuthEvent::ServiceDone {
                id: signout_id,
                outcome: ServiceOutcome::Ok(ServiceResult::empty()),
            },
            now,
        );
        assert!(!result.changed);
        assert_eq!(
            machine.snapshot().authentication,
            AuthenticationState::Authenticating(SignInMethod::Password)
        );
    }
}
