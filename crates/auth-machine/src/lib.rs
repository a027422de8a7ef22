//! Authentication session lifecycle core.
//!
//! Owns the session context, the parallel authentication state machine, the
//! token refresh decision, and the cross-context broadcast message format.
//! Everything asynchronous (HTTP, timers, channels) lives behind commands
//! and capability traits supplied by the embedding client.

pub mod broadcast;
pub mod context;
pub mod error;
pub mod events;
pub mod machine;
pub mod scheduler;
pub mod url;

pub use broadcast::{BroadcastMessage, NoBroadcast, SessionBroadcast, SessionPayload, TokenPayload};
pub use context::{
    AccessToken, ErrorCategory, MfaChallenge, RefreshTimer, RefreshToken, Session, SessionContext,
    User,
};
pub use error::{AuthError, AuthResult};
pub use events::{
    AuthEvent, Command, InvokeId, ServiceCall, ServiceOutcome, ServiceResult, SignUpOptions,
};
pub use machine::{
    AuthMachine, AuthenticationState, MachineConfig, RefreshTimerState, RegistrationState,
    RegistrationStatus, SignInMethod, SignUpMethod, SignedOutStatus, StateSnapshot, StepResult,
    TokenState, TokenStatus,
};
pub use scheduler::{
    should_refresh, Backoff, REFRESH_TICK_MS, REFRESH_TOKEN_MAX_ATTEMPTS, RETRY_BASE_DELAY_MS,
    TOKEN_REFRESH_MARGIN_SECONDS,
};
pub use url::{MemoryUrlParams, NoUrlParams, UrlParamKeys, UrlParams};
