//! Async authentication client.
//!
//! Wraps the synchronous lifecycle machine from `auth-machine` with a Tokio
//! driver task, an HTTP backend, startup token import, and an in-process
//! broadcast hub for multi-client session sharing.

pub mod backend;
pub mod bootstrap;
pub mod client;
pub mod hub;
pub mod validators;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{
    AuthApi, CreatedPat, DeanonymizeMethod, HttpAuthApi, SecurityKey, SignInResponse,
    SignUpResponse, TotpSecret,
};
pub use bootstrap::TokenImporter;
pub use client::{
    AuthClient, AuthClientBuilder, SecurityKeyCeremony, SignInResult, SignUpResult,
    UnsupportedCeremony,
};
pub use hub::{BroadcastHub, ChannelBroadcaster, Envelope};

pub use auth_machine::{
    AuthError, AuthResult, MfaChallenge, Session, SignUpOptions, StateSnapshot, User,
};
pub use session_storage::{MemoryStorage, SessionStorage, StorageError};
