//! Storage abstraction for persisted session credentials.
//!
//! Only a small subset of a session survives a reload: the refresh token, its
//! identifier, and the access-token expiry timestamp. This crate provides the
//! pluggable [`SessionStorage`] trait those values are written through, an
//! in-memory backend, and the typed [`SessionStore`] API on top.
//!
//! Platform backends (cookies, OS keychains, secure enclaves) implement
//! [`SessionStorage`] outside this crate; asynchronous APIs are expected to
//! wrap their own blocking shim behind the trait.

mod keys;
mod memory;
mod store;
mod traits;

pub use keys::StorageKeys;
pub use memory::MemoryStorage;
pub use store::{PersistedSession, SessionStore};
pub use traits::SessionStorage;

use thiserror::Error;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend-specific failure (keychain locked, cookie jar unavailable, ...)
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Encoding/decoding error
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
