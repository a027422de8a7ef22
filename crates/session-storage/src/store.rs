//! High-level API for persisted session credentials.

use crate::{SessionStorage, StorageKeys, StorageResult};
use chrono::{DateTime, Utc};

/// The subset of a session that is persisted between reloads.
///
/// The access token itself and the user profile are deliberately absent: they
/// are kept in memory only and re-derived through a refresh on startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSession {
    /// Refresh token value
    pub refresh_token: String,
    /// Refresh token identifier, when the backend rotates by id
    pub refresh_token_id: Option<String>,
    /// When the access token minted alongside this refresh token expires
    pub expires_at: Option<DateTime<Utc>>,
}

/// Typed accessor over a [`SessionStorage`] backend.
pub struct SessionStore {
    storage: Box<dyn SessionStorage>,
}

impl SessionStore {
    /// Create a new store with the given storage backend
    pub fn new(storage: Box<dyn SessionStorage>) -> Self {
        Self { storage }
    }

    /// Store the refresh token value
    pub fn set_refresh_token(&self, token: &str) -> StorageResult<()> {
        self.storage.set(StorageKeys::REFRESH_TOKEN, token)
    }

    /// Retrieve the refresh token value
    pub fn get_refresh_token(&self) -> StorageResult<Option<String>> {
        self.storage.get(StorageKeys::REFRESH_TOKEN)
    }

    /// Store the refresh token identifier
    pub fn set_refresh_token_id(&self, id: &str) -> StorageResult<()> {
        self.storage.set(StorageKeys::REFRESH_TOKEN_ID, id)
    }

    /// Retrieve the refresh token identifier
    pub fn get_refresh_token_id(&self) -> StorageResult<Option<String>> {
        self.storage.get(StorageKeys::REFRESH_TOKEN_ID)
    }

    /// Store the access-token expiry as an ISO timestamp
    pub fn set_expires_at(&self, expires_at: DateTime<Utc>) -> StorageResult<()> {
        self.storage
            .set(StorageKeys::ACCESS_TOKEN_EXPIRES_AT, &expires_at.to_rfc3339())
    }

    /// Retrieve the access-token expiry.
    ///
    /// A value that fails to parse is treated as absent rather than an error;
    /// the holder will simply refresh.
    pub fn get_expires_at(&self) -> StorageResult<Option<DateTime<Utc>>> {
        match self.storage.get(StorageKeys::ACCESS_TOKEN_EXPIRES_AT)? {
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(parsed) => Ok(Some(parsed.with_timezone(&Utc))),
                Err(error) => {
                    tracing::warn!(%error, "Discarding unparsable stored expiry");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Delete the stored access-token expiry
    pub fn clear_expires_at(&self) -> StorageResult<()> {
        let _ = self.storage.delete(StorageKeys::ACCESS_TOKEN_EXPIRES_AT);
        Ok(())
    }

    /// Store a complete persisted session
    pub fn persist(&self, session: &PersistedSession) -> StorageResult<()> {
        self.set_refresh_token(&session.refresh_token)?;
        match &session.refresh_token_id {
            Some(id) => self.set_refresh_token_id(id)?,
            None => {
                let _ = self.storage.delete(StorageKeys::REFRESH_TOKEN_ID);
            }
        }
        match session.expires_at {
            Some(expires_at) => self.set_expires_at(expires_at)?,
            None => self.clear_expires_at()?,
        }
        Ok(())
    }

    /// Read the complete persisted session, if a refresh token is present
    pub fn load(&self) -> StorageResult<Option<PersistedSession>> {
        let refresh_token = match self.get_refresh_token()? {
            Some(token) => token,
            None => return Ok(None),
        };
        Ok(Some(PersistedSession {
            refresh_token,
            refresh_token_id: self.get_refresh_token_id()?,
            expires_at: self.get_expires_at()?,
        }))
    }

    /// Clear every persisted credential. Always clears all keys together.
    pub fn clear(&self) -> StorageResult<()> {
        let _ = self.storage.delete(StorageKeys::REFRESH_TOKEN);
        let _ = self.storage.delete(StorageKeys::REFRESH_TOKEN_ID);
        let _ = self.storage.delete(StorageKeys::ACCESS_TOKEN_EXPIRES_AT);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;
    use chrono::Duration;

    fn create_store() -> SessionStore {
        SessionStore::new(Box::new(MemoryStorage::new()))
    }

    #[test]
    fn store_starts_empty() {
        let store = create_store();
        assert!(store.load().unwrap().is_none());
        assert!(store.get_refresh_token().unwrap().is_none());
        assert!(store.get_expires_at().unwrap().is_none());
    }

    #[test]
    fn persist_then_load_round_trips() {
        let store = create_store();
        let expires_at = Utc::now() + Duration::minutes(15);

        let session = PersistedSession {
            refresh_token: "refresh-123".to_string(),
            refresh_token_id: Some("id-456".to_string()),
            expires_at: Some(expires_at),
        };
        store.persist(&session).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.refresh_token, "refresh-123");
        assert_eq!(loaded.refresh_token_id.as_deref(), Some("id-456"));
        // RFC 3339 keeps sub-second precision, so the timestamp survives
        assert_eq!(
            loaded.expires_at.unwrap().timestamp_millis(),
            expires_at.timestamp_millis()
        );
    }

    #[test]
    fn persist_without_id_removes_stale_id() {
        let store = create_store();
        store.set_refresh_token_id("stale").unwrap();

        store
            .persist(&PersistedSession {
                refresh_token: "t".to_string(),
                refresh_token_id: None,
                expires_at: None,
            })
            .unwrap();

        assert!(store.get_refresh_token_id().unwrap().is_none());
        assert!(store.get_expires_at().unwrap().is_none());
    }

    #[test]
    fn clear_removes_all_keys_together() {
        let store = create_store();
        store
            .persist(&PersistedSession {
                refresh_token: "t".to_string(),
                refresh_token_id: Some("id".to_string()),
                expires_at: Some(Utc::now()),
            })
            .unwrap();

        store.clear().unwrap();

        assert!(store.get_refresh_token().unwrap().is_none());
        assert!(store.get_refresh_token_id().unwrap().is_none());
        assert!(store.get_expires_at().unwrap().is_none());
    }

    #[test]
    fn unparsable_expiry_is_treated_as_absent() {
        let storage = MemoryStorage::new();
        storage
            .set(StorageKeys::ACCESS_TOKEN_EXPIRES_AT, "not-a-date")
            .unwrap();
        let store = SessionStore::new(Box::new(storage));
        assert!(store.get_expires_at().unwrap().is_none());
    }
}
