//! Cross-context session broadcasting.
//!
//! The machine only knows the message format and a capability trait for
//! posting; the actual channel (browser BroadcastChannel, in-process hub) is
//! supplied by the embedder. A missing channel degrades to a no-op.

use crate::context::User;
use serde::{Deserialize, Serialize};

/// Payload of a full-session broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    /// Refresh token value
    pub token: String,
    pub user: User,
    pub access_token: String,
    pub expires_in_seconds: i64,
}

/// Payload of a token-only broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub token: String,
}

/// Messages exchanged between contexts sharing a channel key.
///
/// There is no envelope versioning or acknowledgment; consumers treat
/// unknown `type` values as no-ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    BroadcastSession { payload: SessionPayload },
    BroadcastToken { payload: TokenPayload },
    Signout,
}

impl BroadcastMessage {
    /// Decode a raw channel message. Unknown message types and malformed
    /// payloads yield `None` rather than an error.
    pub fn decode(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(message) => Some(message),
            Err(error) => {
                tracing::debug!(%error, "Ignoring unrecognized broadcast message");
                None
            }
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Posting side of the broadcast channel. Fire-and-forget, at-most-once.
pub trait SessionBroadcast: Send + Sync {
    fn post(&self, message: &BroadcastMessage);
}

/// Broadcast disabled (no channel key, or the platform has no channel).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBroadcast;

impl SessionBroadcast for NoBroadcast {
    fn post(&self, _message: &BroadcastMessage) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_user() -> User {
        User {
            id: "user-1".to_string(),
            email: None,
            display_name: None,
            avatar_url: None,
            is_anonymous: false,
        }
    }

    #[test]
    fn session_message_wire_format() {
        let message = BroadcastMessage::BroadcastSession {
            payload: SessionPayload {
                token: "refresh-1".to_string(),
                user: fake_user(),
                access_token: "access-1".to_string(),
                expires_in_seconds: 900,
            },
        };
        let json: serde_json::Value = serde_json::from_str(&message.encode()).unwrap();
        assert_eq!(json["type"], "broadcast_session");
        assert_eq!(json["payload"]["token"], "refresh-1");
        assert_eq!(json["payload"]["expiresInSeconds"], 900);
    }

    #[test]
    fn signout_message_has_no_payload() {
        let json: serde_json::Value =
            serde_json::from_str(&BroadcastMessage::Signout.encode()).unwrap();
        assert_eq!(json["type"], "signout");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn decode_round_trips() {
        let message = BroadcastMessage::BroadcastToken {
            payload: TokenPayload {
                token: "t".to_string(),
            },
        };
        assert_eq!(BroadcastMessage::decode(&message.encode()), Some(message));
    }

    #[test]
    fn unknown_type_is_ignored() {
        assert!(BroadcastMessage::decode(r#"{"type":"future_thing","payload":{}}"#).is_none());
        assert!(BroadcastMessage::decode("not json").is_none());
    }
}
