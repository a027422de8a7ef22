//! In-process equivalent of the browser broadcast channel.
//!
//! Clients sharing the same channel key exchange encoded
//! [`BroadcastMessage`]s through a `tokio::sync::broadcast` channel held in
//! a process-global registry. Each client tags its posts with a holder id
//! so it can ignore its own messages.

use auth_machine::{BroadcastMessage, SessionBroadcast};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 32;

/// One message on the hub, tagged with its sender.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: Uuid,
    pub raw: String,
}

#[derive(Default)]
pub struct BroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl BroadcastHub {
    /// The process-wide hub all clients share.
    pub fn global() -> &'static BroadcastHub {
        static HUB: OnceLock<BroadcastHub> = OnceLock::new();
        HUB.get_or_init(BroadcastHub::default)
    }

    /// Join a channel by key, creating it on first use.
    pub fn connect(&self, key: &str, holder: Uuid) -> (ChannelBroadcaster, broadcast::Receiver<Envelope>) {
        let mut channels = self.channels.lock().unwrap();
        let sender = channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let receiver = sender.subscribe();
        (ChannelBroadcaster { sender, holder }, receiver)
    }
}

/// Posting half of a hub connection.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<Envelope>,
    holder: Uuid,
}

impl SessionBroadcast for ChannelBroadcaster {
    fn post(&self, message: &BroadcastMessage) {
        // Fire-and-forget; a send with no listeners is not an error
        let _ = self.sender.send(Envelope {
            sender: self.holder,
            raw: message.encode(),
        });
    }
}
