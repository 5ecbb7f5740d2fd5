use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-identity booking event streams.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for an identity key. Creates the channel if needed.
    pub fn subscribe(&self, identity: &str) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(identity.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, identity: &str, event: &Event) {
        if let Some(sender) = self.channels.get(identity) {
            let _ = sender.send(event.clone());
        }
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}
