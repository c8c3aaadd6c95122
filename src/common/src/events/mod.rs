//! Cleanup event plumbing: typed "entity closed" notifications published by
//! the sweeper and consumed by whatever owns row deletion.
//!
//! Publishing is fire-and-forget; the bus gives no delivery guarantee beyond
//! best effort to currently attached subscribers.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::stats::{now_ms, EntityKey};

const DEFAULT_CHANNEL_SIZE: usize = 1024;

/// Kind of synthetic close notification, one per monitored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChannelClosed,
    ConnectionClosed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::ChannelClosed => "channel_closed",
            EventKind::ConnectionClosed => "connection_closed",
        };
        write!(f, "{}", s)
    }
}

/// A deletion-trigger event for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub entity_key: EntityKey,
    /// Milliseconds since epoch at emission time
    pub emitted_at_ms: i64,
}

impl Event {
    pub fn closed(kind: EventKind, entity_key: EntityKey) -> Self {
        Self {
            kind,
            entity_key,
            emitted_at_ms: now_ms(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EventBusError> {
        serde_json::to_vec(self).map_err(EventBusError::Serialization)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventBusError> {
        serde_json::from_slice(bytes).map_err(EventBusError::Serialization)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("failed to publish event: {0}")]
    Publish(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Fire-and-forget event publication.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), EventBusError>;
}

/// In-memory event bus over tokio's broadcast channel.
#[derive(Debug)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<Vec<u8>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CHANNEL_SIZE);
        Self { sender }
    }

    /// Attach a subscriber. Events published before this call are not
    /// replayed.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let bytes = event.to_bytes()?;
        self.sender
            .send(bytes)
            .map(|_| ())
            .map_err(|_| EventBusError::Publish(String::from("no attached subscribers")))
    }
}

/// Receiving side of the in-memory bus.
pub struct EventSubscription {
    receiver: broadcast::Receiver<Vec<u8>>,
}

impl EventSubscription {
    /// Next event, or `None` once the bus is gone. Lagged and undecodable
    /// messages are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(bytes) => match Event::from_bytes(&bytes) {
                    Ok(event) => return Some(event),
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable event");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
