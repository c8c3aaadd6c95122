//! Downstream consumer that turns cleanup events into row deletions.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use common::events::{EventKind, EventSubscription};
use common::stats::StatsStore;

/// Deletes stats rows for entities reported closed.
///
/// The sweeper only signals; this consumer owns the actual removal, so every
/// deletion in the store flows through the same path whether the close was
/// observed synchronously or synthesized by the sweeper.
pub struct CleanupConsumer {
    kind: EventKind,
    store: Arc<StatsStore>,
    subscription: EventSubscription,
}

impl CleanupConsumer {
    pub fn new(kind: EventKind, store: Arc<StatsStore>, subscription: EventSubscription) -> Self {
        Self {
            kind,
            store,
            subscription,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(kind = %self.kind, "cleanup consumer started");

        while let Some(event) = self.subscription.recv().await {
            if event.kind != self.kind {
                continue;
            }
            if self.store.remove(&event.entity_key) {
                info!(kind = %event.kind, key = %event.entity_key, "purged stats row");
            } else {
                debug!(kind = %event.kind, key = %event.entity_key, "stats row already gone");
            }
        }

        info!(kind = %self.kind, "event bus closed, cleanup consumer stopping");
    }
}
