//! Cursor-based incremental scan over one stats table.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use common::config::{LivenessConfig, SweepConfig};
use common::events::{Event, EventBus};
use common::liveness::{Liveness, LivenessVerifier};
use common::stats::{now_ms, truncate_to_interval, EntityKey, KeyIndex, StatsTable};

use crate::registry::TableId;

/// Counters for one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Keys taken from the index this pass
    pub visited: usize,
    /// Keys whose row had vanished from the store
    pub missing: usize,
    /// Rows older than the gc timeout
    pub stale: usize,
    /// Stale rows whose owner turned out to be alive
    pub alive: usize,
    /// Stale rows with an inconclusive liveness verdict
    pub inconclusive: usize,
    /// Close events successfully published
    pub reaped: usize,
    /// Close events that failed to publish
    pub publish_failures: usize,
    /// Whether this pass exhausted the index and reset the cursor
    pub wrapped: bool,
}

/// Walks the key index in bounded batches, deciding per visited key whether
/// the owning entity is dead and, if so, publishing a cleanup event.
///
/// The sweeper reads the store and index but never mutates them; deletion
/// happens downstream of the published events. The cursor is the only state
/// carried between passes.
pub struct Sweeper {
    table: TableId,
    index: Arc<dyn KeyIndex>,
    stats: Arc<dyn StatsTable>,
    verifier: Arc<dyn LivenessVerifier>,
    bus: Arc<dyn EventBus>,
    gc_timeout_ms: i64,
    grain_ms: i64,
    check_timeout: Duration,
    cursor: Option<EntityKey>,
}

impl Sweeper {
    pub fn new(
        table: TableId,
        index: Arc<dyn KeyIndex>,
        stats: Arc<dyn StatsTable>,
        verifier: Arc<dyn LivenessVerifier>,
        bus: Arc<dyn EventBus>,
        sweep: &SweepConfig,
        liveness: &LivenessConfig,
    ) -> Self {
        Self {
            table,
            index,
            stats,
            verifier,
            bus,
            gc_timeout_ms: sweep.gc_timeout.as_millis() as i64,
            grain_ms: sweep.interval.as_millis() as i64,
            check_timeout: liveness.check_timeout,
            cursor: None,
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    /// Advance the cursor by up to `max_rows` keys against the current wall
    /// clock.
    pub async fn sweep(&mut self, max_rows: usize) -> SweepSummary {
        let now = truncate_to_interval(now_ms(), self.grain_ms);
        self.sweep_at(now, max_rows).await
    }

    /// Advance the cursor by up to `max_rows` keys against an explicit clock
    /// reading, already truncated to the interval grain. Every key visited
    /// in one call shares this snapshot.
    pub async fn sweep_at(&mut self, now_ms: i64, max_rows: usize) -> SweepSummary {
        let mut summary = SweepSummary::default();

        for _ in 0..max_rows {
            let next = match &self.cursor {
                None => self.index.first(),
                Some(last) => self.index.next_after(last),
            };

            let Some(key) = next else {
                // Index exhausted: wrap and leave the rest of the batch to
                // the next pass rather than re-reading a shrinking tail.
                self.cursor = None;
                summary.wrapped = true;
                break;
            };

            self.cursor = Some(key.clone());
            self.visit(&key, now_ms, &mut summary).await;
        }

        summary
    }

    async fn visit(&self, key: &EntityKey, now_ms: i64, summary: &mut SweepSummary) {
        summary.visited += 1;

        let Some(row) = self.stats.lookup(key) else {
            // Row vanished between the index read and the store read;
            // somebody else already cleaned up.
            summary.missing += 1;
            trace!(table = %self.table, key = %key, "stats row already gone");
            return;
        };

        let age_ms = now_ms - row.last_update_ms;
        if age_ms < self.gc_timeout_ms {
            trace!(table = %self.table, key = %key, age_ms, "row recently updated");
            return;
        }

        summary.stale += 1;
        match self.verifier.check(key, self.check_timeout).await {
            Liveness::Alive => {
                summary.alive += 1;
                trace!(table = %self.table, key = %key, age_ms, "owner alive, keeping stale row");
            }
            Liveness::Unknown => {
                summary.inconclusive += 1;
                debug!(
                    table = %self.table,
                    key = %key,
                    "liveness verdict inconclusive, retrying on a later pass"
                );
            }
            Liveness::Dead => {
                let event = Event::closed(self.table.event_kind(), key.clone());
                debug!(
                    table = %self.table,
                    key = %key,
                    age_ms,
                    kind = %event.kind,
                    "owner is gone, publishing cleanup event"
                );
                match self.bus.publish(event).await {
                    Ok(()) => summary.reaped += 1,
                    Err(e) => {
                        // The row stays stale, so the next pass retries.
                        summary.publish_failures += 1;
                        warn!(
                            table = %self.table,
                            key = %key,
                            error = %e,
                            "failed to publish cleanup event"
                        );
                    }
                }
            }
        }
    }
}
