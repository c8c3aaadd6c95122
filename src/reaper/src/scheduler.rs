//! Fixed-delay drive of the sweep loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use common::config::SweepConfig;
use common::stats::KeyIndex;

use crate::sweeper::Sweeper;

/// Rows to examine this tick: a fixed fraction of the table, floored at
/// `min_rows`, capped at one full pass.
pub fn batch_size(table_size: usize, min_rows: usize, min_ratio: f64) -> usize {
    if table_size == 0 {
        return 0;
    }
    let scaled = (min_ratio * table_size as f64).round() as usize;
    scaled.max(min_rows).min(table_size)
}

/// Invokes the sweeper once per interval, sizing each batch against the
/// current table size.
///
/// The delay is measured from the end of one sweep to the start of the
/// next, so a slow pass postpones the following tick instead of stacking
/// concurrent sweeps.
pub struct SweepScheduler {
    interval: Duration,
    min_rows: usize,
    min_ratio: f64,
    index: Arc<dyn KeyIndex>,
    sweeper: Sweeper,
}

impl SweepScheduler {
    pub fn new(sweeper: Sweeper, index: Arc<dyn KeyIndex>, config: &SweepConfig) -> Self {
        Self {
            interval: config.interval,
            min_rows: config.min_rows,
            min_ratio: config.min_ratio,
            index,
            sweeper,
        }
    }

    /// Start the periodic cycle. The first sweep fires one interval after
    /// this call.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            table = %self.sweeper.table(),
            interval = ?self.interval,
            min_rows = self.min_rows,
            min_ratio = self.min_ratio,
            "sweep scheduler started"
        );

        loop {
            tokio::time::sleep(self.interval).await;
            self.tick().await;
        }
    }

    async fn tick(&mut self) {
        let table_size = self.index.len();
        let rows = batch_size(table_size, self.min_rows, self.min_ratio);
        if rows == 0 {
            trace!(table = %self.sweeper.table(), "table empty, nothing to sweep");
            return;
        }

        // A panicking pass must not take the scheduling loop down with it;
        // stale rows would then accumulate unbounded.
        match AssertUnwindSafe(self.sweeper.sweep(rows)).catch_unwind().await {
            Ok(summary) => {
                debug!(
                    table = %self.sweeper.table(),
                    table_size,
                    batch = rows,
                    visited = summary.visited,
                    missing = summary.missing,
                    stale = summary.stale,
                    inconclusive = summary.inconclusive,
                    reaped = summary.reaped,
                    wrapped = summary.wrapped,
                    "sweep pass finished"
                );
            }
            Err(_) => {
                error!(
                    table = %self.sweeper.table(),
                    "sweep pass panicked, continuing on next tick"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;

    use common::config::LivenessConfig;
    use common::events::{Event, EventBus, EventBusError};
    use common::liveness::{Liveness, LivenessVerifier};
    use common::stats::{EntityKey, StatsStore};

    use crate::registry::TableId;

    #[test]
    fn test_batch_size_formula() {
        // Minimum floor dominates small tables
        assert_eq!(batch_size(1_000, 50, 0.001), 50);
        // Ratio dominates large tables
        assert_eq!(batch_size(1_000_000, 50, 0.001), 1_000);
        // Never more than one full pass
        assert_eq!(batch_size(10, 50, 0.001), 10);
        // Empty table means no work at all
        assert_eq!(batch_size(0, 50, 0.001), 0);
    }

    #[test]
    fn test_batch_size_rounds_ratio() {
        assert_eq!(batch_size(1_499_000, 50, 0.001), 1_499);
        assert_eq!(batch_size(1_500_000, 50, 0.001), 1_500);
    }

    struct NullVerifier;

    #[async_trait::async_trait]
    impl LivenessVerifier for NullVerifier {
        async fn check(&self, _key: &EntityKey, _timeout: Duration) -> Liveness {
            Liveness::Alive
        }
    }

    /// Bus double that records publication attempts.
    #[derive(Default)]
    struct NullBus {
        published: Mutex<Vec<Event>>,
    }

    #[async_trait::async_trait]
    impl EventBus for NullBus {
        async fn publish(&self, event: Event) -> Result<(), EventBusError> {
            self.published.lock().unwrap().push(event);
            Ok(())
        }
    }

    /// Index double counting how often the scheduler sizes a batch.
    struct CountingIndex {
        inner: Arc<StatsStore>,
        len_calls: Mutex<usize>,
    }

    impl KeyIndex for CountingIndex {
        fn first(&self) -> Option<EntityKey> {
            self.inner.first()
        }

        fn next_after(&self, key: &EntityKey) -> Option<EntityKey> {
            self.inner.next_after(key)
        }

        fn len(&self) -> usize {
            *self.len_calls.lock().unwrap() += 1;
            self.inner.len()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_fires_after_one_interval() {
        let sweep_config = SweepConfig {
            interval: Duration::from_secs(60),
            ..SweepConfig::default()
        };
        let store = Arc::new(StatsStore::new(sweep_config.interval));
        store.record(EntityKey::new("broker@localhost", 1), json!({}));
        let index = Arc::new(CountingIndex {
            inner: store.clone(),
            len_calls: Mutex::new(0),
        });
        let sweeper = Sweeper::new(
            TableId::Channels,
            store.clone(),
            store.clone(),
            Arc::new(NullVerifier),
            Arc::new(NullBus::default()),
            &sweep_config,
            &LivenessConfig::default(),
        );

        let handle = SweepScheduler::new(sweeper, index.clone(), &sweep_config).spawn();

        // Just short of one interval: no tick yet
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(*index.len_calls.lock().unwrap(), 0);

        // Crossing the interval boundary fires the first tick
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*index.len_calls.lock().unwrap(), 1);

        handle.abort();
    }
}
