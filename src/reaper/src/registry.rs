//! Table bindings and the one-reaper-per-table registry.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use common::config::{LivenessConfig, SweepConfig};
use common::events::{EventBus, EventKind};
use common::liveness::LivenessVerifier;
use common::stats::{KeyIndex, StatsTable};

use crate::scheduler::SweepScheduler;
use crate::sweeper::Sweeper;

#[derive(Debug, thiserror::Error)]
pub enum ReaperError {
    /// A misconfigured binding would silently leak stats forever, so an
    /// unknown identifier refuses to start instead of no-opping.
    #[error("unrecognized stats table identifier: {0}")]
    UnknownTable(String),

    #[error("a reaper is already bound to the {0} table")]
    AlreadyBound(TableId),
}

/// The stats tables this service knows how to sweep. The binding fixes both
/// the index/store pair being scanned and the event kind emitted on cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableId {
    Channels,
    Connections,
}

impl TableId {
    pub fn event_kind(self) -> EventKind {
        match self {
            TableId::Channels => EventKind::ChannelClosed,
            TableId::Connections => EventKind::ConnectionClosed,
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableId::Channels => "channels",
            TableId::Connections => "connections",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TableId {
    type Err = ReaperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "channels" => Ok(TableId::Channels),
            "connections" => Ok(TableId::Connections),
            other => Err(ReaperError::UnknownTable(other.to_string())),
        }
    }
}

/// Everything a reaper instance needs to operate on one table.
pub struct TableBinding {
    pub table: TableId,
    pub index: Arc<dyn KeyIndex>,
    pub stats: Arc<dyn StatsTable>,
    pub verifier: Arc<dyn LivenessVerifier>,
    pub bus: Arc<dyn EventBus>,
}

struct ReaperInstance {
    id: Uuid,
    handle: JoinHandle<()>,
}

/// Tracks the running reaper per table and refuses duplicate bindings.
#[derive(Default)]
pub struct ReaperRegistry {
    running: Mutex<HashMap<TableId, ReaperInstance>>,
}

impl ReaperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the scheduler/sweeper pair for one table binding.
    pub fn start(
        &self,
        binding: TableBinding,
        sweep: &SweepConfig,
        liveness: &LivenessConfig,
    ) -> Result<Uuid, ReaperError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.contains_key(&binding.table) {
            return Err(ReaperError::AlreadyBound(binding.table));
        }

        let table = binding.table;
        let sweeper = Sweeper::new(
            table,
            binding.index.clone(),
            binding.stats,
            binding.verifier,
            binding.bus,
            sweep,
            liveness,
        );
        let handle = SweepScheduler::new(sweeper, binding.index, sweep).spawn();

        let id = Uuid::new_v4();
        info!(table = %table, reaper_id = %id, "reaper registered");
        running.insert(table, ReaperInstance { id, handle });
        Ok(id)
    }

    pub fn is_running(&self, table: TableId) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&table)
    }

    /// Stop every running reaper.
    pub fn shutdown(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        for (table, instance) in running.drain() {
            instance.handle.abort();
            info!(table = %table, reaper_id = %instance.id, "reaper stopped");
        }
    }
}

impl Drop for ReaperRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
