//! Periodic garbage collection of per-entity statistics.
//!
//! One [`SweepScheduler`]/[`Sweeper`] pair runs per monitored stats table.
//! The scheduler ticks on a fixed delay and asks the sweeper to examine a
//! slice of the table proportional to its current size; the sweeper walks
//! the key index behind a persistent cursor, re-verifies the liveness of
//! owners whose rows have gone stale, and publishes a synthetic close event
//! for owners that are confirmed gone. A [`CleanupConsumer`] turns those
//! events into row deletions.

pub mod consumer;
pub mod registry;
pub mod scheduler;
pub mod sweeper;

pub use consumer::CleanupConsumer;
pub use registry::{ReaperError, ReaperRegistry, TableBinding, TableId};
pub use scheduler::SweepScheduler;
pub use sweeper::{SweepSummary, Sweeper};
