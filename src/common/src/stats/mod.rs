//! In-memory per-entity statistics: the concurrently writable store that
//! producers update, and the ordered read-only view the sweeper scans.
//!
//! The sweeper never deletes rows itself; removal happens through
//! [`StatsStore::remove`], driven by a downstream consumer of cleanup events.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Name of a broker node, e.g. `broker@stats-1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Identity of the entity owning a stats row: the node it lives on plus a
/// per-node serial. Total order over `(node, serial)` drives index traversal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub node: NodeId,
    pub serial: u64,
}

impl EntityKey {
    pub fn new(node: impl Into<NodeId>, serial: u64) -> Self {
        Self {
            node: node.into(),
            serial,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.serial)
    }
}

/// One statistics row: an opaque aggregate plus the truncated timestamp of
/// its most recent update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRow {
    pub payload: serde_json::Value,
    /// Milliseconds since epoch, truncated to the sweep interval boundary
    /// at write time
    pub last_update_ms: i64,
}

/// Truncate a millisecond timestamp down to the nearest interval boundary.
///
/// Writers and the sweeper apply the same grain, so a row is only ever
/// "older" than now by whole intervals.
pub fn truncate_to_interval(ts_ms: i64, interval_ms: i64) -> i64 {
    if interval_ms <= 1 {
        return ts_ms;
    }
    ts_ms - ts_ms.rem_euclid(interval_ms)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Ordered traversal over the live keyset of a stats table.
///
/// `next_after` takes the key strictly after the argument in key order, so a
/// cursor pointing at a row that was deleted in the meantime still resumes
/// at the right place.
pub trait KeyIndex: Send + Sync {
    fn first(&self) -> Option<EntityKey>;
    fn next_after(&self, key: &EntityKey) -> Option<EntityKey>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Point lookup into a stats table. The index and the table are only
/// eventually consistent; a key returned by the index may miss here.
pub trait StatsTable: Send + Sync {
    fn lookup(&self, key: &EntityKey) -> Option<StatsRow>;
}

/// Concurrently writable stats table with an ordered keyset.
///
/// A single `BTreeMap` backs both [`StatsTable`] lookups and [`KeyIndex`]
/// traversal; all operations take the lock briefly, so scans never block
/// writers for longer than one step.
#[derive(Debug)]
pub struct StatsStore {
    interval_ms: i64,
    rows: RwLock<BTreeMap<EntityKey, StatsRow>>,
}

impl StatsStore {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as i64,
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Truncation grain shared by writers and the sweeper.
    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// Record an update for `key`, stamping the current wall clock.
    pub fn record(&self, key: EntityKey, payload: serde_json::Value) {
        self.record_at(key, payload, now_ms());
    }

    /// Record an update for `key` against an explicit clock reading.
    pub fn record_at(&self, key: EntityKey, payload: serde_json::Value, ts_ms: i64) {
        let row = StatsRow {
            payload,
            last_update_ms: truncate_to_interval(ts_ms, self.interval_ms),
        };
        self.write().insert(key, row);
    }

    /// Remove the row for `key`. Returns whether a row was present.
    pub fn remove(&self, key: &EntityKey) -> bool {
        self.write().remove(key).is_some()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.read().contains_key(key)
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<EntityKey, StatsRow>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<EntityKey, StatsRow>> {
        self.rows.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyIndex for StatsStore {
    fn first(&self) -> Option<EntityKey> {
        self.read().keys().next().cloned()
    }

    fn next_after(&self, key: &EntityKey) -> Option<EntityKey> {
        self.read()
            .range((Bound::Excluded(key.clone()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    fn len(&self) -> usize {
        self.read().len()
    }
}

impl StatsTable for StatsStore {
    fn lookup(&self, key: &EntityKey) -> Option<StatsRow> {
        self.read().get(key).cloned()
    }
}
