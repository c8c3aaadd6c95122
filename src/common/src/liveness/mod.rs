//! Owner liveness verification.
//!
//! A stale stats row alone does not justify cleanup; the owning entity may
//! simply be idle. Before emitting a close event the sweeper asks whether
//! the owner still exists: authoritatively for local keys, via a
//! timeout-bounded status query for keys owned by another node. A query
//! that cannot complete in time yields `Unknown`, which callers treat as
//! "do nothing this round".

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::stats::{EntityKey, NodeId};

/// Verdict of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// The owning node could not be reached in time; no verdict
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    #[error("node {0} is not reachable")]
    Unreachable(NodeId),

    #[error("status query failed: {0}")]
    Query(String),
}

/// Answers whether the owner of an entity key still exists.
#[async_trait]
pub trait LivenessVerifier: Send + Sync {
    async fn check(&self, key: &EntityKey, timeout: Duration) -> Liveness;
}

/// Cross-node status query. Implementations resolve whether `key` exists on
/// `node`; the caller bounds the call with a deadline.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn entity_exists(&self, node: &NodeId, key: &EntityKey) -> Result<bool, LivenessError>;
}

/// Authoritative record of the entities alive on one node.
///
/// Session lifecycles register on open and deregister on close; a key absent
/// here is definitively dead as far as this node is concerned.
#[derive(Debug)]
pub struct PresenceRegistry {
    node: NodeId,
    live: RwLock<HashSet<EntityKey>>,
}

impl PresenceRegistry {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            live: RwLock::new(HashSet::new()),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn register(&self, key: EntityKey) {
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
    }

    pub fn deregister(&self, key: &EntityKey) -> bool {
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

/// Liveness verifier combining the local presence registry with a node
/// transport for remote keys.
pub struct ClusterVerifier {
    local: Arc<PresenceRegistry>,
    transport: Arc<dyn NodeTransport>,
}

impl ClusterVerifier {
    pub fn new(local: Arc<PresenceRegistry>, transport: Arc<dyn NodeTransport>) -> Self {
        Self { local, transport }
    }
}

#[async_trait]
impl LivenessVerifier for ClusterVerifier {
    async fn check(&self, key: &EntityKey, timeout: Duration) -> Liveness {
        if key.node == *self.local.node() {
            return if self.local.contains(key) {
                Liveness::Alive
            } else {
                Liveness::Dead
            };
        }

        match tokio::time::timeout(timeout, self.transport.entity_exists(&key.node, key)).await {
            Ok(Ok(true)) => Liveness::Alive,
            Ok(Ok(false)) => Liveness::Dead,
            Ok(Err(e)) => {
                debug!(key = %key, error = %e, "status query failed, verdict unknown");
                Liveness::Unknown
            }
            Err(_) => {
                debug!(key = %key, ?timeout, "status query timed out, verdict unknown");
                Liveness::Unknown
            }
        }
    }
}

/// Transport over an in-process set of presence registries, one per node.
///
/// Backs single-process deployments and tests; a node with no registered
/// registry behaves like an unreachable peer.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    nodes: RwLock<HashMap<NodeId, Arc<PresenceRegistry>>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, registry: Arc<PresenceRegistry>) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(registry.node().clone(), registry);
    }

    pub fn leave(&self, node: &NodeId) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node);
    }

    fn registry(&self, node: &NodeId) -> Option<Arc<PresenceRegistry>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .cloned()
    }
}

#[async_trait]
impl NodeTransport for InMemoryCluster {
    async fn entity_exists(&self, node: &NodeId, key: &EntityKey) -> Result<bool, LivenessError> {
        match self.registry(node) {
            Some(registry) => Ok(registry.contains(key)),
            None => Err(LivenessError::Unreachable(node.clone())),
        }
    }
}
