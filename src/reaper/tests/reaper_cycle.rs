//! End-to-end reaper cycle: stale rows are detected, dead owners verified,
//! close events published, and rows purged by the cleanup consumer.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::config::{LivenessConfig, SweepConfig};
use common::events::InMemoryEventBus;
use common::liveness::{ClusterVerifier, InMemoryCluster, PresenceRegistry};
use common::stats::{EntityKey, KeyIndex, NodeId, StatsStore};
use reaper::{CleanupConsumer, Sweeper, TableId};

const NOW: i64 = 10_000_000;

fn configs() -> (SweepConfig, LivenessConfig) {
    let sweep = SweepConfig {
        // 1 ms grain keeps test timestamps exact
        interval: Duration::from_millis(1),
        gc_timeout: Duration::from_secs(5),
        ..SweepConfig::default()
    };
    (sweep, LivenessConfig::default())
}

struct Harness {
    store: Arc<StatsStore>,
    presence: Arc<PresenceRegistry>,
    cluster: Arc<InMemoryCluster>,
    bus: Arc<InMemoryEventBus>,
    sweeper: Sweeper,
}

fn harness(table: TableId) -> Harness {
    let (sweep, liveness) = configs();
    let store = Arc::new(StatsStore::new(sweep.interval));
    let presence = Arc::new(PresenceRegistry::new(NodeId::from("broker@local")));
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.join(presence.clone());
    let bus = Arc::new(InMemoryEventBus::new());
    let sweeper = Sweeper::new(
        table,
        store.clone(),
        store.clone(),
        Arc::new(ClusterVerifier::new(presence.clone(), cluster.clone())),
        bus.clone(),
        &sweep,
        &liveness,
    );
    Harness {
        store,
        presence,
        cluster,
        bus,
        sweeper,
    }
}

async fn wait_until_gone(store: &StatsStore, key: &EntityKey) -> bool {
    for _ in 0..100 {
        if !store.contains(key) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn dead_owner_row_is_purged_while_others_survive() {
    let mut h = harness(TableId::Channels);

    let dead = EntityKey::new("broker@local", 1);
    let alive = EntityKey::new("broker@local", 2);
    let unreachable = EntityKey::new("broker@partitioned", 3);

    // All three rows went stale an interval ago
    for key in [&dead, &alive, &unreachable] {
        h.store.record_at(key.clone(), json!({"msgs": 1}), NOW - 6_000);
    }
    // Only the second owner is still registered as present
    h.presence.register(alive.clone());

    let consumer = CleanupConsumer::new(
        TableId::Channels.event_kind(),
        h.store.clone(),
        h.bus.subscribe(),
    )
    .spawn();

    let summary = h.sweeper.sweep_at(NOW, 10).await;
    assert_eq!(summary.visited, 3);
    assert_eq!(summary.stale, 3);
    assert_eq!(summary.reaped, 1);
    assert_eq!(summary.alive, 1);
    assert_eq!(summary.inconclusive, 1);

    assert!(wait_until_gone(&h.store, &dead).await);
    assert!(h.store.contains(&alive));
    assert!(h.store.contains(&unreachable));

    consumer.abort();
}

#[tokio::test]
async fn unreachable_owner_is_retried_once_node_responds() {
    let mut h = harness(TableId::Channels);

    let key = EntityKey::new("broker@remote", 9);
    h.store.record_at(key.clone(), json!({}), NOW - 6_000);

    let consumer = CleanupConsumer::new(
        TableId::Channels.event_kind(),
        h.store.clone(),
        h.bus.subscribe(),
    )
    .spawn();

    // First pass: the remote node is unreachable, nothing happens
    let summary = h.sweeper.sweep_at(NOW, 10).await;
    assert_eq!(summary.inconclusive, 1);
    assert!(h.store.contains(&key));

    // The node comes back and authoritatively reports the entity gone
    let remote = Arc::new(PresenceRegistry::new(NodeId::from("broker@remote")));
    h.cluster.join(remote);

    // The cursor sits on the only key, so the next pass just wraps
    let summary = h.sweeper.sweep_at(NOW, 10).await;
    assert!(summary.wrapped);
    assert_eq!(summary.visited, 0);

    let summary = h.sweeper.sweep_at(NOW, 10).await;
    assert_eq!(summary.reaped, 1);
    assert!(wait_until_gone(&h.store, &key).await);

    consumer.abort();
}

#[tokio::test]
async fn table_bindings_stay_isolated() {
    let mut channels = harness(TableId::Channels);
    let mut connections = harness(TableId::Connections);

    let channel_key = EntityKey::new("broker@local", 1);
    let connection_key = EntityKey::new("broker@local", 1);
    channels
        .store
        .record_at(channel_key.clone(), json!({}), NOW - 6_000);
    connections
        .store
        .record_at(connection_key.clone(), json!({}), NOW - 6_000);

    let channel_consumer = CleanupConsumer::new(
        TableId::Channels.event_kind(),
        channels.store.clone(),
        channels.bus.subscribe(),
    )
    .spawn();
    let connection_consumer = CleanupConsumer::new(
        TableId::Connections.event_kind(),
        connections.store.clone(),
        connections.bus.subscribe(),
    )
    .spawn();

    // Sweep only the channel table
    let summary = channels.sweeper.sweep_at(NOW, 10).await;
    assert_eq!(summary.reaped, 1);

    assert!(wait_until_gone(&channels.store, &channel_key).await);
    // The connection table was never touched
    assert!(connections.store.contains(&connection_key));
    assert_eq!(connections.store.len(), 1);

    // Sweeping the connection table catches up independently
    let summary = connections.sweeper.sweep_at(NOW, 10).await;
    assert_eq!(summary.reaped, 1);
    assert!(wait_until_gone(&connections.store, &connection_key).await);

    channel_consumer.abort();
    connection_consumer.abort();
}

#[tokio::test]
async fn full_pass_reaps_every_dead_owner() {
    let mut h = harness(TableId::Connections);

    for serial in 1..=10 {
        h.store.record_at(
            EntityKey::new("broker@local", serial),
            json!({}),
            NOW - 6_000,
        );
    }

    let consumer = CleanupConsumer::new(
        TableId::Connections.event_kind(),
        h.store.clone(),
        h.bus.subscribe(),
    )
    .spawn();

    // ceil(10 / 3) = 4 bounded passes cover the table once
    let mut reaped = 0;
    for _ in 0..4 {
        reaped += h.sweeper.sweep_at(NOW, 3).await.reaped;
    }
    assert_eq!(reaped, 10);

    for serial in 1..=10 {
        assert!(wait_until_gone(&h.store, &EntityKey::new("broker@local", serial)).await);
    }

    consumer.abort();
}
