use crate::{Config, Controller, ControllerMetrics, Update};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tunnel_broker_core::{mem, ConnectionStatus, ManagedCluster};

struct Harness {
    store: Arc<mem::Store>,
    updates: mpsc::Sender<Update>,
    metrics: ControllerMetrics,
    shutdown: CancellationToken,
}

fn spawn() -> Harness {
    let store = Arc::new(mem::Store::default());
    let (updates, rx) = mpsc::channel(10_000);
    let metrics = ControllerMetrics::register(&mut Default::default());
    let shutdown = CancellationToken::new();
    let controller = Controller::new(store.clone(), rx, Config::default(), metrics.clone());
    tokio::spawn(controller.run(shutdown.clone()));
    Harness {
        store,
        updates,
        metrics,
        shutdown,
    }
}

impl Harness {
    async fn send(&self, cluster: &str, status: ConnectionStatus) {
        self.updates
            .send(Update {
                cluster: cluster.to_string(),
                status,
            })
            .await
            .expect("controller must be running");
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    time::timeout(Duration::from_secs(120), async {
        while !check() {
            time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test(start_paused = true)]
async fn coalesces_to_last_requested_status() {
    let h = spawn();
    h.store.apply(ManagedCluster::new("mc-one"));

    h.send("mc-one", ConnectionStatus::Connected).await;
    h.send("mc-one", ConnectionStatus::NotConnected).await;
    h.send("mc-one", ConnectionStatus::Connected).await;

    eventually(|| h.metrics.not_synced() == 0 && !h.store.status_updates().is_empty())
        .await;
    time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.store.connected("mc-one"), Some(ConnectionStatus::Connected));
    let updates = h.store.status_updates();
    assert!(updates.len() <= 3, "too many writes: {updates:?}");
    assert_eq!(
        updates.last(),
        Some(&("mc-one".to_string(), ConnectionStatus::Connected))
    );
    h.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn retries_failures_with_backoff() {
    let h = spawn();
    h.store.apply(ManagedCluster::new("mc-one"));
    h.store.fail_status_updates(2);

    let start = Instant::now();
    h.send("mc-one", ConnectionStatus::Connected).await;
    eventually(|| h.store.connected("mc-one").is_some()).await;

    assert_eq!(h.metrics.update_failures(), 2);
    assert!(
        start.elapsed() >= Duration::from_secs(3),
        "retried too eagerly after {:?}",
        start.elapsed()
    );
    assert_eq!(
        h.store.status_updates(),
        vec![("mc-one".to_string(), ConnectionStatus::Connected)]
    );
    h.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn drops_updates_for_missing_clusters() {
    let h = spawn();
    h.send("gone", ConnectionStatus::NotConnected).await;
    h.store.apply(ManagedCluster::new("mc-one"));
    h.send("mc-one", ConnectionStatus::NotConnected).await;

    eventually(|| h.store.connected("mc-one").is_some()).await;
    eventually(|| h.metrics.not_synced() == 0).await;

    assert_eq!(h.metrics.update_failures(), 0);
    assert_eq!(
        h.store.status_updates(),
        vec![("mc-one".to_string(), ConnectionStatus::NotConnected)]
    );
    h.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn stops_when_senders_are_gone() {
    let store = Arc::new(mem::Store::default());
    let (updates, rx) = mpsc::channel(1);
    let controller = Controller::new(
        store,
        rx,
        Config::default(),
        ControllerMetrics::default(),
    );
    let task = tokio::spawn(controller.run(CancellationToken::new()));
    drop(updates);
    time::timeout(Duration::from_secs(10), task)
        .await
        .expect("controller must stop")
        .unwrap();
}
