use crate::pending::{Completion, Outcome, Pending, State};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnel_broker_core::{ConnectionStatus, ManagedClusterStore};

/// A request to publish a cluster's connectivity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub cluster: String,
    pub status: ConnectionStatus,
}

#[derive(Copy, Clone, Debug)]
pub struct Config {
    pub tick: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    update_failures: Counter,
    not_synced: Gauge,
}

pub struct Controller {
    store: Arc<dyn ManagedClusterStore>,
    updates: mpsc::Receiver<Update>,
    config: Config,
    metrics: ControllerMetrics,
}

struct Attempted {
    cluster: String,
    outcome: Outcome,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let update_failures = Counter::default();
        prom.register(
            "status_update_failures",
            "Count of failed attempts to write a managed cluster's status",
            update_failures.clone(),
        );

        let not_synced = Gauge::default();
        prom.register(
            "clusters_not_synced",
            "Number of managed clusters whose status has not yet been written",
            not_synced.clone(),
        );

        Self {
            update_failures,
            not_synced,
        }
    }

    pub fn update_failures(&self) -> u64 {
        self.update_failures.get()
    }

    pub fn not_synced(&self) -> i64 {
        self.not_synced.get()
    }
}

// === impl Controller ===

impl Controller {
    pub fn new(
        store: Arc<dyn ManagedClusterStore>,
        updates: mpsc::Receiver<Update>,
        config: Config,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            store,
            updates,
            config,
            metrics,
        }
    }

    /// Processes status updates until `shutdown` fires or every sender is
    /// dropped and nothing remains pending.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut pending = Pending::new(self.config.initial_backoff, self.config.max_backoff);

        // The coordinator never awaits the store; attempts run on their own task.
        let (attempts_tx, attempts_rx) = mpsc::channel(1);
        let (results_tx, mut results_rx) = mpsc::channel(1);
        tokio::spawn(apply(self.store.clone(), attempts_rx, results_tx));

        let mut tick = time::interval(self.config.tick);
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut updates_closed = false;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            let now = Instant::now();

            loop {
                match self.updates.try_recv() {
                    Ok(Update { cluster, status }) => {
                        debug!(%cluster, %status, "Status requested");
                        pending.request(cluster, status, now);
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        updates_closed = true;
                        break;
                    }
                }
            }

            while let Ok(Attempted { cluster, outcome }) = results_rx.try_recv() {
                match pending.complete(&cluster, outcome, now) {
                    Completion::Discarded => debug!(%cluster, "Discarding superseded status update"),
                    Completion::Removed(State::NotFound) => {
                        info!(%cluster, "Managed cluster no longer exists; dropping status update")
                    }
                    Completion::Removed(_) => debug!(%cluster, "Status updated"),
                    Completion::Retry(delay) => {
                        self.metrics.update_failures.inc();
                        debug!(%cluster, ?delay, "Retrying status update");
                    }
                }
            }

            if let Some((cluster, status)) = pending.next(now) {
                if attempts_tx.try_send(Update { cluster, status }).is_err() {
                    warn!("Status applier is gone");
                    break;
                }
            }

            self.metrics.not_synced.set(pending.len() as i64);
            if updates_closed && pending.len() == 0 {
                break;
            }
        }
        debug!("Status controller stopped");
    }
}

async fn apply(
    store: Arc<dyn ManagedClusterStore>,
    mut attempts: mpsc::Receiver<Update>,
    results: mpsc::Sender<Attempted>,
) {
    while let Some(Update { cluster, status }) = attempts.recv().await {
        let outcome = match store.update_connected(&cluster, status).await {
            Ok(()) => Outcome::Succeeded,
            Err(error) if error.is_not_found() => Outcome::NotFound,
            Err(error) => {
                warn!(%cluster, %status, %error, "Failed to update status");
                Outcome::Failed
            }
        };
        if results.send(Attempted { cluster, outcome }).await.is_err() {
            return;
        }
    }
}
