use ahash::AHashMap as HashMap;
use tokio::time::{Duration, Instant};
use tunnel_broker_core::ConnectionStatus;

/// Status writes waiting to be applied, keyed by cluster.
///
/// At most one attempt is outstanding across all clusters.
#[derive(Debug)]
pub(crate) struct Pending {
    entries: HashMap<String, PendingStatus>,
    outstanding: bool,
    initial_backoff: Duration,
    max_backoff: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PendingStatus {
    pub status: ConnectionStatus,
    pub state: State,
    pub backoff: Duration,
    pub retry_at: Instant,
    pub in_progress: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Initial,
    Failed,
    Succeeded,
    NotFound,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Succeeded,
    NotFound,
    Failed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Completion {
    /// The entry was superseded while the attempt ran.
    Discarded,
    Removed(State),
    Retry(Duration),
}

// === impl Pending ===

impl Pending {
    pub(crate) fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            outstanding: false,
            initial_backoff,
            max_backoff,
        }
    }

    /// Records the latest desired status for a cluster, superseding whatever
    /// was pending or in flight for it.
    pub(crate) fn request(&mut self, cluster: String, status: ConnectionStatus, now: Instant) {
        self.entries.insert(
            cluster,
            PendingStatus {
                status,
                state: State::Initial,
                backoff: self.initial_backoff,
                retry_at: now,
                in_progress: false,
            },
        );
    }

    /// Picks the earliest due entry and marks it in progress, unless an
    /// attempt is already outstanding.
    pub(crate) fn next(&mut self, now: Instant) -> Option<(String, ConnectionStatus)> {
        if self.outstanding {
            return None;
        }
        let (cluster, entry) = self
            .entries
            .iter_mut()
            .filter(|(_, e)| !e.in_progress && e.retry_at <= now)
            .min_by_key(|(_, e)| e.retry_at)?;
        entry.in_progress = true;
        self.outstanding = true;
        Some((cluster.clone(), entry.status))
    }

    pub(crate) fn complete(&mut self, cluster: &str, outcome: Outcome, now: Instant) -> Completion {
        self.outstanding = false;

        let Some(entry) = self.entries.get_mut(cluster) else {
            return Completion::Discarded;
        };
        if !entry.in_progress {
            return Completion::Discarded;
        }
        entry.in_progress = false;

        match outcome {
            Outcome::Succeeded | Outcome::NotFound => {
                let state = if outcome == Outcome::Succeeded {
                    State::Succeeded
                } else {
                    State::NotFound
                };
                self.entries.remove(cluster);
                Completion::Removed(state)
            }
            Outcome::Failed => {
                let delay = entry.backoff;
                entry.state = State::Failed;
                entry.retry_at = now + delay;
                entry.backoff = (delay * 2).min(self.max_backoff);
                Completion::Retry(delay)
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, cluster: &str) -> Option<&PendingStatus> {
        self.entries.get(cluster)
    }
}
