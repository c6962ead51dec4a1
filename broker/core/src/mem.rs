//! An in-memory `ManagedClusterStore`.

use crate::{
    ConnectionStatus, Fingerprint, Listing, ManagedCluster, ManagedClusterStore, StoreError,
    WatchEvent, WatchStream,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Holds clusters in a map and replays changes to watchers.
///
/// Every mutation bumps the resource version and is logged, so a watch
/// started from a listing's version observes exactly the changes made after
/// that listing.
#[derive(Debug, Default)]
pub struct Store {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    version: u64,
    clusters: BTreeMap<String, Entry>,
    log: Vec<(u64, WatchEvent)>,
    watches: Vec<mpsc::UnboundedSender<Result<WatchEvent, StoreError>>>,
    status_updates: Vec<(String, ConnectionStatus)>,
    fingerprint_updates: Vec<(String, Fingerprint)>,
    fail_status_updates: usize,
    fail_lists: usize,
}

#[derive(Debug)]
struct Entry {
    cluster: ManagedCluster,
    connected: Option<ConnectionStatus>,
}

#[derive(Debug, thiserror::Error)]
#[error("injected failure")]
struct Injected;

// === impl Store ===

impl Store {
    /// Creates or replaces a cluster, notifying watchers.
    pub fn apply(&self, cluster: ManagedCluster) {
        let mut inner = self.inner.lock();
        let event = if inner.clusters.contains_key(&cluster.id) {
            WatchEvent::Modified(cluster.clone())
        } else {
            WatchEvent::Added(cluster.clone())
        };
        let connected = inner.clusters.get(&cluster.id).and_then(|e| e.connected);
        inner.clusters.insert(
            cluster.id.clone(),
            Entry {
                cluster,
                connected,
            },
        );
        inner.publish(event);
    }

    /// Deletes a cluster, notifying watchers.
    pub fn delete(&self, id: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.clusters.remove(id) {
            inner.publish(WatchEvent::Deleted(entry.cluster));
        }
    }

    /// Creates or replaces a cluster without notifying watchers. The change
    /// is only observed by the next listing.
    pub fn insert(&self, cluster: ManagedCluster) {
        let mut inner = self.inner.lock();
        inner.version += 1;
        inner.clusters.insert(
            cluster.id.clone(),
            Entry {
                cluster,
                connected: None,
            },
        );
    }

    /// Deletes a cluster without notifying watchers.
    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.lock();
        inner.version += 1;
        inner.clusters.remove(id);
    }

    pub fn cluster(&self, id: &str) -> Option<ManagedCluster> {
        self.inner.lock().clusters.get(id).map(|e| e.cluster.clone())
    }

    /// The last `Connected` condition written for a cluster.
    pub fn connected(&self, id: &str) -> Option<ConnectionStatus> {
        self.inner.lock().clusters.get(id).and_then(|e| e.connected)
    }

    /// Every successful status write, in order.
    pub fn status_updates(&self) -> Vec<(String, ConnectionStatus)> {
        self.inner.lock().status_updates.clone()
    }

    /// Every successful fingerprint write, in order.
    pub fn fingerprint_updates(&self) -> Vec<(String, Fingerprint)> {
        self.inner.lock().fingerprint_updates.clone()
    }

    /// Fails the next `n` status writes.
    pub fn fail_status_updates(&self, n: usize) {
        self.inner.lock().fail_status_updates = n;
    }

    /// Fails the next `n` listings.
    pub fn fail_lists(&self, n: usize) {
        self.inner.lock().fail_lists = n;
    }

    /// Ends all open watch streams.
    pub fn break_watches(&self) {
        self.inner.lock().watches.clear();
    }

    pub fn watch_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watches.retain(|tx| !tx.is_closed());
        inner.watches.len()
    }
}

#[async_trait::async_trait]
impl ManagedClusterStore for Store {
    async fn list(&self) -> Result<Listing, StoreError> {
        let mut inner = self.inner.lock();
        if inner.fail_lists > 0 {
            inner.fail_lists -= 1;
            return Err(StoreError::api(Injected));
        }
        Ok(Listing {
            items: inner.clusters.values().map(|e| e.cluster.clone()).collect(),
            resource_version: inner.version.to_string(),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream, StoreError> {
        let from = resource_version
            .parse::<u64>()
            .map_err(|_| StoreError::Expired)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        for (_, event) in inner.log.iter().filter(|(v, _)| *v > from) {
            let _ = tx.send(Ok(event.clone()));
        }
        inner.watches.push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn update_connected(&self, id: &str, status: ConnectionStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner.clusters.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        if inner.fail_status_updates > 0 {
            inner.fail_status_updates -= 1;
            return Err(StoreError::api(Injected));
        }
        let cluster = {
            let entry = inner
                .clusters
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            entry.connected = Some(status);
            entry.cluster.clone()
        };
        inner.status_updates.push((id.to_string(), status));
        inner.publish(WatchEvent::Modified(cluster));
        Ok(())
    }

    async fn update_fingerprint(&self, id: &str, fingerprint: Fingerprint) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let cluster = {
            let entry = inner
                .clusters
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            entry.cluster.active_fingerprint = Some(fingerprint);
            entry.cluster.clone()
        };
        inner.fingerprint_updates.push((id.to_string(), fingerprint));
        inner.publish(WatchEvent::Modified(cluster));
        Ok(())
    }
}

// === impl Inner ===

impl Inner {
    fn publish(&mut self, event: WatchEvent) {
        self.version += 1;
        self.log.push((self.version, event.clone()));
        self.watches
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }
}
