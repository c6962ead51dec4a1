use crate::{ConnectionStatus, Fingerprint, ManagedCluster};
use futures::Stream;
use std::pin::Pin;

/// A change observed on the `ManagedCluster` collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Added(ManagedCluster),
    Modified(ManagedCluster),
    Deleted(ManagedCluster),

    /// Carries only a new resource version.
    Bookmark(String),
}

/// A full listing of the collection at a resource version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Listing {
    pub items: Vec<ManagedCluster>,
    pub resource_version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("managed cluster {0} not found")]
    NotFound(String),

    #[error("watch expired")]
    Expired,

    #[error(transparent)]
    Api(Box<dyn std::error::Error + Send + Sync + 'static>),
}

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, StoreError>> + Send>>;

/// The external collection of `ManagedCluster` records.
///
/// The broker only reads records, writes the `Connected` condition, and
/// records fingerprint upgrades.
#[async_trait::async_trait]
pub trait ManagedClusterStore: Send + Sync + 'static {
    async fn list(&self) -> Result<Listing, StoreError>;

    /// Streams changes after `resource_version`. The stream ends when the
    /// store closes the watch.
    async fn watch(&self, resource_version: &str) -> Result<WatchStream, StoreError>;

    /// Sets (or inserts) the `Connected` condition on the named cluster.
    async fn update_connected(&self, id: &str, status: ConnectionStatus) -> Result<(), StoreError>;

    /// Records the fingerprint annotation on the named cluster.
    async fn update_fingerprint(&self, id: &str, fingerprint: Fingerprint) -> Result<(), StoreError>;
}

// === impl StoreError ===

impl StoreError {
    pub fn api(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Api(Box::new(error))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
