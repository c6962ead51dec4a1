use crate::managed_cluster::{ManagedCluster, ManagedClusterStatus};
use futures::prelude::*;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, WatchEvent as KubeEvent, WatchParams},
    Client,
};
use tunnel_broker_core::{
    self as core, ConnectionStatus, Fingerprint, Listing, ManagedClusterStore, StoreError,
    WatchEvent, WatchStream, ACTIVE_FINGERPRINT_ANNOTATION,
};

/// A `ManagedClusterStore` backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    api: Api<ManagedCluster>,
    fips_mode_enabled: bool,
}

impl KubeStore {
    /// Limits the amount of time a watch can be idle before being reset.
    ///
    /// Must be less than 295 or Kubernetes throws an error.
    const WATCH_TIMEOUT_SECS: u32 = 290;

    /// Reads cluster-scoped resources, or the resources in `namespace` when
    /// running for a single tenant.
    pub fn new(client: Client, namespace: Option<&str>, fips_mode_enabled: bool) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self {
            api,
            fips_mode_enabled,
        }
    }

    fn convert(&self, mc: &ManagedCluster) -> core::ManagedCluster {
        mc.to_core(self.fips_mode_enabled)
    }
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("fips_mode_enabled", &self.fips_mode_enabled)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ManagedClusterStore for KubeStore {
    async fn list(&self) -> Result<Listing, StoreError> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(StoreError::api)?;
        Ok(Listing {
            items: list.items.iter().map(|mc| self.convert(mc)).collect(),
            resource_version: list.metadata.resource_version.unwrap_or_default(),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream, StoreError> {
        let params = WatchParams::default().timeout(Self::WATCH_TIMEOUT_SECS);
        let events = self
            .api
            .watch(&params, resource_version)
            .await
            .map_err(StoreError::api)?;

        let this = self.clone();
        let events = events.filter_map(move |ev| {
            let ev = match ev {
                Ok(KubeEvent::Added(mc)) => Some(Ok(WatchEvent::Added(this.convert(&mc)))),
                Ok(KubeEvent::Modified(mc)) => Some(Ok(WatchEvent::Modified(this.convert(&mc)))),
                Ok(KubeEvent::Deleted(mc)) => Some(Ok(WatchEvent::Deleted(this.convert(&mc)))),
                Ok(KubeEvent::Bookmark(bm)) => {
                    Some(Ok(WatchEvent::Bookmark(bm.metadata.resource_version)))
                }
                Ok(KubeEvent::Error(e)) if e.code == 410 => Some(Err(StoreError::Expired)),
                Ok(KubeEvent::Error(e)) => Some(Err(StoreError::Api(e.message.into()))),
                Err(error) => Some(Err(StoreError::api(error))),
            };
            future::ready(ev)
        });
        Ok(Box::pin(events))
    }

    async fn update_connected(&self, id: &str, status: ConnectionStatus) -> Result<(), StoreError> {
        let mc = self.api.get_status(id).await.map_err(|e| not_found(id, e))?;
        let mut mc_status = mc.status.unwrap_or_default();
        mc_status.set_connected(status);

        // The resource version makes this a compare-and-swap against the read.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": mc.metadata.resource_version },
            "status": ManagedClusterStatus {
                conditions: mc_status.conditions,
            },
        });
        self.api
            .patch_status(id, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| not_found(id, e))?;
        Ok(())
    }

    async fn update_fingerprint(&self, id: &str, fingerprint: Fingerprint) -> Result<(), StoreError> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    (ACTIVE_FINGERPRINT_ANNOTATION): fingerprint.to_string(),
                },
            },
        });
        self.api
            .patch(id, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| not_found(id, e))?;
        Ok(())
    }
}

fn not_found(id: &str, error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(e) if e.code == 404 => StoreError::NotFound(id.to_string()),
        error => StoreError::api(error),
    }
}
