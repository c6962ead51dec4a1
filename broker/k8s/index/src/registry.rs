use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use rustls::ClientConfig;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use tunnel_broker_core::{
    ConnectionStatus, Fingerprint, Listing, ManagedCluster, ManagedClusterStore, StoreError,
    WatchEvent,
};
use tunnel_broker_k8s_status::Update;
use tunnel_broker_proxy::{SniProxy, TunnelProxy};
use tunnel_broker_tunnel::{self as tunnel, tls, CertPool, Manager, Server, Tunnel, TunnelId};

const RELIST_DELAY: Duration = Duration::from_secs(1);
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// The registry's clusters by ID, shared with its metrics.
pub type SharedClusters = Arc<RwLock<HashMap<String, Arc<Cluster>>>>;

/// Tracks every known managed cluster and its tunnel.
#[derive(Debug)]
pub struct Registry {
    clusters: SharedClusters,
    shared: Arc<Shared>,
}

/// A managed cluster known to the registry.
#[derive(Debug)]
pub struct Cluster {
    id: String,
    manager: Arc<Manager>,
    state: RwLock<ClusterState>,
    shared: Arc<Shared>,
}

/// Whether a cluster currently has a tunnel.
#[derive(Clone, Debug)]
pub enum Connection {
    Disconnected,
    Connected {
        tunnel: TunnelId,
        proxy: Arc<TunnelProxy>,
    },
}

/// An entry in the registry's listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterSummary {
    pub id: String,
    pub connected: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("failed to read peer identity: {0}")]
    Identity(#[source] tunnel::Error),

    #[error("unknown cluster {0}")]
    UnknownCluster(String),

    #[error("cluster {cluster} has an invalid certificate: {source}")]
    InvalidCertificate {
        cluster: String,
        #[source]
        source: tunnel::Error,
    },

    #[error("cluster {0} presented an unexpected certificate")]
    CertificateMismatch(String),

    #[error("cluster {0} presented a certificate that does not match its fingerprint")]
    FingerprintMismatch(String),

    #[error("cluster {0} has no certificate or fingerprint")]
    NoCredentials(String),

    #[error("failed to assign tunnel to cluster {cluster}: {source}")]
    Assign {
        cluster: String,
        #[source]
        source: tunnel::Error,
    },
}

#[derive(Debug)]
struct ClusterState {
    mc: ManagedCluster,
    connection: Connection,

    /// The legacy fingerprint this entry's fingerprint was upgraded from.
    /// The store may still report it until the upgrade is written back.
    upgraded_from: Option<Fingerprint>,

    sni: Option<CancellationToken>,
}

struct Shared {
    store: Arc<dyn ManagedClusterStore>,
    statuses: mpsc::Sender<Update>,
    overflow: Mutex<Overflow>,
    pool: Arc<CertPool>,
    sni: Option<Arc<SniProxy>>,
    tunnel_tls: Arc<ClientConfig>,
    shutdown: CancellationToken,
}

/// Status requests that did not fit in the controller's queue, latest per
/// cluster.
#[derive(Debug, Default)]
struct Overflow {
    statuses: HashMap<String, ConnectionStatus>,
    flushing: bool,
}

// === impl Registry ===

impl Registry {
    pub fn new(
        clusters: SharedClusters,
        store: Arc<dyn ManagedClusterStore>,
        statuses: mpsc::Sender<Update>,
        pool: Arc<CertPool>,
        sni: Option<Arc<SniProxy>>,
        shutdown: CancellationToken,
    ) -> Result<Self, tunnel::Error> {
        let tunnel_tls = tls::insecure_client_config(&[b"h2"])?;
        Ok(Self {
            clusters,
            shared: Arc::new(Shared {
                store,
                statuses,
                overflow: Mutex::default(),
                pool,
                sni: sni.filter(|sni| sni.is_enabled()),
                tunnel_tls,
                shutdown,
            }),
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Cluster>> {
        self.clusters.read().get(id).cloned()
    }

    /// Lists every known cluster, sorted by ID.
    pub fn list(&self) -> Vec<ClusterSummary> {
        let mut list = self
            .clusters
            .read()
            .values()
            .map(|c| ClusterSummary {
                id: c.id.clone(),
                connected: c.is_connected(),
            })
            .collect::<Vec<_>>();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn add(&self, mc: ManagedCluster) {
        let mut clusters = self.clusters.write();
        if let Some(cluster) = clusters.get(&mc.id).cloned() {
            drop(clusters);
            return cluster.update(mc);
        }

        debug!(cluster = %mc.id, "Adding cluster");
        let cluster = Arc::new(Cluster::new(mc, self.shared.clone()));
        clusters.insert(cluster.id.clone(), cluster.clone());
        drop(clusters);
        cluster.request_status(ConnectionStatus::NotConnected);
    }

    pub fn update(&self, mc: ManagedCluster) {
        let cluster = self.get(&mc.id);
        match cluster {
            Some(cluster) => cluster.update(mc),
            None => self.add(mc),
        }
    }

    /// Removes a cluster, closing its tunnel before the entry leaves the map.
    pub fn remove(&self, id: &str) {
        let mut clusters = self.clusters.write();
        if let Some(cluster) = clusters.get(id) {
            debug!(cluster = %id, "Removing cluster");
            cluster.shutdown();
            clusters.remove(id);
        }
    }

    /// Lists the store and makes the registry match it, returning the
    /// listing's resource version.
    pub async fn resync(&self) -> Result<String, StoreError> {
        let Listing {
            items,
            resource_version,
        } = self.shared.store.list().await?;

        let ids = items.iter().map(|mc| mc.id.clone()).collect::<HashSet<_>>();
        for mc in items {
            self.update(mc);
        }

        let stale = self
            .clusters
            .read()
            .keys()
            .filter(|id| !ids.contains(*id))
            .cloned()
            .collect::<Vec<_>>();
        for id in stale {
            self.remove(&id);
        }

        debug!(%resource_version, clusters = ids.len(), "Resynced");
        Ok(resource_version)
    }

    /// Applies watch events until the watch ends.
    pub async fn watch_from(&self, resource_version: &str) -> Result<(), StoreError> {
        let mut events = self.shared.store.watch(resource_version).await?;
        while let Some(event) = events.next().await {
            match event? {
                WatchEvent::Added(mc) => self.add(mc),
                WatchEvent::Modified(mc) => self.update(mc),
                WatchEvent::Deleted(mc) => self.remove(&mc.id),
                WatchEvent::Bookmark(_) => {}
            }
        }
        Ok(())
    }

    /// Keeps the registry in sync with the store until shutdown, then closes
    /// every cluster's tunnel.
    pub async fn run(&self) {
        let shutdown = self.shared.shutdown.clone();
        loop {
            let resync = tokio::select! {
                res = self.resync() => res,
                _ = shutdown.cancelled() => break,
            };
            match resync {
                Ok(resource_version) => {
                    let watch = tokio::select! {
                        res = self.watch_from(&resource_version) => res,
                        _ = shutdown.cancelled() => break,
                    };
                    match watch {
                        Ok(()) => debug!("Watch ended"),
                        Err(StoreError::Expired) => debug!("Watch expired"),
                        Err(error) => warn!(%error, "Watch failed"),
                    }
                }
                Err(error) => {
                    warn!(%error, "Failed to list managed clusters");
                    tokio::select! {
                        _ = time::sleep(RELIST_DELAY) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        debug!("Shutting down");
        for (_, cluster) in self.clusters.write().drain() {
            cluster.shutdown();
        }
    }

    /// Accepts tunnels from `server` until shutdown. Each handshake runs on
    /// its own task.
    pub async fn serve(self: Arc<Self>, server: Server) {
        let shutdown = self.shared.shutdown.clone();
        loop {
            let accepting = tokio::select! {
                res = server.accept() => res,
                _ = shutdown.cancelled() => return,
            };
            let accepting = match accepting {
                Ok(accepting) => accepting,
                Err(error) => {
                    info!(%error, "Failed to accept tunnel connection");
                    time::sleep(ACCEPT_ERROR_DELAY).await;
                    continue;
                }
            };

            let registry = self.clone();
            let peer = accepting.peer_addr();
            tokio::spawn(
                async move {
                    let tunnel = match accepting.handshake().await {
                        Ok(tunnel) => tunnel,
                        Err(error) => {
                            info!(%error, "Tunnel handshake failed");
                            return;
                        }
                    };
                    if let Err(error) = registry.accept_tunnel(tunnel) {
                        info!(%error, "Rejected tunnel");
                    }
                }
                .instrument(info_span!("tunnel", %peer)),
            );
        }
    }

    /// Verifies an incoming tunnel against the cluster named by its
    /// certificate and assigns it. A rejected tunnel is closed.
    pub fn accept_tunnel(&self, tunnel: Tunnel) -> Result<(), AcceptError> {
        let id = match tunnel.identity().common_name() {
            Ok(id) => id,
            Err(error) => {
                tunnel.close();
                return Err(AcceptError::Identity(error));
            }
        };
        let Some(cluster) = self.get(&id) else {
            tunnel.close();
            return Err(AcceptError::UnknownCluster(id));
        };
        cluster.accept(tunnel)
    }
}

// === impl Cluster ===

impl Cluster {
    fn new(mc: ManagedCluster, shared: Arc<Shared>) -> Self {
        append_certificate(&shared.pool, &mc);
        Self {
            id: mc.id.clone(),
            manager: Arc::new(Manager::default()),
            state: RwLock::new(ClusterState {
                mc,
                connection: Connection::Disconnected,
                upgraded_from: None,
                sni: None,
            }),
            shared,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn managed_cluster(&self) -> ManagedCluster {
        self.state.read().mc.clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state.read().connection, Connection::Connected { .. })
    }

    /// The proxy into the cluster's tunnel, if one is assigned.
    pub fn proxy(&self) -> Option<Arc<TunnelProxy>> {
        match &self.state.read().connection {
            Connection::Connected { proxy, .. } => Some(proxy.clone()),
            Connection::Disconnected => None,
        }
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    fn update(&self, mut mc: ManagedCluster) {
        let mut state = self.state.write();
        let certificate_changed = state.mc.certificate != mc.certificate;
        let fingerprint_changed = match (state.mc.active_fingerprint, mc.active_fingerprint) {
            // The store still reports the fingerprint we upgraded from.
            (Some(Fingerprint::Sha256(_)), Some(new @ Fingerprint::Md5(_)))
                if state.upgraded_from == Some(new) =>
            {
                false
            }
            (current, new) => current != new,
        };

        if fingerprint_changed {
            state.upgraded_from = None;
        } else {
            mc.active_fingerprint = state.mc.active_fingerprint;
        }
        if certificate_changed {
            append_certificate(&self.shared.pool, &mc);
        }
        state.mc = mc;

        if !(certificate_changed || fingerprint_changed) {
            return;
        }
        info!(
            cluster = %self.id,
            certificate_changed,
            fingerprint_changed,
            "Credentials changed; dropping tunnel"
        );
        self.disconnect(&mut state);
        drop(state);
        self.request_status(ConnectionStatus::NotConnected);
    }

    fn shutdown(&self) {
        self.manager.close();
        let mut state = self.state.write();
        if let Some(sni) = state.sni.take() {
            sni.cancel();
        }
        state.connection = Connection::Disconnected;
    }

    fn accept(self: &Arc<Self>, tunnel: Tunnel) -> Result<(), AcceptError> {
        let der = tunnel.identity().der().to_vec();
        let mut state = self.state.write();

        let upgraded = match self.verify(&mut state, &der) {
            Ok(upgraded) => upgraded,
            Err(error) => {
                drop(state);
                tunnel.close();
                return Err(error);
            }
        };
        if let Some(fingerprint) = upgraded {
            self.persist_fingerprint(fingerprint);
        }

        // Without an SNI proxy nothing reads agent-opened streams.
        if self.shared.sni.is_none() {
            tunnel.refuse_incoming();
        }

        let tunnel_id = tunnel.id();
        let errors = self
            .manager
            .set_tunnel(tunnel)
            .and_then(|_| self.manager.listen_for_errors());
        let errors = match errors {
            Ok(errors) => errors,
            Err(source) => {
                return Err(AcceptError::Assign {
                    cluster: self.id.clone(),
                    source,
                })
            }
        };

        let proxy = Arc::new(TunnelProxy::new(
            &self.id,
            self.manager.clone(),
            self.shared.tunnel_tls.clone(),
        ));
        state.connection = Connection::Connected {
            tunnel: tunnel_id,
            proxy,
        };
        if let Some(sni) = &self.shared.sni {
            let token = self.shared.shutdown.child_token();
            tokio::spawn(
                sni.clone()
                    .serve(self.id.clone(), self.manager.clone(), token.clone())
                    .instrument(info_span!("sni", cluster = %self.id)),
            );
            state.sni = Some(token);
        }
        drop(state);

        tokio::spawn(
            self.clone()
                .watch_errors(tunnel_id, errors)
                .instrument(info_span!("tunnel", cluster = %self.id, tunnel = %tunnel_id)),
        );
        info!(cluster = %self.id, tunnel = %tunnel_id, "Tunnel connected");
        self.request_status(ConnectionStatus::Connected);
        Ok(())
    }

    /// Checks the peer certificate against the recorded credentials. A
    /// matching legacy fingerprint is replaced, and the new value returned.
    fn verify(&self, state: &mut ClusterState, der: &[u8]) -> Result<Option<Fingerprint>, AcceptError> {
        if let Some(pem) = &state.mc.certificate {
            let certs = tls::load_certs(pem.as_bytes()).map_err(|source| {
                AcceptError::InvalidCertificate {
                    cluster: self.id.clone(),
                    source,
                }
            })?;
            return match certs.first() {
                Some(cert) if cert.as_ref() == der => Ok(None),
                _ => Err(AcceptError::CertificateMismatch(self.id.clone())),
            };
        }

        let fips = state.mc.fips_mode_enabled;
        match state.mc.active_fingerprint {
            None => Err(AcceptError::NoCredentials(self.id.clone())),
            Some(fingerprint @ Fingerprint::Sha256(_)) => {
                if fingerprint.matches(der, fips) {
                    Ok(None)
                } else {
                    Err(AcceptError::FingerprintMismatch(self.id.clone()))
                }
            }
            Some(legacy @ Fingerprint::Md5(_)) => {
                if !legacy.matches(der, fips) {
                    return Err(AcceptError::FingerprintMismatch(self.id.clone()));
                }
                let upgraded = Fingerprint::sha256(der);
                info!(cluster = %self.id, from = %legacy, to = %upgraded, "Upgrading legacy fingerprint");
                state.mc.active_fingerprint = Some(upgraded);
                state.upgraded_from = Some(legacy);
                Ok(Some(upgraded))
            }
        }
    }

    fn persist_fingerprint(&self, fingerprint: Fingerprint) {
        let store = self.shared.store.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            match store.update_fingerprint(&id, fingerprint).await {
                Ok(()) => info!(cluster = %id, %fingerprint, "Recorded upgraded fingerprint"),
                Err(error) => warn!(cluster = %id, %error, "Failed to record upgraded fingerprint"),
            }
        });
    }

    async fn watch_errors(self: Arc<Self>, tunnel: TunnelId, errors: oneshot::Receiver<tunnel::Error>) {
        match errors.await {
            Ok(error) => info!(%error, "Tunnel failed"),
            Err(_) => debug!("Tunnel dropped"),
        }

        let mut state = self.state.write();
        match &state.connection {
            Connection::Connected { tunnel: current, .. } if *current == tunnel => {}
            _ => return,
        }
        self.disconnect(&mut state);
        drop(state);
        self.request_status(ConnectionStatus::NotConnected);
    }

    fn disconnect(&self, state: &mut ClusterState) {
        self.manager.close_tunnel();
        if let Some(sni) = state.sni.take() {
            sni.cancel();
        }
        state.connection = Connection::Disconnected;
    }

    fn request_status(&self, status: ConnectionStatus) {
        self.shared.request_status(Update {
            cluster: self.id.clone(),
            status,
        });
    }
}

// === impl Shared ===

impl Shared {
    /// Queues a status write. While the queue is full, requests coalesce per
    /// cluster and are forwarded as it drains, so the latest status for every
    /// cluster is eventually delivered.
    fn request_status(self: &Arc<Self>, update: Update) {
        let mut overflow = self.overflow.lock();
        if overflow.statuses.is_empty() {
            match self.statuses.try_send(update) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Closed(update)) => {
                    debug!(cluster = %update.cluster, "Status controller is gone");
                    return;
                }
                Err(mpsc::error::TrySendError::Full(update)) => {
                    debug!(cluster = %update.cluster, "Status queue is full");
                    overflow.statuses.insert(update.cluster, update.status);
                }
            }
        } else {
            overflow.statuses.insert(update.cluster, update.status);
        }

        if !overflow.flushing {
            overflow.flushing = true;
            tokio::spawn(
                self.clone()
                    .flush_statuses()
                    .instrument(info_span!("statuses")),
            );
        }
    }

    async fn flush_statuses(self: Arc<Self>) {
        loop {
            let permit = self.statuses.reserve().await;
            let mut overflow = self.overflow.lock();
            let Ok(permit) = permit else {
                debug!("Status controller is gone");
                overflow.statuses.clear();
                overflow.flushing = false;
                return;
            };
            let Some(cluster) = overflow.statuses.keys().next().cloned() else {
                overflow.flushing = false;
                return;
            };
            if let Some(status) = overflow.statuses.remove(&cluster) {
                permit.send(Update { cluster, status });
            }
        }
    }
}

fn append_certificate(pool: &CertPool, mc: &ManagedCluster) {
    let Some(pem) = &mc.certificate else {
        return;
    };
    match pool.append_pem(pem.as_bytes()) {
        Ok(0) => {}
        Ok(added) => debug!(cluster = %mc.id, added, "Added certificate to pool"),
        Err(error) => warn!(cluster = %mc.id, %error, "Ignoring invalid cluster certificate"),
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("pool", &self.pool)
            .field("sni", &self.sni)
            .finish_non_exhaustive()
    }
}
