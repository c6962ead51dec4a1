use crate::{AcceptError, ClusterSummary, Registry};
use maplit::hashset;
use pretty_assertions::assert_eq;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{io::AsyncReadExt, sync::mpsc, time};
use tokio_util::sync::CancellationToken;
use tunnel_broker_core::{mem, ConnectionStatus, Fingerprint, ManagedCluster};
use tunnel_broker_k8s_status::Update;
use tunnel_broker_tunnel::{
    test_util::{Creds, Pki},
    CertPool, Identity, Side, Tunnel,
};

struct Fixture {
    store: Arc<mem::Store>,
    registry: Registry,
    pool: Arc<CertPool>,
    statuses: mpsc::Receiver<Update>,
    shutdown: CancellationToken,
}

impl Fixture {
    fn new() -> Self {
        Self::with_status_capacity(1000)
    }

    fn with_status_capacity(capacity: usize) -> Self {
        let store = Arc::new(mem::Store::default());
        let pool = Arc::new(CertPool::default());
        let (tx, statuses) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();
        let registry = Registry::new(
            Default::default(),
            store.clone(),
            tx,
            pool.clone(),
            None,
            shutdown.clone(),
        )
        .expect("registry must build");
        Self {
            store,
            registry,
            pool,
            statuses,
            shutdown,
        }
    }

    fn statuses(&mut self, cluster: &str) -> Vec<ConnectionStatus> {
        let mut statuses = vec![];
        while let Ok(update) = self.statuses.try_recv() {
            if update.cluster == cluster {
                statuses.push(update.status);
            }
        }
        statuses
    }

    fn ids(&self) -> HashSet<String> {
        self.registry.list().into_iter().map(|c| c.id).collect()
    }
}

/// Returns the broker's end of a tunnel whose peer presents `creds`, along
/// with the agent's end.
fn tunnel(creds: &Creds) -> (Tunnel, Tunnel) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let identity = Identity::new(creds.certs()).unwrap();
    (
        Tunnel::new(a, Side::Server, identity.clone()),
        Tunnel::new(b, Side::Client, identity),
    )
}

async fn eventually(mut check: impl FnMut() -> bool) {
    time::timeout(Duration::from_secs(10), async {
        while !check() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn accepts_at_most_one_tunnel() {
    let mut fx = Fixture::new();
    let pki = Pki::new("ca");
    let agent = pki.client("mc-one");
    fx.registry
        .add(ManagedCluster::new("mc-one").with_fingerprint(Fingerprint::sha256(&agent.der)));

    let (first, _first_peer) = tunnel(&agent);
    let first_id = first.id();
    fx.registry.accept_tunnel(first).unwrap();
    let cluster = fx.registry.get("mc-one").unwrap();
    assert!(cluster.is_connected());
    assert!(cluster.proxy().is_some());

    let (second, second_peer) = tunnel(&agent);
    assert!(matches!(
        fx.registry.accept_tunnel(second),
        Err(AcceptError::Assign { .. })
    ));
    assert_eq!(cluster.manager().tunnel().unwrap().id(), first_id);
    assert!(cluster.is_connected());
    eventually(|| second_peer.is_closed()).await;

    assert_eq!(
        fx.statuses("mc-one"),
        vec![ConnectionStatus::NotConnected, ConnectionStatus::Connected]
    );
}

#[tokio::test]
async fn rejects_unverified_tunnels() {
    let fx = Fixture::new();
    let pki = Pki::new("ca");
    let agent = pki.client("mc-one");
    let impostor = pki.client("mc-one");

    let (t, _peer) = tunnel(&agent);
    assert!(matches!(
        fx.registry.accept_tunnel(t),
        Err(AcceptError::UnknownCluster(id)) if id == "mc-one"
    ));

    fx.registry.add(ManagedCluster::new("mc-one"));
    let (t, _peer) = tunnel(&agent);
    assert!(matches!(
        fx.registry.accept_tunnel(t),
        Err(AcceptError::NoCredentials(_))
    ));

    fx.registry
        .update(ManagedCluster::new("mc-one").with_fingerprint(Fingerprint::sha256(&agent.der)));
    let (t, peer) = tunnel(&impostor);
    assert!(matches!(
        fx.registry.accept_tunnel(t),
        Err(AcceptError::FingerprintMismatch(_))
    ));
    eventually(|| peer.is_closed()).await;

    // Legacy fingerprints never match in FIPS mode.
    let mut fips = ManagedCluster::new("mc-one").with_fingerprint(Fingerprint::md5(&agent.der));
    fips.fips_mode_enabled = true;
    fx.registry.update(fips);
    let (t, _peer) = tunnel(&agent);
    assert!(matches!(
        fx.registry.accept_tunnel(t),
        Err(AcceptError::FingerprintMismatch(_))
    ));
    assert!(!fx.registry.get("mc-one").unwrap().is_connected());
}

#[tokio::test]
async fn certificate_takes_precedence_over_fingerprint() {
    let fx = Fixture::new();
    let pki = Pki::new("ca");
    let agent = pki.client("mc-one");
    let other = pki.client("mc-one");

    fx.registry.add(
        ManagedCluster::new("mc-one")
            .with_fingerprint(Fingerprint::sha256(&other.der))
            .with_certificate(&agent.cert_pem),
    );
    assert_eq!(fx.pool.len(), 1);

    let (t, _peer) = tunnel(&other);
    assert!(matches!(
        fx.registry.accept_tunnel(t),
        Err(AcceptError::CertificateMismatch(_))
    ));

    let (t, _peer) = tunnel(&agent);
    fx.registry.accept_tunnel(t).unwrap();
    assert!(fx.registry.get("mc-one").unwrap().is_connected());
}

#[tokio::test]
async fn upgrades_legacy_fingerprint_once() {
    let mut fx = Fixture::new();
    let pki = Pki::new("ca");
    let agent = pki.client("mc-one");
    let legacy = ManagedCluster::new("mc-one").with_fingerprint(Fingerprint::md5(&agent.der));
    fx.store.insert(legacy.clone());
    fx.registry.add(legacy.clone());

    let (t, peer) = tunnel(&agent);
    fx.registry.accept_tunnel(t).unwrap();
    let upgraded = Fingerprint::sha256(&agent.der);
    let cluster = fx.registry.get("mc-one").unwrap();
    assert_eq!(cluster.managed_cluster().active_fingerprint, Some(upgraded));
    eventually(|| {
        fx.store
            .cluster("mc-one")
            .and_then(|mc| mc.active_fingerprint)
            == Some(upgraded)
    })
    .await;

    // The store may still report the legacy value. That is not a change and
    // must not drop the tunnel.
    fx.registry.update(legacy);
    assert!(cluster.is_connected());
    assert_eq!(cluster.managed_cluster().active_fingerprint, Some(upgraded));

    peer.close();
    drop(peer);
    eventually(|| !cluster.is_connected()).await;

    // Later connections match the upgraded value directly.
    let (t, _peer) = tunnel(&agent);
    fx.registry.accept_tunnel(t).unwrap();
    assert_eq!(cluster.managed_cluster().active_fingerprint, Some(upgraded));
    // Let any spawned store write land before counting.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        fx.store.fingerprint_updates(),
        vec![("mc-one".to_string(), upgraded)]
    );
    assert_eq!(
        fx.statuses("mc-one"),
        vec![
            ConnectionStatus::NotConnected,
            ConnectionStatus::Connected,
            ConnectionStatus::NotConnected,
            ConnectionStatus::Connected,
        ]
    );
}

#[tokio::test]
async fn closes_agent_streams_without_sni() {
    let fx = Fixture::new();
    let pki = Pki::new("ca");
    let agent = pki.client("mc-one");
    fx.registry
        .add(ManagedCluster::new("mc-one").with_fingerprint(Fingerprint::sha256(&agent.der)));

    let (t, peer) = tunnel(&agent);
    fx.registry.accept_tunnel(t).unwrap();

    for _ in 0..3 {
        let mut stream = peer.open_stream().await.unwrap();
        let mut buf = [0u8; 1];
        let read = time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("agent stream must be closed");
        assert!(!matches!(read, Ok(n) if n > 0));
    }
    assert!(fx.registry.get("mc-one").unwrap().is_connected());
}

#[tokio::test]
async fn coalesces_statuses_when_queue_is_full() {
    let mut fx = Fixture::with_status_capacity(1);
    let pki = Pki::new("ca");
    let agent = pki.client("mc-two");

    // mc-one fills the queue; mc-two's requests wait and coalesce.
    fx.registry.add(ManagedCluster::new("mc-one"));
    fx.registry
        .add(ManagedCluster::new("mc-two").with_fingerprint(Fingerprint::sha256(&agent.der)));
    let (t, _peer) = tunnel(&agent);
    fx.registry.accept_tunnel(t).unwrap();

    let mut received = vec![];
    for _ in 0..2 {
        let update = time::timeout(Duration::from_secs(5), fx.statuses.recv())
            .await
            .expect("status update must be delivered")
            .expect("registry must hold a sender");
        received.push((update.cluster, update.status));
    }
    assert_eq!(
        received,
        vec![
            ("mc-one".to_string(), ConnectionStatus::NotConnected),
            ("mc-two".to_string(), ConnectionStatus::Connected),
        ]
    );

    time::sleep(Duration::from_millis(50)).await;
    assert!(fx.statuses.try_recv().is_err(), "superseded statuses are not sent");
}

#[tokio::test]
async fn credential_change_drops_tunnel() {
    let mut fx = Fixture::new();
    let pki = Pki::new("ca");
    let agent = pki.client("mc-one");
    let rotated = pki.client("mc-one");
    fx.registry
        .add(ManagedCluster::new("mc-one").with_fingerprint(Fingerprint::sha256(&agent.der)));

    let (t, peer) = tunnel(&agent);
    fx.registry.accept_tunnel(t).unwrap();
    let cluster = fx.registry.get("mc-one").unwrap();

    // An unchanged record leaves the tunnel alone.
    fx.registry
        .update(ManagedCluster::new("mc-one").with_fingerprint(Fingerprint::sha256(&agent.der)));
    assert!(cluster.is_connected());

    fx.registry
        .update(ManagedCluster::new("mc-one").with_fingerprint(Fingerprint::sha256(&rotated.der)));
    assert!(!cluster.is_connected());
    assert!(!cluster.manager().has_tunnel());
    eventually(|| peer.is_closed()).await;

    let (t, _peer) = tunnel(&rotated);
    fx.registry.accept_tunnel(t).unwrap();
    assert!(cluster.is_connected());
    assert_eq!(
        fx.statuses("mc-one"),
        vec![
            ConnectionStatus::NotConnected,
            ConnectionStatus::Connected,
            ConnectionStatus::NotConnected,
            ConnectionStatus::Connected,
        ]
    );
}

#[tokio::test]
async fn remove_closes_tunnel() {
    let fx = Fixture::new();
    let pki = Pki::new("ca");
    let agent = pki.client("mc-one");
    fx.registry
        .add(ManagedCluster::new("mc-one").with_fingerprint(Fingerprint::sha256(&agent.der)));

    let (t, peer) = tunnel(&agent);
    fx.registry.accept_tunnel(t).unwrap();
    let cluster = fx.registry.get("mc-one").unwrap();
    let assigned = cluster.manager().tunnel().unwrap();

    fx.registry.remove("mc-one");
    assert!(assigned.is_closed());
    assert!(cluster.manager().is_closed());
    assert!(!cluster.is_connected());
    assert!(fx.registry.get("mc-one").is_none());
    eventually(|| peer.is_closed()).await;

    fx.registry.remove("mc-one");
}

#[tokio::test]
async fn resync_matches_store() {
    let fx = Fixture::new();
    fx.store.insert(ManagedCluster::new("b"));
    fx.store.insert(ManagedCluster::new("a"));
    fx.registry.add(ManagedCluster::new("stale"));

    fx.registry.resync().await.unwrap();
    assert_eq!(
        fx.registry.list(),
        vec![
            ClusterSummary {
                id: "a".to_string(),
                connected: false,
            },
            ClusterSummary {
                id: "b".to_string(),
                connected: false,
            },
        ]
    );
}

#[tokio::test]
async fn run_recovers_from_store_failures() {
    let fx = Fixture::new();
    fx.store.insert(ManagedCluster::new("a"));
    fx.store.insert(ManagedCluster::new("b"));
    fx.store.fail_lists(2);

    let registry = Arc::new(fx.registry);
    let run = tokio::spawn({
        let registry = registry.clone();
        async move { registry.run().await }
    });
    let ids = || -> HashSet<String> { registry.list().into_iter().map(|c| c.id).collect() };

    eventually(|| ids() == hashset! {"a".to_string(), "b".to_string()}).await;
    eventually(|| fx.store.watch_count() == 1).await;

    fx.store.apply(ManagedCluster::new("d"));
    fx.store.delete("a");
    eventually(|| ids() == hashset! {"b".to_string(), "d".to_string()}).await;

    // Changes the watch never reports are picked up by the next resync.
    fx.store.remove("b");
    fx.store.insert(ManagedCluster::new("e"));
    fx.store.break_watches();
    eventually(|| ids() == hashset! {"d".to_string(), "e".to_string()}).await;

    fx.shutdown.cancel();
    time::timeout(Duration::from_secs(5), run)
        .await
        .expect("registry must stop")
        .unwrap();
    assert!(registry.list().is_empty());
}

#[tokio::test]
async fn tunnel_failure_disconnects() {
    let mut fx = Fixture::new();
    let pki = Pki::new("ca");
    let agent = pki.client("mc-one");
    fx.registry
        .add(ManagedCluster::new("mc-one").with_fingerprint(Fingerprint::sha256(&agent.der)));

    let (t, peer) = tunnel(&agent);
    fx.registry.accept_tunnel(t).unwrap();
    let cluster = fx.registry.get("mc-one").unwrap();
    assert_eq!(
        fx.registry.list(),
        vec![ClusterSummary {
            id: "mc-one".to_string(),
            connected: true,
        }]
    );

    peer.close();
    drop(peer);
    eventually(|| !cluster.is_connected()).await;
    assert!(!cluster.manager().has_tunnel());
    assert_eq!(
        fx.statuses("mc-one"),
        vec![
            ConnectionStatus::NotConnected,
            ConnectionStatus::Connected,
            ConnectionStatus::NotConnected,
        ]
    );
    assert_eq!(fx.ids(), hashset! {"mc-one".to_string()});
}
