use crate::{
    auth::TokenReviewer,
    authz::{self, AccessReviewer, Authorize, Cached},
    index, k8s,
    muxer::{self, Muxer},
    proxy::{InnerHandler, InnerServer, PathProxy, SniProxy, Target},
    server, status,
    tunnel::{self, tls, CertPool},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use http::header::HeaderName;
use prometheus_client::registry::Registry;
use regex::Regex;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{sync::mpsc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

// Status requests are coalesced per cluster, so this only needs to absorb a
// burst of connects and disconnects.
const STATUS_UPDATE_QUEUE_SIZE: usize = 1000;

const AUTHZ_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Parser)]
#[clap(name = "tunnel-broker", about = "Brokers access to managed clusters over tunnels")]
pub struct Args {
    #[clap(
        long,
        default_value = "tunnel_broker=info,warn",
        env = "TUNNEL_BROKER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The address the client-facing HTTP(S) server listens on.
    #[clap(long, default_value = "0.0.0.0:9443")]
    https_addr: SocketAddr,

    /// The certificate served to clients. Without it the server speaks plain
    /// HTTP.
    #[clap(long, requires = "https_key")]
    https_cert: Option<PathBuf>,

    #[clap(long, requires = "https_cert")]
    https_key: Option<PathBuf>,

    /// The address agents dial to establish tunnels.
    #[clap(long, default_value = "0.0.0.0:9449")]
    tunnel_addr: SocketAddr,

    #[clap(long)]
    tunnel_cert: PathBuf,

    #[clap(long)]
    tunnel_key: PathBuf,

    /// A PEM bundle seeding the pool of trusted agent certificates.
    #[clap(long)]
    tunnel_ca: Option<PathBuf>,

    /// Where streams opened by managed clusters go by default (`host:port`).
    #[clap(long)]
    default_forward_server: Option<String>,

    #[clap(long, default_value = "5")]
    default_forward_dial_attempts: usize,

    #[clap(long, default_value = "2")]
    default_forward_dial_interval_secs: u64,

    /// TLS server names answered by the in-process inner server.
    #[clap(long, value_delimiter = ',')]
    inner_server_names: Vec<String>,

    #[clap(long)]
    inner_cert: Option<PathBuf>,

    #[clap(long)]
    inner_key: Option<PathBuf>,

    /// A JSON list of path proxy targets for requests served locally.
    #[clap(long, default_value = "[]")]
    default_targets: String,

    /// A JSON list of path proxy targets for the inner server.
    #[clap(long, default_value = "[]")]
    inner_targets: String,

    #[clap(long, default_value = "")]
    unauthenticated_targets: Regexes,

    #[clap(long, default_value = "^/api/?,^/apis/?")]
    k8s_targets: Regexes,

    #[clap(long, default_value = "^/api/?,^/apis/?")]
    tunnel_targets: Regexes,

    #[clap(long, default_value = "x-cluster-id")]
    cluster_header: HeaderName,

    #[clap(long)]
    tenant_id: Option<String>,

    /// The namespace of managed clusters, in multi-tenant mode.
    #[clap(long)]
    tenant_namespace: Option<String>,

    #[clap(long, default_value = "cluster")]
    management_cluster_id: String,

    #[clap(
        long,
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token"
    )]
    service_account_token_path: PathBuf,

    /// Impersonates the caller on all tunneled requests, not only on
    /// Kubernetes API requests.
    #[clap(long)]
    impersonate_tunnel_requests: bool,

    /// Checks that the caller may get a managed cluster before tunneling to
    /// it.
    #[clap(long)]
    check_cluster_access: bool,

    #[clap(long, default_value = "20")]
    authz_cache_ttl_secs: u64,

    /// Restricts fingerprints to SHA-256.
    #[clap(long)]
    fips_mode: bool,

    #[clap(long, default_value = "1000")]
    status_tick_ms: u64,

    #[clap(long, default_value = "30")]
    status_max_backoff_secs: u64,
}

/// A comma-separated list of regular expressions.
#[derive(Clone, Debug)]
struct Regexes(Vec<Regex>);

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            https_addr,
            https_cert,
            https_key,
            tunnel_addr,
            tunnel_cert,
            tunnel_key,
            tunnel_ca,
            default_forward_server,
            default_forward_dial_attempts,
            default_forward_dial_interval_secs,
            inner_server_names,
            inner_cert,
            inner_key,
            default_targets,
            inner_targets,
            unauthenticated_targets: Regexes(unauthenticated_targets),
            k8s_targets: Regexes(k8s_targets),
            tunnel_targets: Regexes(tunnel_targets),
            cluster_header,
            tenant_id,
            tenant_namespace,
            management_cluster_id,
            service_account_token_path,
            impersonate_tunnel_requests,
            check_cluster_access,
            authz_cache_ttl_secs,
            fips_mode,
            status_tick_ms,
            status_max_backoff_secs,
        } = self;

        let _ = rustls::crypto::ring::default_provider().install_default();

        // Validate everything that can fail before starting the runtime.
        let default_proxy = PathProxy::new(
            Target::parse_list(&default_targets).context("invalid --default-targets")?,
        )
        .context("invalid --default-targets")?;

        let tunnel_certs = tls::load_certs(&read(&tunnel_cert).await?)?;
        let tunnel_key = tls::load_key(&read(&tunnel_key).await?)?;
        let pool = Arc::new(match tunnel_ca {
            Some(path) => CertPool::from_pem(&read(&path).await?)?,
            None => CertPool::default(),
        });

        let https = match (https_cert, https_key) {
            (Some(cert), Some(key)) => Some(server::tls_acceptor(
                tls::load_certs(&read(&cert).await?)?,
                tls::load_key(&read(&key).await?)?,
            )?),
            _ => None,
        };

        let inner = if inner_server_names.is_empty() {
            None
        } else {
            let (Some(cert), Some(key)) = (inner_cert, inner_key) else {
                bail!("--inner-server-names requires --inner-cert and --inner-key");
            };
            let proxy = PathProxy::new(
                Target::parse_list(&inner_targets).context("invalid --inner-targets")?,
            )
            .context("invalid --inner-targets")?;
            let handler = InnerHandler::new(
                proxy,
                cluster_header.clone(),
                muxer::TENANT_HEADER,
                tenant_id.as_deref(),
            )?;
            Some(InnerServer::new(
                inner_server_names,
                tls::load_certs(&read(&cert).await?)?,
                tls::load_key(&read(&key).await?)?,
                handler,
            )?)
        };
        let sni = Arc::new(SniProxy::new(
            default_forward_server,
            default_forward_dial_attempts,
            Duration::from_secs(default_forward_dial_interval_secs),
            inner,
        ));

        let authz_cache_ttl = Duration::from_secs(authz_cache_ttl_secs);
        if authz_cache_ttl > authz::MAX_CACHE_TTL {
            bail!(
                "--authz-cache-ttl-secs must not exceed {}",
                authz::MAX_CACHE_TTL.as_secs()
            );
        }

        let clusters = index::SharedClusters::default();
        let mut prom = <Registry>::default();
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("cluster_status"));
        index::metrics::register(
            prom.sub_registry_with_prefix("cluster_index"),
            clusters.clone(),
        );
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        info!(certificates = pool.len(), "Loaded tunnel client pool");
        let shutdown = CancellationToken::new();
        let client = runtime.client();
        let store = Arc::new(k8s::KubeStore::new(
            client.clone(),
            tenant_namespace.as_deref(),
            fips_mode,
        ));

        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let registry = Arc::new(index::Registry::new(
            clusters,
            store.clone(),
            updates_tx,
            pool.clone(),
            Some(sni),
            shutdown.clone(),
        )?);

        let status_controller = status::Controller::new(
            store,
            updates_rx,
            status::Config {
                tick: Duration::from_millis(status_tick_ms),
                max_backoff: Duration::from_secs(status_max_backoff_secs),
                ..Default::default()
            },
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run(shutdown.clone())
                .instrument(info_span!("status_controller")),
        );

        let watch = tokio::spawn({
            let registry = registry.clone();
            async move { registry.run().await }.instrument(info_span!("registry"))
        });

        let tunnels = tunnel::Server::bind(tunnel_addr, tunnel_certs, tunnel_key, pool)
            .await
            .with_context(|| format!("failed to bind tunnel server on {tunnel_addr}"))?;
        info!(addr = %tunnel_addr, "Tunnel server listening");
        tokio::spawn(
            registry
                .clone()
                .serve(tunnels)
                .instrument(info_span!("tunnels")),
        );

        let authz = if check_cluster_access {
            let cached = Cached::new(
                AccessReviewer::new(client.clone()),
                authz_cache_ttl,
                AUTHZ_CACHE_CAPACITY,
            )?;
            Some(Arc::new(cached) as Arc<dyn Authorize>)
        } else {
            None
        };
        let muxer = Muxer::new(
            muxer::Config {
                unauthenticated_targets,
                k8s_targets,
                tunnel_targets,
                cluster_header,
                tenant_id,
                tenant_namespace,
                management_cluster_id,
                service_account_token_path,
                impersonate_tunnel_requests,
            },
            registry,
            default_proxy,
            Arc::new(TokenReviewer::new(client)),
            authz,
        )?;
        let listener = tokio::net::TcpListener::bind(https_addr)
            .await
            .with_context(|| format!("failed to bind HTTP server on {https_addr}"))?;
        tokio::spawn(
            server::serve(listener, https, muxer, shutdown.clone()).instrument(info_span!("http")),
        );

        // Hold the runtime's shutdown until the broker's tasks have observed
        // cancellation and the registry has closed every tunnel.
        let drain = runtime.shutdown_handle();
        tokio::spawn(async move {
            let release = drain.signaled().await;
            shutdown.cancel();
            let _ = watch.await;
            drop(release);
        });

        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn read(path: &std::path::Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

impl std::str::FromStr for Regexes {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|re| Regex::new(re).with_context(|| format!("invalid regex {re:?}")))
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }
}
