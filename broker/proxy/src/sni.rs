use crate::{
    body,
    client_hello::{self, Parsed},
    Error, InnerHandler, Rewind,
};
use hyper::{body::Incoming, service::service_fn, Request};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig,
};
use std::{collections::HashSet, convert::Infallible, sync::Arc, time::Duration};
use tokio::{io::AsyncReadExt, net::TcpStream, time};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use tunnel_broker_tunnel::{tls, Manager, Stream};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Routes streams a managed cluster opens through its tunnel.
///
/// Streams whose TLS server name is one of the inner server's names are
/// terminated in process; all others are spliced to the default forwarding
/// address.
#[derive(Debug)]
pub struct SniProxy {
    default_forward: Option<String>,
    dial_attempts: usize,
    dial_interval: Duration,
    inner: Option<InnerServer>,
}

/// The in-process HTTPS server for streams addressed to the broker itself.
pub struct InnerServer {
    server_names: HashSet<String>,
    acceptor: TlsAcceptor,
    handler: Arc<InnerHandler>,
}

// === impl SniProxy ===

impl SniProxy {
    pub fn new(
        default_forward: Option<String>,
        dial_attempts: usize,
        dial_interval: Duration,
        inner: Option<InnerServer>,
    ) -> Self {
        Self {
            default_forward,
            dial_attempts: dial_attempts.max(1),
            dial_interval,
            inner,
        }
    }

    /// Tests whether there is anywhere to send streams.
    pub fn is_enabled(&self) -> bool {
        self.default_forward.is_some() || self.inner.is_some()
    }

    /// Serves streams from `manager`'s tunnel until it closes or `shutdown`
    /// fires. A failed listener is re-acquired after a second.
    pub async fn serve(
        self: Arc<Self>,
        cluster: String,
        manager: Arc<Manager>,
        shutdown: CancellationToken,
    ) {
        let cluster: Arc<str> = cluster.into();
        loop {
            let listener = tokio::select! {
                res = manager.listener() => res,
                _ = shutdown.cancelled() => return,
            };
            match listener {
                Ok(mut listener) => loop {
                    let stream = tokio::select! {
                        res = listener.accept() => res,
                        _ = shutdown.cancelled() => return,
                    };
                    match stream {
                        Ok(stream) => {
                            tokio::spawn(
                                self.clone()
                                    .handle(cluster.clone(), stream)
                                    .instrument(info_span!("stream")),
                            );
                        }
                        Err(error) if error.is_closed() => {
                            debug!(%error, "Tunnel closed");
                            return;
                        }
                        Err(error) => {
                            warn!(%error, "Failed to accept stream");
                            break;
                        }
                    }
                },
                Err(error) if error.is_closed() => {
                    debug!(%error, "Tunnel closed");
                    return;
                }
                Err(error) => warn!(%error, "Failed to listen on tunnel"),
            }

            tokio::select! {
                _ = time::sleep(RESTART_DELAY) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    async fn handle(self: Arc<Self>, cluster: Arc<str>, mut stream: Stream) {
        let mut buf = Vec::with_capacity(1024);
        let server_name = match time::timeout(HELLO_TIMEOUT, peek_server_name(&mut stream, &mut buf)).await {
            Ok(Ok(name)) => name,
            Ok(Err(error)) => {
                debug!(%error, "Failed to read from stream");
                return;
            }
            Err(_) => {
                debug!("Timed out waiting for ClientHello");
                return;
            }
        };
        let io = Rewind::new(buf, stream);

        if let (Some(name), Some(inner)) = (&server_name, &self.inner) {
            if inner.server_names.contains(name) {
                debug!(server_name = %name, "Serving inner request");
                return inner.serve(cluster, io).await;
            }
        }
        debug!(server_name = ?server_name, "Forwarding stream");
        self.forward(io).await
    }

    async fn forward(&self, mut io: Rewind<Stream>) {
        let Some(addr) = &self.default_forward else {
            debug!("No default forwarding address; dropping stream");
            return;
        };

        let mut attempt = 1;
        let mut upstream = loop {
            match TcpStream::connect(addr.as_str()).await {
                Ok(upstream) => break upstream,
                Err(error) if attempt < self.dial_attempts => {
                    debug!(%addr, %error, attempt, "Dial failed; retrying");
                    attempt += 1;
                    time::sleep(self.dial_interval).await;
                }
                Err(error) => {
                    warn!(%addr, %error, attempts = attempt, "Failed to dial default forwarding address");
                    return;
                }
            }
        };

        match tokio::io::copy_bidirectional(&mut io, &mut upstream).await {
            Ok((tx, rx)) => debug!(tx, rx, "Stream closed"),
            Err(error) => debug!(%error, "Stream failed"),
        }
    }
}

async fn peek_server_name(stream: &mut Stream, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    loop {
        match client_hello::parse(buf) {
            Parsed::Hello(name) => return Ok(name),
            Parsed::NotTls => return Ok(None),
            Parsed::Incomplete if buf.len() >= client_hello::MAX_HELLO_LEN => return Ok(None),
            Parsed::Incomplete => {
                if stream.read_buf(buf).await? == 0 {
                    return Ok(None);
                }
            }
        }
    }
}

// === impl InnerServer ===

impl InnerServer {
    pub fn new(
        server_names: impl IntoIterator<Item = String>,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        handler: InnerHandler,
    ) -> Result<Self, Error> {
        let mut config = ServerConfig::builder_with_provider(tls::provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(Self {
            server_names: server_names
                .into_iter()
                .map(|n| n.to_ascii_lowercase())
                .collect(),
            acceptor: TlsAcceptor::from(Arc::new(config)),
            handler: Arc::new(handler),
        })
    }

    async fn serve(&self, cluster: Arc<str>, io: Rewind<Stream>) {
        let tls = match self.acceptor.accept(io).await {
            Ok(tls) => tls,
            Err(error) => {
                info!(%error, "Inner TLS handshake failed");
                return;
            }
        };

        let handler = self.handler.clone();
        let svc = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let cluster = cluster.clone();
            async move { Ok::<_, Infallible>(handler.handle(&cluster, req.map(body::boxed)).await) }
        });
        if let Err(error) = auto::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(tls), svc)
            .await
        {
            debug!(%error, "Inner connection failed");
        }
    }
}

impl std::fmt::Debug for InnerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerServer")
            .field("server_names", &self.server_names)
            .finish_non_exhaustive()
    }
}
