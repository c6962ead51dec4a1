use crate::{tls, CertPool, Error, Identity, Side, Tunnel};
use parking_lot::Mutex;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    ServerConfig,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts tunnels from agents.
///
/// Client certificates are verified against the shared [`CertPool`]. The TLS
/// configuration is rebuilt lazily whenever the pool has grown.
pub struct Server {
    listener: TcpListener,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    pool: Arc<CertPool>,
    config: Mutex<Option<(u64, Arc<ServerConfig>)>>,
}

/// An accepted TCP connection whose TLS handshake has not yet run.
pub struct Accepting {
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
}

// === impl Server ===

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        pool: Arc<CertPool>,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            certs,
            key,
            pool,
            config: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts the next connection. The TLS handshake is left to
    /// [`Accepting::handshake`] so that slow peers don't hold up the accept
    /// loop.
    pub async fn accept(&self) -> Result<Accepting, Error> {
        let (tcp, peer) = self.listener.accept().await?;
        let _ = tcp.set_nodelay(true);
        let acceptor = TlsAcceptor::from(self.config()?);
        Ok(Accepting {
            tcp,
            peer,
            acceptor,
        })
    }

    fn config(&self) -> Result<Arc<ServerConfig>, Error> {
        let (generation, roots) = self.pool.snapshot();
        let mut cached = self.config.lock();
        if let Some((cached_gen, config)) = &*cached {
            if *cached_gen == generation {
                return Ok(config.clone());
            }
        }
        if roots.is_empty() {
            return Err(Error::EmptyPool);
        }

        let provider = tls::provider();
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone()).build()?;
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs.clone(), self.key.clone_key())?;
        let config = Arc::new(config);
        debug!(generation, "Rebuilt tunnel TLS config");
        *cached = Some((generation, config.clone()));
        Ok(config)
    }
}

// === impl Accepting ===

impl Accepting {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Completes mutual TLS and starts the tunnel session.
    pub async fn handshake(self) -> Result<Tunnel, Error> {
        let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(self.tcp))
            .await
            .map_err(|_| Error::HandshakeTimeout)??;
        let chain = tls
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default();
        let identity = Identity::new(chain)?;
        Ok(Tunnel::new(tls, Side::Server, identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Pki;
    use rustls::pki_types::ServerName;
    use std::time::Duration;
    use tokio::time;

    async fn server(pki: &Pki, pool: Arc<CertPool>) -> Server {
        let creds = pki.server("localhost");
        Server::bind(([127, 0, 0, 1], 0).into(), creds.certs(), creds.key(), pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn verifies_clients_against_pool() {
        let pki = Pki::new("broker-ca");
        let pool = Arc::new(CertPool::from_pem(pki.ca().cert_pem.as_bytes()).unwrap());
        let server = server(&pki, pool).await;
        let addr = server.local_addr().unwrap();

        let agent = pki.client("mc-one");
        let config = tls::client_config(
            pki.ca().cert_pem.as_bytes(),
            agent.cert_pem.as_bytes(),
            agent.key_pem.as_bytes(),
        )
        .unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        let dialed = tokio::spawn(crate::dial(addr, name, config));

        let tunnel = time::timeout(Duration::from_secs(5), async {
            server.accept().await.unwrap().handshake().await
        })
        .await
        .expect("handshake timed out")
        .unwrap();
        assert_eq!(tunnel.identity().common_name().unwrap(), "mc-one");
        assert_eq!(tunnel.identity().der(), agent.der.as_slice());

        let client = dialed.await.unwrap().unwrap();
        assert_eq!(client.identity().common_name().unwrap(), "localhost");
    }

    #[tokio::test]
    async fn rejects_until_pool_grows() {
        let broker = Pki::new("broker-ca");
        let other = Pki::new("other-ca");
        let pool = Arc::new(CertPool::from_pem(broker.ca().cert_pem.as_bytes()).unwrap());
        let server = server(&broker, pool.clone()).await;
        let addr = server.local_addr().unwrap();

        let agent = other.client("mc-two");
        let config = tls::client_config(
            broker.ca().cert_pem.as_bytes(),
            agent.cert_pem.as_bytes(),
            agent.key_pem.as_bytes(),
        )
        .unwrap();
        let name = ServerName::try_from("localhost").unwrap();

        let dialed = tokio::spawn(crate::dial(addr, name.clone(), config.clone()));
        let accepted = time::timeout(Duration::from_secs(5), async {
            server.accept().await.unwrap().handshake().await
        })
        .await
        .expect("handshake timed out");
        assert!(accepted.is_err());
        drop(dialed.await);

        pool.append_pem(other.ca().cert_pem.as_bytes()).unwrap();
        let dialed = tokio::spawn(crate::dial(addr, name, config));
        let tunnel = time::timeout(Duration::from_secs(5), async {
            server.accept().await.unwrap().handshake().await
        })
        .await
        .expect("handshake timed out")
        .unwrap();
        assert_eq!(tunnel.identity().common_name().unwrap(), "mc-two");
        dialed.await.unwrap().unwrap();
    }
}
