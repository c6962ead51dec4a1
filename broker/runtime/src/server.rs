//! The client-facing HTTP(S) server in front of the [`Muxer`].

use crate::muxer::Muxer;
use anyhow::{Context, Result};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnel_broker_tunnel::tls;

const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Builds the server TLS config. Both HTTP/2 and HTTP/1.1 are offered.
pub fn tls_acceptor(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor> {
    let mut config = ServerConfig::builder_with_provider(tls::provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid server certificate")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Serves `muxer` on `listener` until `shutdown` fires. Without an acceptor
/// connections are plaintext.
pub async fn serve(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    muxer: Muxer,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, tls = tls.is_some(), "HTTP server listening");
    }

    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("HTTP server shutting down");
                return;
            }
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    continue;
                }
            },
        };
        let _ = tcp.set_nodelay(true);

        let muxer = muxer.clone();
        let shutdown = shutdown.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            match tls {
                None => serve_connection(peer, tcp, muxer, shutdown).await,
                Some(acceptor) => match acceptor.accept(tcp).await {
                    Ok(io) => serve_connection(peer, io, muxer, shutdown).await,
                    Err(error) => debug!(%peer, %error, "TLS handshake failed"),
                },
            }
        });
    }
}

async fn serve_connection<I>(peer: SocketAddr, io: I, muxer: Muxer, shutdown: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(io), TowerToHyperService::new(muxer));
    tokio::pin!(conn);
    let res = tokio::select! {
        res = conn.as_mut() => res,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(error) = res {
        debug!(%peer, %error, "Connection closed with error");
    }
}
