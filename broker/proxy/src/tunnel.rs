use crate::{
    body::{self, BoxBody},
    errors, strip_hop_by_hop,
};
use http::{uri, Request, Response, StatusCode, Uri, Version};
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::{pki_types::ServerName, ClientConfig};
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{debug, info_span, warn, Instrument};
use tunnel_broker_tunnel::Manager;

/// Forwards HTTP requests to a managed cluster through its tunnel.
///
/// HTTP/2 requests share one TLS-wrapped HTTP/2 connection inside the
/// tunnel, re-established when it fails. Other requests each get a fresh
/// stream carrying plain HTTP/1.1.
pub struct TunnelProxy {
    cluster: String,
    manager: Arc<Manager>,
    connector: TlsConnector,
    h2: tokio::sync::Mutex<Option<http2::SendRequest<BoxBody>>>,
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error(transparent)]
    Tunnel(#[from] tunnel_broker_tunnel::Error),

    #[error(transparent)]
    Http(#[from] hyper::Error),

    #[error(transparent)]
    Uri(#[from] http::Error),
}

impl TunnelProxy {
    /// `tls` must negotiate `h2`; the certificate the peer presents inside
    /// the tunnel is not verified.
    pub fn new(cluster: impl ToString, manager: Arc<Manager>, tls: Arc<ClientConfig>) -> Self {
        Self {
            cluster: cluster.to_string(),
            manager,
            connector: TlsConnector::from(tls),
            h2: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn proxy(&self, req: Request<BoxBody>) -> Response<BoxBody> {
        let res = if req.version() == Version::HTTP_2 {
            self.proxy_h2(req)
                .instrument(info_span!("h2", cluster = %self.cluster))
                .await
        } else {
            self.proxy_h1(req)
                .instrument(info_span!("h1", cluster = %self.cluster))
                .await
        };
        match res {
            Ok(rsp) => {
                let (mut parts, body) = rsp.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body::boxed(body))
            }
            Err(error) => {
                warn!(cluster = %self.cluster, %error, "Failed to proxy request through tunnel");
                errors::status(StatusCode::BAD_GATEWAY, "Bad gateway")
            }
        }
    }

    async fn proxy_h1(
        &self,
        req: Request<BoxBody>,
    ) -> Result<Response<hyper::body::Incoming>, Error> {
        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.version = Version::HTTP_11;
        let mut uri = uri::Parts::default();
        uri.path_and_query = parts.uri.path_and_query().cloned();
        parts.uri = Uri::from_parts(uri).map_err(http::Error::from)?;

        let stream = self.manager.open().await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(
            async move {
                if let Err(error) = conn.await {
                    debug!(%error, "Connection failed");
                }
            }
            .in_current_span(),
        );
        Ok(sender.send_request(Request::from_parts(parts, body)).await?)
    }

    async fn proxy_h2(
        &self,
        req: Request<BoxBody>,
    ) -> Result<Response<hyper::body::Incoming>, Error> {
        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let mut uri = uri::Parts::default();
        uri.scheme = Some(uri::Scheme::HTTPS);
        uri.authority = Some(
            parts
                .uri
                .authority()
                .cloned()
                .unwrap_or_else(|| uri::Authority::from_static("localhost")),
        );
        uri.path_and_query = parts.uri.path_and_query().cloned();
        parts.uri = Uri::from_parts(uri).map_err(http::Error::from)?;

        let mut sender = self.h2_sender().await?;
        sender.ready().await?;
        Ok(sender.send_request(Request::from_parts(parts, body)).await?)
    }

    async fn h2_sender(&self) -> Result<http2::SendRequest<BoxBody>, Error> {
        let mut cached = self.h2.lock().await;
        if let Some(sender) = &*cached {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }

        let name = ServerName::try_from(self.cluster.clone())
            .unwrap_or_else(|_| ServerName::try_from("localhost").expect("name must be valid"));
        let stream = self.manager.open_tls(&self.connector, name).await?;
        let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(stream)).await?;
        tokio::spawn(
            async move {
                if let Err(error) = conn.await {
                    debug!(%error, "Connection failed");
                }
            }
            .in_current_span(),
        );
        *cached = Some(sender.clone());
        Ok(sender)
    }
}

impl std::fmt::Debug for TunnelProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelProxy")
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}
