use crate::{Error, Identity, Side, Tunnel};
use rustls::{pki_types::ServerName, ClientConfig};
use std::sync::Arc;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_rustls::TlsConnector;

/// Dials a broker's tunnel server, presenting the client certificate in
/// `config`. The returned tunnel's identity is the server's certificate.
pub async fn dial(
    addr: impl ToSocketAddrs,
    server_name: ServerName<'static>,
    config: Arc<ClientConfig>,
) -> Result<Tunnel, Error> {
    let tcp = TcpStream::connect(addr).await?;
    let _ = tcp.set_nodelay(true);
    let tls = TlsConnector::from(config).connect(server_name, tcp).await?;
    let chain = tls
        .get_ref()
        .1
        .peer_certificates()
        .map(|certs| certs.to_vec())
        .unwrap_or_default();
    let identity = Identity::new(chain)?;
    Ok(Tunnel::new(tls, Side::Client, identity))
}
