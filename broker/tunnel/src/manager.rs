use crate::{Error, Listener, Stream, Tunnel};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_rustls::{client::TlsStream, TlsConnector};

/// Owns at most one tunnel for a logical peer.
///
/// A tunnel must be explicitly cleared with [`Manager::close_tunnel`] before
/// another can be set. Once [`Manager::close`]d, a manager refuses new
/// tunnels.
#[derive(Debug, Default)]
pub struct Manager {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    closed: bool,
    tunnel: Option<Arc<Tunnel>>,
}

impl Manager {
    /// Assigns a tunnel. If one is already assigned, or the manager is
    /// closed, the new tunnel is closed and an error returned.
    pub fn set_tunnel(&self, tunnel: Tunnel) -> Result<Arc<Tunnel>, Error> {
        let mut state = self.state.lock();
        if state.closed {
            tunnel.close();
            return Err(Error::ManagerClosed);
        }
        if state.tunnel.is_some() {
            tunnel.close();
            return Err(Error::TunnelSet);
        }
        let tunnel = Arc::new(tunnel);
        state.tunnel = Some(tunnel.clone());
        Ok(tunnel)
    }

    pub fn tunnel(&self) -> Option<Arc<Tunnel>> {
        self.state.lock().tunnel.clone()
    }

    pub fn has_tunnel(&self) -> bool {
        self.state.lock().tunnel.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn current(&self) -> Result<Arc<Tunnel>, Error> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::ManagerClosed);
        }
        state.tunnel.clone().ok_or(Error::NoTunnel)
    }

    /// Opens a stream through the assigned tunnel.
    pub async fn open(&self) -> Result<Stream, Error> {
        self.current()?.open_stream().await
    }

    /// Opens a stream through the assigned tunnel and starts TLS over it.
    pub async fn open_tls(
        &self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<TlsStream<Stream>, Error> {
        let stream = self.open().await?;
        Ok(connector.connect(server_name, stream).await?)
    }

    /// Waits for exclusive access to the streams the peer opens.
    pub async fn listener(&self) -> Result<Listener, Error> {
        self.current()?.listener().await
    }

    /// Returns a receiver that yields exactly one error when the assigned
    /// tunnel dies. It may be taken once per tunnel.
    pub fn listen_for_errors(&self) -> Result<oneshot::Receiver<Error>, Error> {
        self.current()?
            .take_errors()
            .ok_or(Error::AlreadyListening)
    }

    /// Closes and clears the assigned tunnel, if any.
    pub fn close_tunnel(&self) {
        if let Some(tunnel) = self.state.lock().tunnel.take() {
            tunnel.close();
        }
    }

    /// Closes the assigned tunnel and refuses any further ones.
    pub fn close(&self) {
        let tunnel = {
            let mut state = self.state.lock();
            state.closed = true;
            state.tunnel.take()
        };
        if let Some(tunnel) = tunnel {
            tunnel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Identity, Side};
    use rustls::pki_types::CertificateDer;
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        time,
    };

    fn identity() -> Identity {
        Identity::new(vec![CertificateDer::from(vec![1, 2, 3])]).unwrap()
    }

    fn pair() -> (Tunnel, Tunnel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Tunnel::new(a, Side::Server, identity()),
            Tunnel::new(b, Side::Client, identity()),
        )
    }

    #[tokio::test]
    async fn at_most_one_tunnel() {
        let manager = Manager::default();
        let (first, _first_peer) = pair();
        let first_id = first.id();
        manager.set_tunnel(first).unwrap();

        let (second, _second_peer) = pair();
        assert!(matches!(manager.set_tunnel(second), Err(Error::TunnelSet)));
        assert_eq!(manager.tunnel().unwrap().id(), first_id);

        manager.close_tunnel();
        manager.close_tunnel();
        assert!(!manager.has_tunnel());

        let (third, _third_peer) = pair();
        manager.set_tunnel(third).unwrap();

        manager.close();
        manager.close();
        let (fourth, _fourth_peer) = pair();
        assert!(matches!(
            manager.set_tunnel(fourth),
            Err(Error::ManagerClosed)
        ));
    }

    #[tokio::test]
    async fn streams_flow_both_ways() {
        let manager = Manager::default();
        let (server, client) = pair();
        manager.set_tunnel(server).unwrap();

        let echo = tokio::spawn(async move {
            let mut listener = client.listener().await.unwrap();
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
            client
        });

        let mut stream = manager.open().await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(&buf, b"hello");
        drop(time::timeout(Duration::from_secs(5), echo).await);
    }

    #[tokio::test]
    async fn reports_exactly_one_error_when_peer_goes_away() {
        let manager = Manager::default();
        let (server, client) = pair();
        manager.set_tunnel(server).unwrap();

        let errors = manager.listen_for_errors().unwrap();
        assert!(matches!(
            manager.listen_for_errors(),
            Err(Error::AlreadyListening)
        ));

        client.close();
        drop(client);
        let error = time::timeout(Duration::from_secs(5), errors)
            .await
            .expect("tunnel error timed out")
            .expect("error sender dropped");
        assert!(matches!(error, Error::TunnelClosed | Error::Session(_)));

        assert!(manager.open().await.is_err());
    }

    #[tokio::test]
    async fn listener_is_exclusive() {
        let (server, _client) = pair();
        let first = server.listener().await.unwrap();
        assert!(
            time::timeout(Duration::from_millis(50), server.listener())
                .await
                .is_err(),
            "second listener must wait"
        );
        drop(first);
        time::timeout(Duration::from_secs(1), server.listener())
            .await
            .expect("listener must be available again")
            .unwrap();
    }

    #[tokio::test]
    async fn refused_streams_are_closed() {
        let (server, client) = pair();
        let queued = client.open_stream().await.unwrap();
        // Let the queued stream reach the server before refusing.
        time::sleep(Duration::from_millis(50)).await;
        server.refuse_incoming();
        let later = client.open_stream().await.unwrap();

        for mut stream in [queued, later] {
            let mut buf = [0u8; 1];
            let read = time::timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .expect("refused stream must be closed");
            assert!(!matches!(read, Ok(n) if n > 0));
        }

        let mut listener = server.listener().await.unwrap();
        assert!(matches!(listener.accept().await, Err(Error::TunnelClosed)));
        assert!(!server.is_closed(), "refusing streams keeps the tunnel up");
    }
}
