use crate::{Error, Identity, Stream};
use futures::StreamExt;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, OwnedMutexGuard},
};
use tokio_util::sync::CancellationToken;
use tokio_yamux::{session::SessionType, Config, Control, Session};
use tracing::{debug, info_span, Instrument};

/// Incoming streams are buffered up to this many before new ones are reset.
const INCOMING_CAPACITY: usize = 64;

/// Identifies one tunnel for the life of the process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TunnelId(u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    /// The broker's end.
    Server,
    /// The agent's end.
    Client,
}

/// A multiplexed connection to a peer.
///
/// Either end may open streams. A background task drives the yamux session;
/// when it fails or the tunnel is closed, the tunnel's error receiver yields
/// exactly one error.
pub struct Tunnel {
    id: TunnelId,
    identity: Identity,
    control: Control,
    incoming: Arc<tokio::sync::Mutex<mpsc::Receiver<Stream>>>,
    closed: CancellationToken,
    errors: Mutex<Option<oneshot::Receiver<Error>>>,
}

/// Exclusive access to a tunnel's incoming streams. Dropping it allows the
/// tunnel to be listened on again.
pub struct Listener {
    incoming: OwnedMutexGuard<mpsc::Receiver<Stream>>,
    closed: CancellationToken,
}

// === impl TunnelId ===

impl TunnelId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl Tunnel ===

impl Tunnel {
    /// Starts a yamux session over `io`. `identity` is the peer's
    /// already-verified certificate chain.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T>(io: T, side: Side, identity: Identity) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ty = match side {
            Side::Server => SessionType::Server,
            Side::Client => SessionType::Client,
        };
        let session = Session::new(io, Config::default(), ty);
        let control = session.control();

        let id = TunnelId::next();
        let (streams_tx, streams_rx) = mpsc::channel(INCOMING_CAPACITY);
        let (errors_tx, errors_rx) = oneshot::channel();
        let closed = CancellationToken::new();
        tokio::spawn(
            drive(session, streams_tx, errors_tx, closed.clone())
                .instrument(info_span!("tunnel", %id)),
        );

        Self {
            id,
            identity,
            control,
            incoming: Arc::new(tokio::sync::Mutex::new(streams_rx)),
            closed,
            errors: Mutex::new(Some(errors_rx)),
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Opens a new stream to the peer.
    pub async fn open_stream(&self) -> Result<Stream, Error> {
        if self.is_closed() {
            return Err(Error::TunnelClosed);
        }
        let mut control = self.control.clone();
        tokio::select! {
            res = control.open_stream() => res.map_err(|e| Error::Session(format!("{e:?}"))),
            _ = self.closed.cancelled() => Err(Error::TunnelClosed),
        }
    }

    /// Waits for exclusive access to streams the peer opens.
    pub async fn listener(&self) -> Result<Listener, Error> {
        let incoming = tokio::select! {
            guard = self.incoming.clone().lock_owned() => guard,
            _ = self.closed.cancelled() => return Err(Error::TunnelClosed),
        };
        Ok(Listener {
            incoming,
            closed: self.closed.clone(),
        })
    }

    /// Stops accepting streams the peer opens. Queued streams and any opened
    /// later are dropped, which closes them on the peer. Does nothing while a
    /// [`Listener`] is held.
    pub fn refuse_incoming(&self) {
        let Ok(mut incoming) = self.incoming.try_lock() else {
            debug!("Tunnel has a listener; still accepting incoming streams");
            return;
        };
        incoming.close();
        while incoming.try_recv().is_ok() {}
    }

    /// Takes the receiver that yields the error that ends this tunnel. It can
    /// only be taken once.
    pub fn take_errors(&self) -> Option<oneshot::Receiver<Error>> {
        self.errors.lock().take()
    }

    /// Shuts the session down. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn drive<T>(
    mut session: Session<T>,
    streams: mpsc::Sender<Stream>,
    errors: oneshot::Sender<Error>,
    closed: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let error = loop {
        tokio::select! {
            _ = closed.cancelled() => break Error::TunnelClosed,
            next = session.next() => match next {
                Some(Ok(stream)) => {
                    // A full or closed queue drops the stream, closing it.
                    if let Err(error) = streams.try_send(stream) {
                        debug!(%error, "Dropping incoming stream");
                    }
                }
                Some(Err(error)) => break Error::Session(error.to_string()),
                None => break Error::TunnelClosed,
            },
        }
    };
    debug!(%error, "Tunnel session ended");
    closed.cancel();
    let _ = errors.send(error);
}

// === impl Listener ===

impl Listener {
    /// Waits for the peer to open a stream. Fails once the tunnel closes or
    /// refuses incoming streams.
    pub async fn accept(&mut self) -> Result<Stream, Error> {
        tokio::select! {
            stream = self.incoming.recv() => stream.ok_or(Error::TunnelClosed),
            _ = self.closed.cancelled() => Err(Error::TunnelClosed),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").finish_non_exhaustive()
    }
}
