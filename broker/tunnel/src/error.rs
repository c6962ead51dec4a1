#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tunnel already set")]
    TunnelSet,

    #[error("no tunnel set")]
    NoTunnel,

    #[error("tunnel closed")]
    TunnelClosed,

    #[error("manager closed")]
    ManagerClosed,

    #[error("tunnel errors are already being listened for")]
    AlreadyListening,

    #[error("tunnel session failed: {0}")]
    Session(String),

    #[error("peer presented no certificate")]
    NoPeerCertificate,

    #[error("invalid certificate: {0}")]
    Certificate(String),

    #[error("invalid private key: {0}")]
    PrivateKey(String),

    #[error("client certificate pool is empty")]
    EmptyPool,

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error(transparent)]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Tests whether the error means the tunnel (or its manager) is gone for
    /// good, as opposed to a failure of a single operation.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::TunnelClosed | Self::ManagerClosed | Self::NoTunnel
        )
    }
}
