/// Configuration errors. Proxies fail construction with these rather than
/// serving with a bad setup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("target {path:?}: {reason}")]
    InvalidTarget { path: String, reason: String },

    #[error("duplicate target path {0:?}")]
    DuplicatePath(String),

    #[error("invalid path regexp for target {path:?}: {source}")]
    Regex {
        path: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tunnel(#[from] tunnel_broker_tunnel::Error),

    #[error(transparent)]
    Tls(#[from] rustls::Error),
}
