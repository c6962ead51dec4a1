//! HTTP plumbing shared by the broker's request router and its tunnels.
//!
//! - [`PathProxy`] forwards requests to configured upstreams by longest path
//!   prefix.
//! - [`TunnelProxy`] forwards requests to a managed cluster through its
//!   tunnel.
//! - [`SniProxy`] serves streams a managed cluster opens back to the broker,
//!   routing each by its TLS server name.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod body;
mod client_hello;
mod error;
pub mod errors;
mod inner;
mod path;
mod rewind;
mod sni;
mod tunnel;

pub use self::{
    body::{BoxBody, BoxError},
    error::Error,
    errors::ErrorCode,
    inner::InnerHandler,
    path::{PathProxy, Target},
    rewind::Rewind,
    sni::{InnerServer, SniProxy},
    tunnel::TunnelProxy,
};

/// Headers that apply to a single connection and are never forwarded.
pub(crate) const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

pub(crate) fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(http::header::TRANSFER_ENCODING);
}
