//! Multiplexed mutual-TLS tunnels.
//!
//! A managed cluster's agent dials the broker's [`Server`], presenting a
//! client certificate that chains to the shared [`CertPool`]. The resulting
//! [`Tunnel`] carries any number of yamux streams in either direction. A
//! [`Manager`] owns at most one tunnel for a cluster.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod dial;
mod error;
mod identity;
mod manager;
mod pool;
mod server;
pub mod tls;
mod tunnel;

pub use self::{
    dial::dial,
    error::Error,
    identity::Identity,
    manager::Manager,
    pool::CertPool,
    server::{Accepting, Server},
    tunnel::{Listener, Side, Tunnel, TunnelId},
};

/// A logical byte stream carried by a tunnel.
pub type Stream = tokio_yamux::StreamHandle;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
