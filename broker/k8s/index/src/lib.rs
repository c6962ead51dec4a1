//! The broker's directory of managed clusters.
//!
//! The [`Registry`] mirrors the store's `ManagedCluster` collection with a
//! list+watch+resync loop. Each entry owns a tunnel [`Manager`] that holds at
//! most one tunnel from the cluster's agent:
//!
//! ```text
//! [ ManagedCluster ] -> [ Cluster ] -> [ Manager ] -> [ Tunnel ]
//!                                  \-> [ TunnelProxy ] (while connected)
//! ```
//!
//! Incoming tunnels are matched to an entry by the common name of the
//! agent's certificate, then verified against the entry's recorded
//! certificate or fingerprint. Legacy MD5 fingerprints are upgraded to
//! SHA-256 the first time they match.
//!
//! Connectivity changes are sent to the status controller, which writes
//! them back to the store.
//!
//! [`Manager`]: tunnel_broker_tunnel::Manager

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod registry;

#[cfg(test)]
mod tests;

pub use self::registry::{
    AcceptError, Cluster, ClusterSummary, Connection, Registry, SharedClusters,
};
