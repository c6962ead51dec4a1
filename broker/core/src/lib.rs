//! Shared types for the tunnel broker.
//!
//! The broker reads `ManagedCluster` resources from an external store, keeps
//! at most one tunnel per cluster, and writes back connectivity status. This
//! crate holds the pieces every other crate agrees on: the broker's view of a
//! managed cluster, certificate fingerprints, and the store abstraction.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod fingerprint;
#[cfg(feature = "test-util")]
pub mod mem;
mod store;

pub use self::{
    fingerprint::{Fingerprint, ParseFingerprintError},
    store::{Listing, ManagedClusterStore, StoreError, WatchEvent, WatchStream},
};

/// Annotation on a `ManagedCluster` holding the hex fingerprint of the client
/// certificate the cluster's agent is expected to present.
pub const ACTIVE_FINGERPRINT_ANNOTATION: &str = "certs.tigera.io/active-fingerprint";

/// The broker's view of a `ManagedCluster` resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagedCluster {
    /// The resource name. Agents present it as their certificate's common name.
    pub id: String,

    /// Fingerprint of the certificate the agent must present, when no full
    /// certificate is recorded.
    pub active_fingerprint: Option<Fingerprint>,

    /// PEM-encoded client certificate. Takes precedence over the fingerprint.
    pub certificate: Option<String>,

    /// When set, legacy MD5 fingerprints are never computed or accepted.
    pub fips_mode_enabled: bool,
}

/// Value of a cluster's `Connected` status condition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connected,
    NotConnected,
    Unknown,
}

// === impl ManagedCluster ===

impl ManagedCluster {
    pub fn new(id: impl ToString) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.active_fingerprint = Some(fingerprint);
        self
    }

    pub fn with_certificate(mut self, pem: impl ToString) -> Self {
        self.certificate = Some(pem.to_string());
        self
    }
}

// === impl ConnectionStatus ===

impl ConnectionStatus {
    pub const CONDITION_TYPE: &'static str = "Connected";

    /// The condition status string as written to the resource.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "True",
            Self::NotConnected => "False",
            Self::Unknown => "Unknown",
        }
    }

    pub fn from_condition(value: &str) -> Self {
        match value {
            "True" => Self::Connected,
            "False" => Self::NotConnected,
            _ => Self::Unknown,
        }
    }
}

impl From<bool> for ConnectionStatus {
    fn from(connected: bool) -> Self {
        if connected {
            Self::Connected
        } else {
            Self::NotConnected
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
