use k8s_openapi::ByteString;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use tunnel_broker_core::{self as core, ConnectionStatus, Fingerprint, ACTIVE_FINGERPRINT_ANNOTATION};

/// A remote cluster that may connect to the broker through a tunnel.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "projectcalico.org",
    version = "v3",
    kind = "ManagedCluster",
    status = "ManagedClusterStatus",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_manifest: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    /// The PEM-encoded client certificate the cluster's agent presents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<ByteString>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub status: String,

    #[serde(rename = "type")]
    pub type_: String,
}

// === impl ManagedCluster ===

impl ManagedCluster {
    /// Converts the resource into the broker's view of it.
    ///
    /// An unparseable fingerprint annotation is dropped with a warning, so the
    /// cluster is known but can't connect until the annotation is fixed.
    pub fn to_core(&self, fips_mode_enabled: bool) -> core::ManagedCluster {
        let id = self.name_any();
        let active_fingerprint = self
            .annotations()
            .get(ACTIVE_FINGERPRINT_ANNOTATION)
            .and_then(|value| match value.parse::<Fingerprint>() {
                Ok(fp) => Some(fp),
                Err(error) => {
                    tracing::warn!(cluster = %id, %error, "Ignoring invalid fingerprint annotation");
                    None
                }
            });
        let certificate = self
            .spec
            .certificate
            .as_ref()
            .filter(|c| !c.0.is_empty())
            .map(|c| String::from_utf8_lossy(&c.0).into_owned());

        core::ManagedCluster {
            id,
            active_fingerprint,
            certificate,
            fips_mode_enabled,
        }
    }

    pub fn connected(&self) -> ConnectionStatus {
        self.status
            .as_ref()
            .and_then(|s| {
                s.conditions
                    .iter()
                    .find(|c| c.type_ == ConnectionStatus::CONDITION_TYPE)
            })
            .map(|c| ConnectionStatus::from_condition(&c.status))
            .unwrap_or(ConnectionStatus::Unknown)
    }
}

// === impl ManagedClusterStatus ===

impl ManagedClusterStatus {
    /// Sets the `Connected` condition, inserting it if absent. Other
    /// conditions are preserved.
    pub fn set_connected(&mut self, status: ConnectionStatus) {
        let condition = Condition {
            status: status.as_str().to_string(),
            type_: ConnectionStatus::CONDITION_TYPE.to_string(),
            ..Default::default()
        };
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == ConnectionStatus::CONDITION_TYPE)
        {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}
