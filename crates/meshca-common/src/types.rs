//! Durable CA data model
//!
//! These records are what the CA store persists. The lifecycle manager reads
//! and replaces them as whole values; nothing here is partially updated.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// CA backend implementation selected by a [`CaConfiguration`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process self-signed CA
    #[default]
    Local,
    /// HashiCorp Vault PKI secrets engine
    Vault,
}

impl ProviderKind {
    /// Stable lowercase name, used in provider state ids and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Vault => "vault",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster-wide CA configuration
///
/// `modify_index` is assigned by the store on every successful write and is
/// the compare-and-set token for the next one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaConfiguration {
    /// Cluster identifier; also the SPIFFE trust domain
    pub cluster_id: String,
    /// Selected backend
    pub provider: ProviderKind,
    /// Backend-specific settings, opaque to the manager
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    /// Allow a root rotation even when the outgoing backend cannot cross-sign
    #[serde(default)]
    pub force_without_cross_signing: bool,
    /// Store index of the write that produced this configuration
    #[serde(default)]
    pub modify_index: u64,
}

impl CaConfiguration {
    /// Create a configuration for the given cluster and backend
    pub fn new(cluster_id: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            provider,
            ..Default::default()
        }
    }

    /// Add a backend-specific setting
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Whether two configurations select the same backend with the same settings
    ///
    /// The store-assigned index is ignored.
    pub fn same_settings(&self, other: &Self) -> bool {
        self.cluster_id == other.cluster_id
            && self.provider == other.provider
            && self.config == other.config
            && self.force_without_cross_signing == other.force_without_cross_signing
    }

    /// Look up a string setting
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

/// One generation of root key material and its leaf-signing chain
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaRoot {
    /// SHA-256 fingerprint of the root certificate, colon-separated hex
    pub id: String,
    /// Human readable name
    pub name: String,
    /// PEM-encoded root certificate
    pub root_cert: String,
    /// Intermediates completing the chain to a leaf, most specific last
    #[serde(default)]
    pub intermediate_certs: Vec<String>,
    /// Subject key id of the certificate that signs leaves
    pub signing_key_id: String,
    /// Trust domain the root was issued for
    pub trust_domain: String,
    /// Root validity start, unix seconds
    pub not_before: i64,
    /// Root validity end, unix seconds
    pub not_after: i64,
    /// Whether this is the root currently used for signing
    pub active: bool,
    /// When the root stopped being active, unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_out_at: Option<i64>,
    /// Store index at which this root was first written
    #[serde(default)]
    pub create_index: u64,
}

impl CaRoot {
    /// Certificate that signs leaves: the last intermediate, or the root itself
    pub fn leaf_signing_cert(&self) -> &str {
        self.intermediate_certs
            .last()
            .map(String::as_str)
            .unwrap_or(&self.root_cert)
    }

    /// Whether leaves are signed directly by the root
    pub fn signs_with_root(&self) -> bool {
        self.intermediate_certs.is_empty()
    }
}

/// Root set as served to other datacenters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedCaRoots {
    /// Id of the active root, empty when none is active
    pub active_root_id: String,
    /// Trust domain of the cluster
    pub trust_domain: String,
    /// Every known root, active or rotated out
    pub roots: Vec<CaRoot>,
    /// Store index the set was read at
    pub index: u64,
}

impl IndexedCaRoots {
    /// The active root, if the set has one
    pub fn active(&self) -> Option<&CaRoot> {
        if self.active_root_id.is_empty() {
            return None;
        }
        self.roots
            .iter()
            .find(|r| r.active && r.id == self.active_root_id)
    }
}

/// Opaque backend state persisted by the manager on the backend's behalf
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderState {
    /// Key the state is stored under, `{provider}/{datacenter}`
    pub id: String,
    /// Backend-defined key/value pairs
    pub state: BTreeMap<String, String>,
}

impl ProviderState {
    /// Store key for a backend running in a datacenter
    pub fn id_for(kind: ProviderKind, datacenter: &str) -> String {
        format!("{kind}/{datacenter}")
    }
}
