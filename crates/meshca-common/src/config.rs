//! Lifecycle manager configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::CaConfiguration;

/// Default safety margin applied to validity checks
pub const DEFAULT_DRIFT_BUFFER: Duration = Duration::from_secs(60);

/// Fraction of an intermediate's lifetime after which it is renewed
pub const DEFAULT_RENEW_FRACTION: f64 = 0.5;

/// How often the renewal scheduler checks the active intermediate
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default leaf certificate lifetime (72h)
pub const DEFAULT_LEAF_CERT_TTL: Duration = Duration::from_secs(72 * 60 * 60);

/// Default intermediate certificate lifetime (one year)
pub const DEFAULT_INTERMEDIATE_CERT_TTL: Duration = Duration::from_secs(8760 * 60 * 60);

/// Default root certificate lifetime (ten years)
pub const DEFAULT_ROOT_CERT_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Invalid manager configuration
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A required field is empty
    #[error("{0} must not be empty")]
    Missing(&'static str),

    /// A field is outside its allowed range
    #[error("{field} is out of range: {reason}")]
    OutOfRange {
        /// Field name
        field: &'static str,
        /// What was wrong
        reason: String,
    },
}

/// Settings for one lifecycle manager instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfig {
    /// Datacenter this manager runs in
    pub datacenter: String,
    /// Datacenter that owns root generation
    pub primary_datacenter: String,
    /// Cluster id used when bootstrapping a fresh store
    pub cluster_id: String,
    /// Clock skew tolerance for validity checks
    #[serde(with = "duration_secs")]
    pub drift_buffer: Duration,
    /// Fraction of a signing certificate's lifetime after which it is renewed
    pub renew_fraction: f64,
    /// Renewal scheduler tick interval
    #[serde(with = "duration_secs")]
    pub renew_interval: Duration,
    /// Leaf certificate lifetime handed to backends
    #[serde(with = "duration_secs")]
    pub leaf_cert_ttl: Duration,
    /// Intermediate certificate lifetime handed to backends
    #[serde(with = "duration_secs")]
    pub intermediate_cert_ttl: Duration,
    /// Root certificate lifetime handed to backends
    #[serde(with = "duration_secs")]
    pub root_cert_ttl: Duration,
    /// CA configuration written when the store has none yet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<CaConfiguration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            datacenter: "dc1".to_string(),
            primary_datacenter: "dc1".to_string(),
            cluster_id: String::new(),
            drift_buffer: DEFAULT_DRIFT_BUFFER,
            renew_fraction: DEFAULT_RENEW_FRACTION,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            leaf_cert_ttl: DEFAULT_LEAF_CERT_TTL,
            intermediate_cert_ttl: DEFAULT_INTERMEDIATE_CERT_TTL,
            root_cert_ttl: DEFAULT_ROOT_CERT_TTL,
            bootstrap: None,
        }
    }
}

impl ManagerConfig {
    /// Configuration for a manager in `datacenter` whose primary is `primary`
    pub fn new(datacenter: impl Into<String>, primary: impl Into<String>) -> Self {
        Self {
            datacenter: datacenter.into(),
            primary_datacenter: primary.into(),
            ..Default::default()
        }
    }

    /// Whether this manager runs in the primary datacenter
    pub fn is_primary(&self) -> bool {
        self.datacenter == self.primary_datacenter
    }

    /// Check required fields and ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.datacenter.is_empty() {
            return Err(ConfigError::Missing("datacenter"));
        }
        if self.primary_datacenter.is_empty() {
            return Err(ConfigError::Missing("primaryDatacenter"));
        }
        if !(self.renew_fraction > 0.0 && self.renew_fraction < 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "renewFraction",
                reason: format!("{} is not between 0 and 1", self.renew_fraction),
            });
        }
        if self.renew_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "renewInterval",
                reason: "must be positive".to_string(),
            });
        }
        for (field, ttl) in [
            ("leafCertTtl", self.leaf_cert_ttl),
            ("intermediateCertTtl", self.intermediate_cert_ttl),
            ("rootCertTtl", self.root_cert_ttl),
        ] {
            if ttl.is_zero() {
                return Err(ConfigError::OutOfRange {
                    field,
                    reason: "must be positive".to_string(),
                });
            }
        }
        if self.leaf_cert_ttl > self.intermediate_cert_ttl {
            return Err(ConfigError::OutOfRange {
                field: "leafCertTtl",
                reason: "must not exceed intermediateCertTtl".to_string(),
            });
        }
        Ok(())
    }
}

/// Serde adapter storing a [`Duration`] as whole seconds
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as seconds
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    /// Deserialize from seconds
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
