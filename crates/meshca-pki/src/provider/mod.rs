//! CA provider abstraction layer
//!
//! A provider is the backend that holds key material and issues
//! certificates. The lifecycle manager drives exactly one provider instance
//! at a time through the [`Provider`] trait and never looks inside it; the
//! only thing it keeps on the provider's behalf is the opaque map returned by
//! [`Provider::state`].
//!
//! # Supported Providers
//!
//! - [`LocalProvider`] - in-process self-signed CA built on rcgen
//! - [`VaultProvider`] - HashiCorp Vault PKI secrets engine over HTTP
//!
//! # Call order
//!
//! `configure` must come first. A primary datacenter then calls
//! `generate_root` and optionally `generate_intermediate`; a secondary calls
//! `generate_intermediate_csr`, has the CSR signed by the primary's
//! `sign_intermediate`, and installs the result with `set_intermediate`.

mod local;
mod vault;

pub use local::LocalProvider;
pub use vault::VaultProvider;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshca_common::ProviderKind;
#[cfg(test)]
use mockall::automock;

use crate::error::{PkiError, Result};

/// Everything a provider needs to configure itself
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProviderConfig {
    /// Cluster id; the trust domain of issued certificates
    pub cluster_id: String,
    /// Datacenter the provider runs in
    pub datacenter: String,
    /// Whether this datacenter owns root generation
    pub is_primary: bool,
    /// Backend-specific settings from the CA configuration
    pub raw: BTreeMap<String, serde_json::Value>,
    /// State previously returned by [`Provider::state`]
    pub state: BTreeMap<String, String>,
}

impl ProviderConfig {
    /// Look up a string setting
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }

    /// Look up a duration setting, falling back to `default` when unset
    ///
    /// Accepts a number of seconds or a string such as `"72h"`.
    pub fn setting_duration(
        &self,
        provider: ProviderKind,
        key: &str,
        default: Duration,
    ) -> Result<Duration> {
        match self.raw.get(key) {
            None | Some(serde_json::Value::Null) => Ok(default),
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .map(Duration::from_secs)
                .ok_or_else(|| PkiError::invalid_config(provider, format!("{key} must be positive"))),
            Some(serde_json::Value::String(s)) => parse_ttl(s).ok_or_else(|| {
                PkiError::invalid_config(provider, format!("{key}: invalid duration '{s}'"))
            }),
            Some(other) => Err(PkiError::invalid_config(
                provider,
                format!("{key}: expected a duration, got {other}"),
            )),
        }
    }
}

/// Parse a TTL such as `"72h"`, `"30m"`, `"45s"`, `"7d"` or `"1h30m"`
pub fn parse_ttl(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return None,
        };
        total = total.checked_add(value.checked_mul(unit)?)?;
    }
    if !digits.is_empty() {
        return None;
    }
    Some(Duration::from_secs(total))
}

/// Result of root generation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootResult {
    /// PEM-encoded root certificate
    pub root_cert: String,
}

/// A CA backend
///
/// # Implementing a Provider
///
/// ```text
/// #[async_trait]
/// impl Provider for MyProvider {
///     async fn configure(&self, config: &ProviderConfig) -> Result<()> { ... }
///     async fn generate_root(&self) -> Result<RootResult> { ... }
///     // ...
/// }
/// ```
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Apply configuration; idempotent, must precede every other call
    async fn configure(&self, config: &ProviderConfig) -> Result<()>;

    /// Create (or return the existing) root; primary datacenter only
    async fn generate_root(&self) -> Result<RootResult>;

    /// CSR for a new intermediate key held privately by the backend
    async fn generate_intermediate_csr(&self) -> Result<String>;

    /// Install an externally signed intermediate and its root
    async fn set_intermediate(&self, intermediate_pem: &str, root_pem: &str) -> Result<()>;

    /// Certificate currently signing leaves; the root if no intermediate is set
    async fn active_intermediate(&self) -> Result<String>;

    /// Issue a new intermediate directly from the local root
    async fn generate_intermediate(&self) -> Result<String>;

    /// Sign a leaf CSR
    async fn sign(&self, csr_pem: &str) -> Result<String>;

    /// Sign an intermediate CSR from another datacenter
    async fn sign_intermediate(&self, csr_pem: &str) -> Result<String>;

    /// Sign another CA certificate with the current root
    async fn cross_sign_ca(&self, cert_pem: &str) -> Result<String>;

    /// Whether [`Provider::cross_sign_ca`] is available
    fn supports_cross_signing(&self) -> bool;

    /// Whether a primary signs leaves through an intermediate rather than
    /// the root, and so needs [`Provider::generate_intermediate`] before it
    /// can sign
    fn primary_uses_intermediate(&self) -> bool;

    /// Backend state to persist across restarts
    async fn state(&self) -> Result<BTreeMap<String, String>>;

    /// Release backend resources when the manager drops this instance
    async fn cleanup(
        &self,
        provider_type_changed: bool,
        other_config: &BTreeMap<String, serde_json::Value>,
    ) -> Result<()>;
}

/// Create a provider instance for the given kind
pub fn create_provider(kind: ProviderKind) -> Box<dyn Provider> {
    match kind {
        ProviderKind::Local => Box::new(LocalProvider::new()),
        ProviderKind::Vault => Box::new(VaultProvider::new()),
    }
}

/// Source of provider instances for the lifecycle manager
#[cfg_attr(test, automock)]
pub trait ProviderFactory: Send + Sync {
    /// Create an unconfigured provider
    fn create(&self, kind: ProviderKind) -> Arc<dyn Provider>;
}

/// Factory backed by [`create_provider`]
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn create(&self, kind: ProviderKind) -> Arc<dyn Provider> {
        Arc::from(create_provider(kind))
    }
}
