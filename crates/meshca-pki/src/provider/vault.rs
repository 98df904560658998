//! HashiCorp Vault PKI backend
//!
//! Endpoints used, relative to `{Address}/v1/`:
//! - `sys/mounts[/{path}]` - discover, create and remove PKI engines
//! - `{root}/root/generate/internal` - create the root in the primary
//! - `{root}/root/sign-intermediate` - sign intermediate CSRs
//! - `{root}/root/sign-self-issued` - cross-sign another root
//! - `{intermediate}/intermediate/generate/internal` - intermediate CSR
//! - `{intermediate}/intermediate/set-signed` - install a signed intermediate
//! - `{intermediate}/roles/{role}` and `{intermediate}/sign/{role}` - leaves

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshca_common::config::{
    DEFAULT_INTERMEDIATE_CERT_TTL, DEFAULT_LEAF_CERT_TTL, DEFAULT_ROOT_CERT_TTL,
};
use meshca_common::ProviderKind;
use parking_lot::RwLock;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{Provider, ProviderConfig, RootResult};
use crate::error::{PkiError, Result};
use crate::spiffe::trust_domain_uri;

const KIND: ProviderKind = ProviderKind::Vault;

/// Role used to sign leaf certificates
const LEAF_ROLE: &str = "leaf-cert";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Vault response envelope
#[derive(Debug, Deserialize)]
struct VaultResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct CertificateData {
    #[serde(default)]
    certificate: String,
}

#[derive(Debug, Deserialize)]
struct CsrData {
    csr: String,
}

#[derive(Debug, Default, Deserialize)]
struct VaultErrors {
    #[serde(default)]
    errors: Vec<String>,
}

/// CA backend delegating to Vault's PKI secrets engine
#[derive(Default)]
pub struct VaultProvider {
    inner: RwLock<Option<Arc<VaultClient>>>,
}

#[derive(Debug)]
struct VaultClient {
    http: Client,
    address: String,
    token: String,
    root_path: String,
    intermediate_path: String,
    cluster_id: String,
    datacenter: String,
    is_primary: bool,
    leaf_ttl: Duration,
    intermediate_ttl: Duration,
    root_ttl: Duration,
}

/// Strip surrounding slashes from a mount path
fn normalize_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn ttl_string(ttl: Duration) -> String {
    format!("{}s", ttl.as_secs())
}

impl VaultClient {
    fn from_config(config: &ProviderConfig) -> Result<Self> {
        let required = |key: &str| {
            config
                .setting_str(key)
                .map(str::to_string)
                .ok_or_else(|| PkiError::invalid_config(KIND, format!("{key} is required")))
        };

        let address = required("Address")?;
        let token = required("Token")?;
        let root_path = normalize_path(&required("RootPKIPath")?);
        let intermediate_path = normalize_path(&required("IntermediatePKIPath")?);
        if root_path.is_empty() || intermediate_path.is_empty() {
            return Err(PkiError::invalid_config(KIND, "PKI paths must not be empty"));
        }
        if root_path == intermediate_path {
            return Err(PkiError::invalid_config(
                KIND,
                "RootPKIPath and IntermediatePKIPath must differ",
            ));
        }

        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| PkiError::invalid_config(KIND, format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            address: address.trim_end_matches('/').to_string(),
            token,
            root_path,
            intermediate_path,
            cluster_id: config.cluster_id.clone(),
            datacenter: config.datacenter.clone(),
            is_primary: config.is_primary,
            leaf_ttl: config.setting_duration(KIND, "LeafCertTTL", DEFAULT_LEAF_CERT_TTL)?,
            intermediate_ttl: config.setting_duration(
                KIND,
                "IntermediateCertTTL",
                DEFAULT_INTERMEDIATE_CERT_TTL,
            )?,
            root_ttl: DEFAULT_ROOT_CERT_TTL,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address, path)
    }

    /// Send a request, returning the body of a successful response if any
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Option<String>> {
        let mut request = self
            .http
            .request(method, self.url(path))
            .header("X-Vault-Token", &self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PkiError::backend(KIND, format!("request to {path} failed: {e}")))?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let text = response
            .text()
            .await
            .map_err(|e| PkiError::backend(KIND, format!("reading {path} response: {e}")))?;

        if !status.is_success() {
            let errors: VaultErrors = serde_json::from_str(&text).unwrap_or_default();
            let detail = if errors.errors.is_empty() {
                text
            } else {
                errors.errors.join("; ")
            };
            return Err(PkiError::backend(KIND, format!("{path}: {status}: {detail}")));
        }
        Ok(Some(text).filter(|t| !t.is_empty()))
    }

    async fn read_data<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let text = self
            .call(method, path, body)
            .await?
            .ok_or_else(|| PkiError::backend(KIND, format!("{path}: empty response")))?;
        let response: VaultResponse<T> = serde_json::from_str(&text)
            .map_err(|e| PkiError::backend(KIND, format!("{path}: unexpected response: {e}")))?;
        Ok(response.data)
    }

    async fn write(&self, path: &str, body: Value) -> Result<()> {
        self.call(Method::POST, path, Some(body)).await.map(|_| ())
    }

    /// Mount a PKI engine at `path` unless one is already there
    async fn ensure_mount(&self, path: &str, max_ttl: Duration) -> Result<()> {
        let mounts: Value = match self.call(Method::GET, "sys/mounts", None).await? {
            Some(text) => serde_json::from_str(&text)
                .map_err(|e| PkiError::backend(KIND, format!("sys/mounts: {e}")))?,
            None => Value::Null,
        };
        let key = format!("{path}/");
        let mounted = mounts.get(&key).is_some()
            || mounts.get("data").and_then(|d| d.get(&key)).is_some();
        if mounted {
            return Ok(());
        }

        self.write(
            &format!("sys/mounts/{path}"),
            json!({
                "type": "pki",
                "description": format!("meshca {} CA", self.datacenter),
                "config": { "max_lease_ttl": ttl_string(max_ttl) },
            }),
        )
        .await?;
        info!(path, "mounted PKI engine");
        Ok(())
    }

    /// Certificate currently configured as the CA of a mount, if any
    async fn mount_ca(&self, path: &str) -> Result<Option<String>> {
        let data: CertificateData = self
            .read_data(Method::GET, &format!("{path}/cert/ca"), None)
            .await?;
        Ok(Some(data.certificate).filter(|c| !c.trim().is_empty()))
    }

    async fn ensure_leaf_role(&self) -> Result<()> {
        self.write(
            &format!("{}/roles/{LEAF_ROLE}", self.intermediate_path),
            json!({
                "allow_any_name": true,
                "allowed_uri_sans": format!("{}/*", trust_domain_uri(&self.cluster_id)),
                "enforce_hostnames": false,
                "require_cn": false,
                "key_type": "any",
                "max_ttl": ttl_string(self.leaf_ttl),
                "no_store": true,
                "client_flag": true,
                "server_flag": true,
            }),
        )
        .await
    }

    fn require_primary(&self, operation: &'static str) -> Result<()> {
        if self.is_primary {
            Ok(())
        } else {
            Err(PkiError::Unsupported {
                provider: KIND,
                operation,
            })
        }
    }
}

impl VaultProvider {
    /// Create an unconfigured provider
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<Arc<VaultClient>> {
        self.inner.read().clone().ok_or(PkiError::CaNotInitialized)
    }
}

#[async_trait]
impl Provider for VaultProvider {
    async fn configure(&self, config: &ProviderConfig) -> Result<()> {
        let client = VaultClient::from_config(config)?;
        debug!(
            address = %client.address,
            root_path = %client.root_path,
            intermediate_path = %client.intermediate_path,
            "configured vault provider"
        );
        *self.inner.write() = Some(Arc::new(client));
        Ok(())
    }

    async fn generate_root(&self) -> Result<RootResult> {
        let client = self.client()?;
        client.require_primary("generate_root")?;
        client.ensure_mount(&client.root_path, client.root_ttl).await?;

        if let Some(root_cert) = client.mount_ca(&client.root_path).await? {
            return Ok(RootResult { root_cert });
        }

        let data: CertificateData = client
            .read_data(
                Method::POST,
                &format!("{}/root/generate/internal", client.root_path),
                Some(json!({
                    "common_name": format!("meshca Root CA {}", client.cluster_id),
                    "uri_sans": trust_domain_uri(&client.cluster_id),
                    "ttl": ttl_string(client.root_ttl),
                    "key_type": "ec",
                    "key_bits": 256,
                })),
            )
            .await?;
        info!(path = %client.root_path, "generated new root CA in vault");
        Ok(RootResult {
            root_cert: data.certificate,
        })
    }

    async fn generate_intermediate_csr(&self) -> Result<String> {
        let client = self.client()?;
        client
            .ensure_mount(&client.intermediate_path, client.intermediate_ttl)
            .await?;

        let data: CsrData = client
            .read_data(
                Method::POST,
                &format!("{}/intermediate/generate/internal", client.intermediate_path),
                Some(json!({
                    "common_name": format!("meshca Intermediate CA {}", client.datacenter),
                    "uri_sans": trust_domain_uri(&client.cluster_id),
                    "key_type": "ec",
                    "key_bits": 256,
                })),
            )
            .await?;
        client.ensure_leaf_role().await?;
        Ok(data.csr)
    }

    async fn set_intermediate(&self, intermediate_pem: &str, root_pem: &str) -> Result<()> {
        let client = self.client()?;
        if !crate::cert::verify_signed_by(intermediate_pem, root_pem)? {
            return Err(PkiError::backend(
                KIND,
                "intermediate certificate is not signed by the given root",
            ));
        }
        client
            .write(
                &format!("{}/intermediate/set-signed", client.intermediate_path),
                json!({ "certificate": intermediate_pem }),
            )
            .await?;
        debug!(path = %client.intermediate_path, "installed intermediate certificate");
        Ok(())
    }

    async fn active_intermediate(&self) -> Result<String> {
        let client = self.client()?;
        if let Some(cert) = client.mount_ca(&client.intermediate_path).await? {
            return Ok(cert);
        }
        if client.is_primary {
            if let Some(root) = client.mount_ca(&client.root_path).await? {
                return Ok(root);
            }
        }
        Err(PkiError::CaNotInitialized)
    }

    async fn generate_intermediate(&self) -> Result<String> {
        let client = self.client()?;
        client.require_primary("generate_intermediate")?;

        let csr = self.generate_intermediate_csr().await?;
        let intermediate = self.sign_intermediate(&csr).await?;
        let root = client
            .mount_ca(&client.root_path)
            .await?
            .ok_or(PkiError::CaNotInitialized)?;
        self.set_intermediate(&intermediate, &root).await?;
        info!(path = %client.intermediate_path, "generated new intermediate in vault");
        Ok(intermediate)
    }

    async fn sign(&self, csr_pem: &str) -> Result<String> {
        let client = self.client()?;
        let data: CertificateData = client
            .read_data(
                Method::POST,
                &format!("{}/sign/{LEAF_ROLE}", client.intermediate_path),
                Some(json!({
                    "csr": csr_pem,
                    "ttl": ttl_string(client.leaf_ttl),
                })),
            )
            .await?;
        Ok(data.certificate)
    }

    async fn sign_intermediate(&self, csr_pem: &str) -> Result<String> {
        let client = self.client()?;
        client.require_primary("sign_intermediate")?;
        let data: CertificateData = client
            .read_data(
                Method::POST,
                &format!("{}/root/sign-intermediate", client.root_path),
                Some(json!({
                    "csr": csr_pem,
                    "use_csr_values": true,
                    "format": "pem",
                    "max_path_length": 0,
                    "ttl": ttl_string(client.intermediate_ttl),
                })),
            )
            .await?;
        Ok(data.certificate)
    }

    async fn cross_sign_ca(&self, cert_pem: &str) -> Result<String> {
        let client = self.client()?;
        client.require_primary("cross_sign_ca")?;
        let data: CertificateData = client
            .read_data(
                Method::POST,
                &format!("{}/root/sign-self-issued", client.root_path),
                Some(json!({ "certificate": cert_pem })),
            )
            .await?;
        Ok(data.certificate)
    }

    fn supports_cross_signing(&self) -> bool {
        true
    }

    // Leaves come from the intermediate mount's role, never the root mount
    fn primary_uses_intermediate(&self) -> bool {
        true
    }

    async fn state(&self) -> Result<BTreeMap<String, String>> {
        let client = self.client()?;
        Ok(BTreeMap::from([
            ("root_pki_path".to_string(), client.root_path.clone()),
            (
                "intermediate_pki_path".to_string(),
                client.intermediate_path.clone(),
            ),
        ]))
    }

    async fn cleanup(
        &self,
        provider_type_changed: bool,
        other_config: &BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        let client = self.client()?;
        // A new Vault configuration pointing at the same mount still needs it
        let still_used = !provider_type_changed
            && other_config
                .get("IntermediatePKIPath")
                .and_then(Value::as_str)
                .map(normalize_path)
                .is_some_and(|p| p == client.intermediate_path);
        if still_used {
            return Ok(());
        }

        match client
            .call(
                Method::DELETE,
                &format!("sys/mounts/{}", client.intermediate_path),
                None,
            )
            .await
        {
            Ok(_) => {
                info!(path = %client.intermediate_path, "unmounted intermediate PKI engine");
                Ok(())
            }
            Err(e) => {
                warn!(path = %client.intermediate_path, error = %e, "failed to unmount intermediate PKI engine");
                Err(e)
            }
        }
    }
}
