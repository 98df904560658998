//! In-process CA backend
//!
//! Keys live in memory as PEM and are exported through [`Provider::state`]
//! so a restarted manager gets the same root back. Certificates are
//! back-dated by a minute for clock skew and never outlive their issuer.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use meshca_common::config::{
    DEFAULT_INTERMEDIATE_CERT_TTL, DEFAULT_LEAF_CERT_TTL, DEFAULT_ROOT_CERT_TTL,
};
use meshca_common::ProviderKind;
use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType, SerialNumber,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use super::{Provider, ProviderConfig, RootResult};
use crate::cert::{
    ca_params_from_pem, distinguished_name, uri_san, verify_signed_by, CertificateInfo,
    CertificatePublicKey, CertificateRequest,
};
use crate::error::{PkiError, Result};
use crate::spiffe::trust_domain_uri;

const KIND: ProviderKind = ProviderKind::Local;

/// Skew allowance applied to every `NotBefore`
const BACKDATE: Duration = Duration::from_secs(60);

const STATE_ROOT_KEY: &str = "root_key";
const STATE_ROOT_CERT: &str = "root_cert";
const STATE_INTERMEDIATE_KEY: &str = "intermediate_key";
const STATE_INTERMEDIATE_CERT: &str = "intermediate_cert";
const STATE_PENDING_KEY: &str = "pending_key";
const STATE_UPSTREAM_ROOT: &str = "upstream_root";
const STATE_SERIAL: &str = "serial";

/// Self-signed CA backed by rcgen
#[derive(Default)]
pub struct LocalProvider {
    inner: RwLock<Option<LocalState>>,
}

struct LocalState {
    cluster_id: String,
    datacenter: String,
    is_primary: bool,
    leaf_ttl: Duration,
    intermediate_ttl: Duration,
    root_ttl: Duration,
    material: Material,
}

#[derive(Clone, Default)]
struct Material {
    root: Option<KeyedCert>,
    intermediate: Option<KeyedCert>,
    /// Key behind the outstanding intermediate CSR
    pending_key: Option<String>,
    /// Root handed to `set_intermediate` in a secondary datacenter
    upstream_root: Option<String>,
    serial: u64,
}

#[derive(Clone)]
struct KeyedCert {
    key_pem: String,
    cert_pem: String,
}

impl KeyedCert {
    fn key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    fn not_after(&self) -> Result<OffsetDateTime> {
        Ok(CertificateInfo::from_pem(&self.cert_pem)?.not_after_time())
    }

    /// Sign `params` for `subject` with this certificate's key
    fn issue(&self, params: &CertificateParams, subject: &impl PublicKeyData) -> Result<String> {
        let key = self.key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let cert = params.signed_by(subject, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;
        Ok(cert.pem())
    }

    fn issue_csr(&self, csr: &CertificateSigningRequestParams) -> Result<String> {
        let key = self.key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let cert = csr.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;
        Ok(cert.pem())
    }
}

impl Material {
    fn from_state(state: &BTreeMap<String, String>) -> Result<Self> {
        let pair = |key: &str, cert: &str| match (state.get(key), state.get(cert)) {
            (Some(key_pem), Some(cert_pem)) => Some(KeyedCert {
                key_pem: key_pem.clone(),
                cert_pem: cert_pem.clone(),
            }),
            _ => None,
        };

        let serial = match state.get(STATE_SERIAL) {
            Some(s) => s.parse().map_err(|_| {
                PkiError::invalid_config(KIND, format!("stored serial '{}' is not a number", s))
            })?,
            None => 0,
        };

        Ok(Self {
            root: pair(STATE_ROOT_KEY, STATE_ROOT_CERT),
            intermediate: pair(STATE_INTERMEDIATE_KEY, STATE_INTERMEDIATE_CERT),
            pending_key: state.get(STATE_PENDING_KEY).cloned(),
            upstream_root: state.get(STATE_UPSTREAM_ROOT).cloned(),
            serial,
        })
    }

    fn to_state(&self) -> BTreeMap<String, String> {
        let mut state = BTreeMap::new();
        if let Some(root) = &self.root {
            state.insert(STATE_ROOT_KEY.to_string(), root.key_pem.clone());
            state.insert(STATE_ROOT_CERT.to_string(), root.cert_pem.clone());
        }
        if let Some(inter) = &self.intermediate {
            state.insert(STATE_INTERMEDIATE_KEY.to_string(), inter.key_pem.clone());
            state.insert(STATE_INTERMEDIATE_CERT.to_string(), inter.cert_pem.clone());
        }
        if let Some(key) = &self.pending_key {
            state.insert(STATE_PENDING_KEY.to_string(), key.clone());
        }
        if let Some(root) = &self.upstream_root {
            state.insert(STATE_UPSTREAM_ROOT.to_string(), root.clone());
        }
        state.insert(STATE_SERIAL.to_string(), self.serial.to_string());
        state
    }

    fn next_serial(&mut self) -> SerialNumber {
        self.serial += 1;
        SerialNumber::from(self.serial)
    }
}

impl LocalState {
    fn trust_domain_san(&self) -> Result<SanType> {
        uri_san(&trust_domain_uri(&self.cluster_id))
    }

    fn root(&self, operation: &'static str) -> Result<&KeyedCert> {
        if !self.is_primary {
            return Err(PkiError::Unsupported {
                provider: KIND,
                operation,
            });
        }
        self.material.root.as_ref().ok_or(PkiError::CaNotInitialized)
    }

    fn ca_params(&mut self, common_name: &str, path_len: Option<u8>) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.subject_alt_names = vec![self.trust_domain_san()?];
        params.is_ca = match path_len {
            Some(len) => IsCa::Ca(BasicConstraints::Constrained(len)),
            None => IsCa::Ca(BasicConstraints::Unconstrained),
        };
        params.key_usages = ca_key_usages();
        params.serial_number = Some(self.material.next_serial());
        Ok(params)
    }
}

fn ca_key_usages() -> Vec<KeyUsagePurpose> {
    vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ]
}

/// `(not_before, not_after)` for a certificate issued now, capped at `cap`
fn validity(ttl: Duration, cap: Option<OffsetDateTime>) -> (OffsetDateTime, OffsetDateTime) {
    let now = OffsetDateTime::now_utc();
    let not_after = now + ttl;
    let not_after = match cap {
        Some(cap) if cap < not_after => cap,
        _ => not_after,
    };
    (now - BACKDATE, not_after)
}

fn generate_key() -> Result<KeyPair> {
    KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e)))
}

fn parse_csr(csr_pem: &str) -> Result<CertificateSigningRequestParams> {
    CertificateSigningRequestParams::from_pem(csr_pem)
        .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))
}

/// Root key and certificate supplied through configuration
fn imported_root(config: &ProviderConfig) -> Result<Option<KeyedCert>> {
    let (key_pem, cert_pem) = match (config.setting_str("PrivateKey"), config.setting_str("RootCert")) {
        (Some(key), Some(cert)) => (key, cert),
        (None, None) => return Ok(None),
        _ => {
            return Err(PkiError::invalid_config(
                KIND,
                "PrivateKey and RootCert must be set together",
            ))
        }
    };
    if !config.is_primary {
        return Err(PkiError::invalid_config(
            KIND,
            "a root can only be imported in the primary datacenter",
        ));
    }

    let key = KeyPair::from_pem(key_pem)
        .map_err(|e| PkiError::invalid_config(KIND, format!("PrivateKey: {}", e)))?;
    let public = CertificatePublicKey::from_pem(cert_pem)?;
    if public.der_bytes() != key.public_key_raw() {
        return Err(PkiError::invalid_config(
            KIND,
            "RootCert does not match PrivateKey",
        ));
    }

    Ok(Some(KeyedCert {
        key_pem: key_pem.to_string(),
        cert_pem: cert_pem.to_string(),
    }))
}

impl LocalProvider {
    /// Create an unconfigured provider
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LocalState) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.write();
        let state = guard.as_mut().ok_or(PkiError::CaNotInitialized)?;
        f(state)
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn configure(&self, config: &ProviderConfig) -> Result<()> {
        if config.cluster_id.is_empty() {
            return Err(PkiError::invalid_config(KIND, "cluster id is required"));
        }

        let mut material = Material::from_state(&config.state)?;
        if let Some(imported) = imported_root(config)? {
            let unchanged = material
                .root
                .as_ref()
                .is_some_and(|r| r.cert_pem == imported.cert_pem);
            if !unchanged {
                debug!(datacenter = %config.datacenter, "using configured root key");
                material.root = Some(imported);
                material.intermediate = None;
            }
        }

        let state = LocalState {
            cluster_id: config.cluster_id.clone(),
            datacenter: config.datacenter.clone(),
            is_primary: config.is_primary,
            leaf_ttl: config.setting_duration(KIND, "LeafCertTTL", DEFAULT_LEAF_CERT_TTL)?,
            intermediate_ttl: config.setting_duration(
                KIND,
                "IntermediateCertTTL",
                DEFAULT_INTERMEDIATE_CERT_TTL,
            )?,
            root_ttl: config.setting_duration(KIND, "RootCertTTL", DEFAULT_ROOT_CERT_TTL)?,
            material,
        };
        *self.inner.write() = Some(state);
        Ok(())
    }

    async fn generate_root(&self) -> Result<RootResult> {
        self.with_state(|state| {
            if !state.is_primary {
                return Err(PkiError::Unsupported {
                    provider: KIND,
                    operation: "generate_root",
                });
            }
            if let Some(root) = &state.material.root {
                return Ok(RootResult {
                    root_cert: root.cert_pem.clone(),
                });
            }

            let serial = state.material.serial + 1;
            let mut params = state.ca_params(&format!("meshca CA {}", serial), None)?;
            let (not_before, not_after) = validity(state.root_ttl, None);
            params.not_before = not_before;
            params.not_after = not_after;

            let key = generate_key()?;
            let cert = params.self_signed(&key).map_err(|e| {
                PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
            })?;

            let root = KeyedCert {
                key_pem: key.serialize_pem(),
                cert_pem: cert.pem(),
            };
            info!(datacenter = %state.datacenter, "generated new root CA");
            let root_cert = root.cert_pem.clone();
            state.material.root = Some(root);
            Ok(RootResult { root_cert })
        })
    }

    async fn generate_intermediate_csr(&self) -> Result<String> {
        self.with_state(|state| {
            let request = CertificateRequest::new(
                &format!("meshca Intermediate CA {}", state.datacenter),
                Some(&trust_domain_uri(&state.cluster_id)),
            )?;
            state.material.pending_key = Some(request.private_key_pem().to_string());
            debug!(datacenter = %state.datacenter, "generated intermediate CSR");
            Ok(request.csr_pem().to_string())
        })
    }

    async fn set_intermediate(&self, intermediate_pem: &str, root_pem: &str) -> Result<()> {
        self.with_state(|state| {
            let pending = state
                .material
                .pending_key
                .clone()
                .ok_or_else(|| PkiError::backend(KIND, "no intermediate CSR is pending"))?;

            let key = KeyPair::from_pem(&pending)
                .map_err(|e| PkiError::ParseError(format!("failed to load pending key: {}", e)))?;
            let public = CertificatePublicKey::from_pem(intermediate_pem)?;
            if public.der_bytes() != key.public_key_raw() {
                return Err(PkiError::backend(
                    KIND,
                    "intermediate certificate does not match the pending CSR key",
                ));
            }
            if !verify_signed_by(intermediate_pem, root_pem)? {
                return Err(PkiError::backend(
                    KIND,
                    "intermediate certificate is not signed by the given root",
                ));
            }

            state.material.intermediate = Some(KeyedCert {
                key_pem: pending,
                cert_pem: intermediate_pem.to_string(),
            });
            state.material.upstream_root = Some(root_pem.to_string());
            state.material.pending_key = None;
            debug!(datacenter = %state.datacenter, "installed intermediate certificate");
            Ok(())
        })
    }

    async fn active_intermediate(&self) -> Result<String> {
        let guard = self.inner.read();
        let state = guard.as_ref().ok_or(PkiError::CaNotInitialized)?;
        state
            .material
            .intermediate
            .as_ref()
            .or(state.material.root.as_ref())
            .map(|c| c.cert_pem.clone())
            .ok_or(PkiError::CaNotInitialized)
    }

    async fn generate_intermediate(&self) -> Result<String> {
        self.with_state(|state| {
            let root = state.root("generate_intermediate")?.clone();
            let mut params = state.ca_params(
                &format!("meshca Intermediate CA {}", state.datacenter),
                Some(0),
            )?;
            let (not_before, not_after) = validity(state.intermediate_ttl, Some(root.not_after()?));
            params.not_before = not_before;
            params.not_after = not_after;

            let key = generate_key()?;
            let cert_pem = root.issue(&params, &key)?;

            state.material.intermediate = Some(KeyedCert {
                key_pem: key.serialize_pem(),
                cert_pem: cert_pem.clone(),
            });
            info!(datacenter = %state.datacenter, "generated new intermediate from local root");
            Ok(cert_pem)
        })
    }

    async fn sign(&self, csr_pem: &str) -> Result<String> {
        let mut csr = parse_csr(csr_pem)?;
        let has_uri = csr
            .params
            .subject_alt_names
            .iter()
            .any(|san| matches!(san, SanType::URI(_)));
        if !has_uri {
            return Err(PkiError::InvalidCsr(
                "CSR must carry a SPIFFE URI SAN".to_string(),
            ));
        }

        let (signer, leaf_ttl) = {
            let guard = self.inner.read();
            let state = guard.as_ref().ok_or(PkiError::CaNotInitialized)?;
            let signer = state
                .material
                .intermediate
                .as_ref()
                .or(state.material.root.as_ref())
                .cloned()
                .ok_or(PkiError::CaNotInitialized)?;
            (signer, state.leaf_ttl)
        };

        csr.params.is_ca = IsCa::NoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        let (not_before, not_after) = validity(leaf_ttl, Some(signer.not_after()?));
        csr.params.not_before = not_before;
        csr.params.not_after = not_after;

        signer.issue_csr(&csr)
    }

    async fn sign_intermediate(&self, csr_pem: &str) -> Result<String> {
        let mut csr = parse_csr(csr_pem)?;
        self.with_state(|state| {
            let root = state.root("sign_intermediate")?.clone();
            csr.params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
            csr.params.key_usages = ca_key_usages();
            csr.params.serial_number = Some(state.material.next_serial());
            let (not_before, not_after) = validity(state.intermediate_ttl, Some(root.not_after()?));
            csr.params.not_before = not_before;
            csr.params.not_after = not_after;

            let cert = root.issue_csr(&csr)?;
            info!(datacenter = %state.datacenter, "signed intermediate for another datacenter");
            Ok(cert)
        })
    }

    async fn cross_sign_ca(&self, cert_pem: &str) -> Result<String> {
        let public = CertificatePublicKey::from_pem(cert_pem)?;
        let mut params = ca_params_from_pem(cert_pem)?;
        params.key_usages = ca_key_usages();

        self.with_state(|state| {
            let root = state.root("cross_sign_ca")?.clone();
            let root_not_after = root.not_after()?;
            if params.not_after > root_not_after {
                params.not_after = root_not_after;
            }
            params.serial_number = Some(state.material.next_serial());

            let cert = root.issue(&params, &public)?;
            info!(datacenter = %state.datacenter, "cross-signed incoming root");
            Ok(cert)
        })
    }

    fn supports_cross_signing(&self) -> bool {
        true
    }

    fn primary_uses_intermediate(&self) -> bool {
        false
    }

    async fn state(&self) -> Result<BTreeMap<String, String>> {
        let guard = self.inner.read();
        let state = guard.as_ref().ok_or(PkiError::CaNotInitialized)?;
        Ok(state.material.to_state())
    }

    async fn cleanup(
        &self,
        provider_type_changed: bool,
        _other_config: &BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        debug!(provider_type_changed, "local provider released");
        Ok(())
    }
}
