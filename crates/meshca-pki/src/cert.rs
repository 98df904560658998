//! Certificate parsing, identity and validity helpers
//!
//! Everything here works on PEM text, which is how certificates travel
//! between backends, the store and other datacenters.
//!
//! # Validity windows
//!
//! All checks take the current time and a drift buffer explicitly. A
//! certificate counts as expired once `now + drift` reaches its `NotAfter`,
//! and is due for renewal once `now + drift` passes `fraction` of its
//! lifetime. A `NotBefore` in the future is never an error.

use std::time::Duration;

use meshca_common::{CaConfiguration, CaRoot};
use ::time::OffsetDateTime;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, KeyPair, PublicKeyData, SanType, SignatureAlgorithm,
};
use sha2::{Digest, Sha256};
use x509_parser::oid_registry::{
    OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION, OID_SIG_ED25519,
};
use x509_parser::prelude::*;

use crate::error::{PkiError, Result};

/// Organization written into every certificate meshca issues
pub const ORGANIZATION: &str = "meshca";

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    Ok(cert)
}

/// Format bytes as lowercase colon-separated hex
pub fn colon_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Validity window of a certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let cert = parse_certificate(der)?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Seconds remaining until expiry at `now`
    pub fn remaining_secs_at(&self, now: OffsetDateTime) -> i64 {
        self.not_after - now.unix_timestamp()
    }

    /// Expiry as a timestamp
    pub fn not_after_time(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.not_after).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Whether the certificate is unusable at `now`, allowing for `drift`
    pub fn is_expired_at(&self, now: OffsetDateTime, drift: Duration) -> bool {
        shifted(now, drift) >= self.not_after
    }

    /// Whether `fraction` of the lifetime has passed at `now`, allowing for `drift`
    ///
    /// A certificate with a non-positive lifetime is always due.
    pub fn needs_renewal_at(&self, now: OffsetDateTime, drift: Duration, fraction: f64) -> bool {
        let lifetime = self.lifetime_secs();
        if lifetime <= 0 {
            return true;
        }
        let threshold = self.not_before + (lifetime as f64 * fraction) as i64;
        shifted(now, drift) >= threshold
    }

    /// Fraction of lifetime elapsed at `now` (0.0 to 1.0+)
    pub fn lifetime_fraction_at(&self, now: OffsetDateTime) -> f64 {
        let lifetime = self.lifetime_secs() as f64;
        let age = (now.unix_timestamp() - self.not_before) as f64;
        age / lifetime
    }
}

/// `now + drift` in unix seconds, clamped instead of overflowing
fn shifted(now: OffsetDateTime, drift: Duration) -> i64 {
    let drift = i64::try_from(drift.as_secs()).unwrap_or(i64::MAX);
    now.unix_timestamp().saturating_add(drift)
}

/// SHA-256 fingerprint of a PEM certificate, colon-separated hex
pub fn fingerprint(cert_pem: &str) -> Result<String> {
    let der = parse_pem(cert_pem)?;
    Ok(colon_hex(&Sha256::digest(&der)))
}

/// Subject key identifier of a PEM certificate, colon-separated hex
///
/// Falls back to a SHA-256 of the subject public key info when the
/// certificate carries no SKI extension.
pub fn signing_key_id(cert_pem: &str) -> Result<String> {
    let der = parse_pem(cert_pem)?;
    let cert = parse_certificate(&der)?;

    for ext in cert.extensions() {
        if let ParsedExtension::SubjectKeyIdentifier(kid) = ext.parsed_extension() {
            return Ok(colon_hex(kid.0));
        }
    }

    Ok(colon_hex(&Sha256::digest(cert.public_key().raw)))
}

/// Check that `cert_pem` carries a valid signature from `issuer_pem`'s key
pub fn verify_signed_by(cert_pem: &str, issuer_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let cert = parse_certificate(&cert_der)?;
    let issuer_der = parse_pem(issuer_pem)?;
    let issuer = parse_certificate(&issuer_der)?;

    Ok(cert.verify_signature(Some(issuer.public_key())).is_ok())
}

/// URI subject alternative names of a certificate
pub fn certificate_uri_sans(cert_pem: &str) -> Result<Vec<String>> {
    let der = parse_pem(cert_pem)?;
    let cert = parse_certificate(&der)?;

    let mut uris = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            collect_uris(&san.general_names, &mut uris);
        }
    }
    Ok(uris)
}

/// URI subject alternative names requested by a PEM CSR
pub fn csr_uri_sans(csr_pem: &str) -> Result<Vec<String>> {
    let der = ::pem::parse(csr_pem.as_bytes())
        .map_err(|e| PkiError::InvalidCsr(format!("failed to parse PEM: {}", e)))?;
    let (_, csr) = X509CertificationRequest::from_der(der.contents())
        .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

    let mut uris = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                collect_uris(&san.general_names, &mut uris);
            }
        }
    }
    Ok(uris)
}

fn collect_uris(names: &[GeneralName<'_>], out: &mut Vec<String>) {
    for name in names {
        if let GeneralName::URI(uri) = name {
            out.push((*uri).to_string());
        }
    }
}

/// Build the durable record for a freshly generated or fetched root
///
/// The root signs leaves itself until an intermediate is appended.
pub fn ca_root_from_pem(root_pem: &str, config: &CaConfiguration) -> Result<CaRoot> {
    let info = CertificateInfo::from_pem(root_pem)?;
    Ok(CaRoot {
        id: fingerprint(root_pem)?,
        name: format!("{} CA Primary Cert", config.provider),
        root_cert: root_pem.to_string(),
        intermediate_certs: Vec::new(),
        signing_key_id: signing_key_id(root_pem)?,
        trust_domain: config.cluster_id.clone(),
        not_before: info.not_before,
        not_after: info.not_after,
        active: true,
        rotated_out_at: None,
        create_index: 0,
    })
}

/// Subject public key of an existing certificate
///
/// Lets rcgen issue a new certificate for a key it does not hold, which is
/// what cross-signing another CA requires.
pub(crate) struct CertificatePublicKey {
    key: Vec<u8>,
    algorithm: &'static SignatureAlgorithm,
}

impl CertificatePublicKey {
    pub(crate) fn from_pem(cert_pem: &str) -> Result<Self> {
        let der = parse_pem(cert_pem)?;
        let cert = parse_certificate(&der)?;
        let spki = cert.public_key();

        let algorithm = detect_algorithm(spki).ok_or_else(|| {
            PkiError::ParseError(format!(
                "unsupported public key algorithm {}",
                spki.algorithm.algorithm
            ))
        })?;

        Ok(Self {
            key: spki.subject_public_key.data.to_vec(),
            algorithm,
        })
    }
}

impl PublicKeyData for CertificatePublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.key
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        self.algorithm
    }
}

fn detect_algorithm(spki: &SubjectPublicKeyInfo<'_>) -> Option<&'static SignatureAlgorithm> {
    let oid = &spki.algorithm.algorithm;
    if *oid == OID_KEY_TYPE_EC_PUBLIC_KEY {
        // Uncompressed points: 65 bytes for P-256, 97 for P-384
        match spki.subject_public_key.data.len() {
            65 => Some(&rcgen::PKCS_ECDSA_P256_SHA256),
            97 => Some(&rcgen::PKCS_ECDSA_P384_SHA384),
            _ => None,
        }
    } else if *oid == OID_PKCS1_RSAENCRYPTION {
        Some(&rcgen::PKCS_RSA_SHA256)
    } else if *oid == OID_SIG_ED25519 {
        Some(&rcgen::PKCS_ED25519)
    } else {
        None
    }
}

/// Parameters for issuing an existing CA certificate again under another key
///
/// Carries over the subject, URI SANs and validity window of `cert_pem`.
/// Serial number and key usages are left for the issuer to set.
pub(crate) fn ca_params_from_pem(cert_pem: &str) -> Result<CertificateParams> {
    let der = parse_pem(cert_pem)?;
    let cert = parse_certificate(&der)?;

    let mut subject = DistinguishedName::new();
    for attr in cert.subject().iter_attributes() {
        let (Some(arcs), Ok(value)) = (attr.attr_type().iter(), attr.as_str()) else {
            continue;
        };
        let oid: Vec<u64> = arcs.collect();
        subject.push(DnType::from_oid(&oid), DnValue::Utf8String(value.to_string()));
    }

    let mut params = CertificateParams::default();
    params.distinguished_name = subject;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_before = timestamp(cert.validity().not_before.timestamp())?;
    params.not_after = timestamp(cert.validity().not_after.timestamp())?;
    params.subject_alt_names = certificate_uri_sans(cert_pem)?
        .iter()
        .map(|uri| uri_san(uri))
        .collect::<Result<_>>()?;
    Ok(params)
}

fn timestamp(secs: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| PkiError::ParseError(format!("certificate validity out of range: {}", e)))
}

pub(crate) fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

pub(crate) fn uri_san(uri: &str) -> Result<SanType> {
    Ia5String::try_from(uri.to_string())
        .map(SanType::URI)
        .map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("invalid URI SAN '{}': {}", uri, e))
        })
}

/// Key pair and CSR generated locally; the private key never leaves the caller
pub struct CertificateRequest {
    key_pem: String,
    csr_pem: String,
}

impl CertificateRequest {
    /// Generate a new P-256 key pair and a CSR for it
    pub fn new(common_name: &str, uri: Option<&str>) -> Result<Self> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate key: {}", e))
        })?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        if let Some(uri) = uri {
            params.subject_alt_names = vec![uri_san(uri)?];
        }

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            csr_pem,
        })
    }

    /// CSR in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Private key in PEM format
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}
