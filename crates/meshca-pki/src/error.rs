//! Error types for certificate handling and CA backends

use meshca_common::ProviderKind;
use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PkiError {
    /// Backend has no signing material yet
    #[error("CA not initialized")]
    CaNotInitialized,

    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Backend configuration is malformed or incomplete
    #[error("invalid {provider} provider configuration: {message}")]
    InvalidConfig {
        /// Backend the configuration was meant for
        provider: ProviderKind,
        /// What was wrong
        message: String,
    },

    /// Operation is not available on this backend or in this datacenter
    #[error("{provider} provider does not support {operation}")]
    Unsupported {
        /// Backend that rejected the call
        provider: ProviderKind,
        /// Operation name
        operation: &'static str,
    },

    /// Backend-reported failure
    #[error("{provider} backend error: {message}")]
    Backend {
        /// Backend that failed
        provider: ProviderKind,
        /// Backend message
        message: String,
    },
}

impl PkiError {
    /// Create a configuration error
    pub fn invalid_config(provider: ProviderKind, msg: impl Into<String>) -> Self {
        Self::InvalidConfig {
            provider,
            message: msg.into(),
        }
    }

    /// Create a backend error
    pub fn backend(provider: ProviderKind, msg: impl Into<String>) -> Self {
        Self::Backend {
            provider,
            message: msg.into(),
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
