//! Certificate utilities and CA backends for meshca
//!
//! - [`cert`]: PEM/x509 parsing, fingerprints, signing key ids, validity
//!   checks, CSR generation
//! - [`spiffe`]: workload identities carried in leaf certificates
//! - [`provider`]: the [`Provider`] capability set with local and Vault
//!   implementations

#![deny(missing_docs)]

pub mod cert;
pub mod error;
pub mod provider;
pub mod spiffe;

pub use cert::{CertificateInfo, CertificateRequest};
pub use error::{PkiError, Result};
pub use provider::{
    create_provider, DefaultProviderFactory, LocalProvider, Provider, ProviderConfig,
    ProviderFactory, RootResult, VaultProvider,
};
pub use spiffe::SpiffeId;
