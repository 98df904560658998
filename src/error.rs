//! Error types for the CA lifecycle manager
//!
//! Every failure a caller can see falls into one of the classes below.
//! Backend and transport failures keep their source so the cause survives
//! into logs.

use std::fmt;

use meshca_common::ConfigError;
use meshca_pki::PkiError;
use thiserror::Error;
use time::OffsetDateTime;

use crate::manager::Operation;
use crate::transport::TransportError;

/// Which certificate of the signing chain a check refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertRole {
    /// The root certificate
    Root,
    /// The intermediate that signs leaves
    Intermediate,
}

impl fmt::Display for CertRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str("root"),
            Self::Intermediate => f.write_str("intermediate"),
        }
    }
}

/// Main error type for lifecycle operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed configuration, CSR or identity
    #[error("validation error: {0}")]
    Validation(String),

    /// Another lifecycle operation holds the exclusivity guard
    #[error("CA is busy: {operation} already in progress")]
    Busy {
        /// The operation in progress
        operation: Operation,
    },

    /// Compare-and-set on the CA store lost to a concurrent writer
    #[error("conflict: {0}")]
    Conflict(String),

    /// A signing certificate is outside its validity window
    #[error("{role} expired: certificate expired, expiration date: {not_after}")]
    Expired {
        /// Which certificate expired
        role: CertRole,
        /// Its `NotAfter`
        not_after: OffsetDateTime,
    },

    /// Failure reported by the CA provider
    #[error("provider error: {0}")]
    Backend(#[from] PkiError),

    /// Cross-datacenter request failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// This node is not the cluster leader
    #[error("not the cluster leader")]
    NotLeader,

    /// The CA has not been initialized yet
    #[error("CA not initialized")]
    NotInitialized,

    /// The CA store failed
    #[error("store error: {0}")]
    Store(String),

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Whether a later attempt of the same operation may succeed
    ///
    /// Used by the renewal scheduler to pick a log level; it retries on its
    /// next tick either way.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation(_) => false,
            Error::Busy { .. } => true,
            Error::Conflict(_) => true,
            Error::Expired { .. } => false,
            Error::Backend(e) => e.is_retryable(),
            Error::Transport(_) => true,
            Error::NotLeader => true,
            Error::NotInitialized => false,
            Error::Store(_) => true,
            Error::Cancelled => true,
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Validation(e.to_string())
    }
}
