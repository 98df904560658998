//! Cross-datacenter transport
//!
//! Secondary datacenters reach the primary for exactly two things: its
//! current root set and a signature over an intermediate CSR.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use meshca_common::IndexedCaRoots;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::debug;

use crate::manager::CaManager;

/// Request forwarded to another datacenter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardRequest {
    /// Fetch the current root set
    Roots,
    /// Sign an intermediate CSR with the primary's root
    SignIntermediate {
        /// PEM-encoded CSR
        csr: String,
    },
}

impl ForwardRequest {
    /// Method name used in logs and errors
    pub fn method(&self) -> &'static str {
        match self {
            Self::Roots => "ConnectCA.Roots",
            Self::SignIntermediate { .. } => "ConnectCA.SignIntermediate",
        }
    }
}

/// Response from another datacenter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardResponse {
    /// Answer to [`ForwardRequest::Roots`]
    Roots(IndexedCaRoots),
    /// Answer to [`ForwardRequest::SignIntermediate`]
    Intermediate(String),
}

/// Cross-datacenter request failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No route to the datacenter
    #[error("datacenter {0} is unreachable")]
    Unreachable(String),

    /// The request did not complete in time
    #[error("request to datacenter {0} timed out")]
    Timeout(String),

    /// The remote side handled the request and failed
    #[error("remote error from {datacenter}: {message}")]
    Remote {
        /// Datacenter that answered
        datacenter: String,
        /// Its error message
        message: String,
    },

    /// The response did not match the request
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

/// Forwards requests to another datacenter
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CrossDcTransport: Send + Sync {
    /// Send `request` to `datacenter` and wait for its answer
    async fn forward(
        &self,
        datacenter: &str,
        request: ForwardRequest,
    ) -> std::result::Result<ForwardResponse, TransportError>;
}

/// Routes requests to a primary [`CaManager`] in the same process
///
/// Holds the primary weakly so a primary whose transport points back at
/// itself does not keep itself alive.
#[derive(Default)]
pub struct LocalTransport {
    primary: parking_lot::RwLock<Option<(String, Weak<CaManager>)>>,
}

impl LocalTransport {
    /// Create a transport with no primary attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Route requests for `datacenter` to `manager`
    pub fn attach(&self, datacenter: impl Into<String>, manager: &Arc<CaManager>) {
        *self.primary.write() = Some((datacenter.into(), Arc::downgrade(manager)));
    }

    fn target(&self, datacenter: &str) -> std::result::Result<Arc<CaManager>, TransportError> {
        let guard = self.primary.read();
        match guard.as_ref() {
            Some((dc, manager)) if dc == datacenter => manager
                .upgrade()
                .ok_or_else(|| TransportError::Unreachable(datacenter.to_string())),
            _ => Err(TransportError::Unreachable(datacenter.to_string())),
        }
    }
}

#[async_trait]
impl CrossDcTransport for LocalTransport {
    async fn forward(
        &self,
        datacenter: &str,
        request: ForwardRequest,
    ) -> std::result::Result<ForwardResponse, TransportError> {
        let primary = self.target(datacenter)?;
        debug!(datacenter, method = request.method(), "forwarding request");

        let remote = |e: crate::Error| TransportError::Remote {
            datacenter: datacenter.to_string(),
            message: e.to_string(),
        };
        match request {
            ForwardRequest::Roots => primary.roots().await.map(ForwardResponse::Roots).map_err(remote),
            ForwardRequest::SignIntermediate { csr } => primary
                .sign_intermediate(&csr)
                .await
                .map(ForwardResponse::Intermediate)
                .map_err(remote),
        }
    }
}
