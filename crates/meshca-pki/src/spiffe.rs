//! SPIFFE workload identities carried in leaf certificates

use std::fmt;

use crate::error::{PkiError, Result};

/// Identity a leaf certificate is issued for
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpiffeId {
    /// A mesh service instance
    Service {
        /// Trust domain
        trust_domain: String,
        /// Namespace
        namespace: String,
        /// Datacenter
        datacenter: String,
        /// Service name
        service: String,
    },
    /// A client agent
    Agent {
        /// Trust domain
        trust_domain: String,
        /// Datacenter
        datacenter: String,
        /// Agent node id
        agent: String,
    },
}

impl SpiffeId {
    /// Trust domain the identity belongs to
    pub fn trust_domain(&self) -> &str {
        match self {
            Self::Service { trust_domain, .. } | Self::Agent { trust_domain, .. } => trust_domain,
        }
    }

    /// The `spiffe://` URI form
    pub fn uri(&self) -> String {
        self.to_string()
    }

    /// Parse a `spiffe://` URI
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = || PkiError::InvalidCsr(format!("unrecognized SPIFFE id '{}'", uri));

        let rest = uri.strip_prefix("spiffe://").ok_or_else(invalid)?;
        let (trust_domain, path) = rest.split_once('/').ok_or_else(invalid)?;
        if trust_domain.is_empty() {
            return Err(invalid());
        }
        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }

        match segments.as_slice() {
            ["ns", namespace, "dc", datacenter, "svc", service] => Ok(Self::Service {
                trust_domain: trust_domain.to_string(),
                namespace: namespace.to_string(),
                datacenter: datacenter.to_string(),
                service: service.to_string(),
            }),
            ["agent", "client", "dc", datacenter, "id", agent] => Ok(Self::Agent {
                trust_domain: trust_domain.to_string(),
                datacenter: datacenter.to_string(),
                agent: agent.to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service {
                trust_domain,
                namespace,
                datacenter,
                service,
            } => write!(
                f,
                "spiffe://{}/ns/{}/dc/{}/svc/{}",
                trust_domain, namespace, datacenter, service
            ),
            Self::Agent {
                trust_domain,
                datacenter,
                agent,
            } => write!(
                f,
                "spiffe://{}/agent/client/dc/{}/id/{}",
                trust_domain, datacenter, agent
            ),
        }
    }
}

/// URI SAN of a CA certificate for `trust_domain`
pub fn trust_domain_uri(trust_domain: &str) -> String {
    format!("spiffe://{}", trust_domain)
}
