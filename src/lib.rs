//! meshca - certificate authority lifecycle manager for a multi-datacenter mesh
//!
//! Every node needs a locally verifiable identity certificate, and the CA
//! behind them has to survive leader elections, backend swaps and
//! cross-datacenter trust propagation without ever issuing from an expired
//! or inconsistent signing certificate.
//!
//! # Architecture
//!
//! - The primary datacenter owns the root. Its backend generates the root
//!   and, depending on the backend, an intermediate that signs leaves.
//! - Secondary datacenters never hold a root key. They generate an
//!   intermediate CSR, have the primary sign it, and sign leaves with it.
//! - Root and configuration changes are committed to the [`store::CaStore`]
//!   with one compare-and-set; provider key material is stored beside them
//!   so a restart reloads the same root.
//!
//! # Modules
//!
//! - [`manager`] - the lifecycle state machine ([`CaManager`])
//! - [`store`] - durable CA store contract and in-memory store
//! - [`transport`] - requests forwarded to the primary datacenter
//! - [`leader`] - leadership oracle
//! - [`renewal`] - periodic intermediate renewal
//! - [`error`] - error types for lifecycle operations

#![deny(missing_docs)]

pub mod error;
pub mod leader;
pub mod manager;
pub mod renewal;
pub mod store;
pub mod transport;

pub use error::{CertRole, Error};
pub use leader::{LeadershipOracle, StaticLeadership};
pub use manager::{CaManager, Clock, LifecycleState, Operation};
pub use renewal::RenewalScheduler;
pub use store::{CaStore, InMemoryCaStore, StoreSnapshot};
pub use transport::{
    CrossDcTransport, ForwardRequest, ForwardResponse, LocalTransport, TransportError,
};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
