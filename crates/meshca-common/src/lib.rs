//! Common types for meshca: durable CA records, manager configuration, telemetry

#![deny(missing_docs)]

pub mod config;
pub mod telemetry;
pub mod types;

pub use config::{ConfigError, ManagerConfig};
pub use types::{CaConfiguration, CaRoot, IndexedCaRoots, ProviderKind, ProviderState};
