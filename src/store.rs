//! Durable CA store
//!
//! The store is the system of record for the CA configuration, the root
//! set and per-backend state. Root and configuration changes go through a
//! single compare-and-set keyed on the configuration's `modify_index`, so
//! two writers that read the same configuration can never both win.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use meshca_common::{CaConfiguration, CaRoot, IndexedCaRoots, ProviderState};
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use tracing::debug;

use crate::{Error, Result};

/// Consistent read of the CA records
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreSnapshot {
    /// Store index at the time of the read
    pub index: u64,
    /// Current configuration, if one was ever written
    pub config: Option<CaConfiguration>,
    /// All roots, active and rotated out
    pub roots: Vec<CaRoot>,
}

impl StoreSnapshot {
    /// The active root, if any
    pub fn active_root(&self) -> Option<&CaRoot> {
        self.roots.iter().find(|r| r.active)
    }

    /// Root set in the form served to other datacenters
    pub fn indexed_roots(&self) -> IndexedCaRoots {
        IndexedCaRoots {
            active_root_id: self
                .active_root()
                .map(|r| r.id.clone())
                .unwrap_or_default(),
            trust_domain: self
                .config
                .as_ref()
                .map(|c| c.cluster_id.clone())
                .unwrap_or_default(),
            roots: self.roots.clone(),
            index: self.index,
        }
    }

    /// Configuration index a compare-and-set must expect
    pub fn config_index(&self) -> u64 {
        self.config.as_ref().map(|c| c.modify_index).unwrap_or(0)
    }
}

/// Linearizable, indexed storage for CA records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CaStore: Send + Sync {
    /// Read configuration and roots together
    async fn read(&self) -> Result<StoreSnapshot>;

    /// Write the configuration unconditionally, returning it with its new index
    async fn set_config(&self, config: CaConfiguration) -> Result<CaConfiguration>;

    /// Replace roots and configuration if the configuration is still at
    /// `expected_index`; returns whether the write applied
    async fn set_roots_and_config(
        &self,
        expected_index: u64,
        roots: Vec<CaRoot>,
        config: CaConfiguration,
    ) -> Result<bool>;

    /// Backend state stored under `id`
    async fn provider_state(&self, id: &str) -> Result<Option<ProviderState>>;

    /// Store backend state under its id
    async fn set_provider_state(&self, state: ProviderState) -> Result<()>;

    /// Remove backend state
    async fn delete_provider_state(&self, id: &str) -> Result<()>;
}

#[derive(Default)]
struct StoreData {
    index: u64,
    config: Option<CaConfiguration>,
    roots: Vec<CaRoot>,
    provider_states: BTreeMap<String, ProviderState>,
}

/// In-process [`CaStore`] with a single monotonic index
#[derive(Default)]
pub struct InMemoryCaStore {
    data: Mutex<StoreData>,
    read_only: AtomicBool,
}

impl InMemoryCaStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every write with [`Error::NotLeader`], as a store does after
    /// leadership moves elsewhere
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::NotLeader);
        }
        Ok(())
    }
}

#[async_trait]
impl CaStore for InMemoryCaStore {
    async fn read(&self) -> Result<StoreSnapshot> {
        let data = self.data.lock();
        Ok(StoreSnapshot {
            index: data.index,
            config: data.config.clone(),
            roots: data.roots.clone(),
        })
    }

    async fn set_config(&self, mut config: CaConfiguration) -> Result<CaConfiguration> {
        self.check_writable()?;
        let mut data = self.data.lock();
        data.index += 1;
        config.modify_index = data.index;
        data.config = Some(config.clone());
        debug!(index = data.index, "stored CA configuration");
        Ok(config)
    }

    async fn set_roots_and_config(
        &self,
        expected_index: u64,
        mut roots: Vec<CaRoot>,
        mut config: CaConfiguration,
    ) -> Result<bool> {
        self.check_writable()?;
        if roots.iter().filter(|r| r.active).count() > 1 {
            return Err(Error::store("more than one active root"));
        }

        let mut data = self.data.lock();
        let current = data.config.as_ref().map(|c| c.modify_index).unwrap_or(0);
        if current != expected_index {
            debug!(expected_index, current, "CA store compare-and-set rejected");
            return Ok(false);
        }

        data.index += 1;
        let index = data.index;
        for root in roots.iter_mut().filter(|r| r.create_index == 0) {
            root.create_index = index;
        }
        config.modify_index = index;
        data.roots = roots;
        data.config = Some(config);
        debug!(index, "stored CA roots and configuration");
        Ok(true)
    }

    async fn provider_state(&self, id: &str) -> Result<Option<ProviderState>> {
        Ok(self.data.lock().provider_states.get(id).cloned())
    }

    async fn set_provider_state(&self, state: ProviderState) -> Result<()> {
        self.check_writable()?;
        let mut data = self.data.lock();
        data.index += 1;
        data.provider_states.insert(state.id.clone(), state);
        Ok(())
    }

    async fn delete_provider_state(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        let mut data = self.data.lock();
        if data.provider_states.remove(id).is_some() {
            data.index += 1;
        }
        Ok(())
    }
}
