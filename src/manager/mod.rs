//! CA lifecycle manager
//!
//! [`CaManager`] drives the lifecycle operations against one [`Provider`]
//! at a time:
//!
//! - [`CaManager::initialize`] loads or generates signing material
//! - [`CaManager::renew_intermediate`] replaces the leaf-signing intermediate
//! - [`CaManager::update_configuration`] applies a new configuration,
//!   rotating the root when the backend produces a different one
//! - [`CaManager::sign_certificate`] issues leaves from the active chain
//!
//! The first three share an exclusivity guard. Signing reads the active
//! chain under a short read lock and never waits on them.

mod chain;
mod initialize;
mod reconfigure;
mod renew;
mod state;

use std::future::Future;
use std::sync::Arc;

use meshca_common::{
    CaConfiguration, CaRoot, IndexedCaRoots, ManagerConfig, ProviderKind, ProviderState,
};
use meshca_pki::cert::{csr_uri_sans, signing_key_id};
use meshca_pki::{DefaultProviderFactory, Provider, ProviderConfig, ProviderFactory, SpiffeId};
use parking_lot::RwLock;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::leader::LeadershipOracle;
use crate::store::CaStore;
use crate::transport::{CrossDcTransport, ForwardRequest, ForwardResponse, TransportError};
use crate::{Error, Result};

use chain::{append_signing_cert, check_signing_chain, leaf_signer};
use state::Lifecycle;
pub use state::{LifecycleState, Operation};

/// Source of the current time
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Provider and chain currently used for signing
struct ActiveCa {
    provider: Arc<dyn Provider>,
    kind: ProviderKind,
    root: CaRoot,
}

/// Owns the lifecycle state, the active provider and the active root
pub struct CaManager {
    config: ManagerConfig,
    store: Arc<dyn CaStore>,
    transport: Arc<dyn CrossDcTransport>,
    leadership: Arc<dyn LeadershipOracle>,
    providers: Arc<dyn ProviderFactory>,
    lifecycle: Lifecycle,
    active: RwLock<Option<ActiveCa>>,
    clock: Clock,
}

impl CaManager {
    /// Create a manager in the `Uninitialized` state
    ///
    /// Providers come from [`DefaultProviderFactory`] unless replaced with
    /// [`CaManager::with_provider_factory`].
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn CaStore>,
        transport: Arc<dyn CrossDcTransport>,
        leadership: Arc<dyn LeadershipOracle>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            transport,
            leadership,
            providers: Arc::new(DefaultProviderFactory),
            lifecycle: Lifecycle::new(),
            active: RwLock::new(None),
            clock: Arc::new(OffsetDateTime::now_utc),
        })
    }

    /// Use `providers` to create backend instances
    pub fn with_provider_factory(mut self, providers: Arc<dyn ProviderFactory>) -> Self {
        self.providers = providers;
        self
    }

    /// Use `clock` for every expiry and renewal decision
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Manager configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Lifecycle operation holding the guard, if any
    pub fn in_flight(&self) -> Option<Operation> {
        self.lifecycle.in_flight()
    }

    /// Whether this node may run state-changing operations
    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    /// Root currently used for signing
    pub fn active_root(&self) -> Option<CaRoot> {
        self.active.read().as_ref().map(|a| a.root.clone())
    }

    /// PEM of the certificate that signs leaves
    pub fn active_signing_cert(&self) -> Option<String> {
        self.active
            .read()
            .as_ref()
            .map(|a| leaf_signer(&a.root).to_string())
    }

    /// Kind of the installed provider
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        self.active.read().as_ref().map(|a| a.kind)
    }

    /// Root set as stored, in the form served to other datacenters
    pub async fn roots(&self) -> Result<IndexedCaRoots> {
        Ok(self.store.read().await?.indexed_roots())
    }

    /// Issue a leaf certificate for `identity`
    ///
    /// The CSR must request `identity` as a URI SAN and the identity must
    /// belong to the CA's trust domain. Fails with [`Error::Expired`] rather
    /// than sign with a root or intermediate outside its validity window.
    #[instrument(skip(self, csr_pem, identity), fields(identity = %identity))]
    pub async fn sign_certificate(&self, csr_pem: &str, identity: &SpiffeId) -> Result<String> {
        let (provider, _, root) = self.current()?;

        if identity.trust_domain() != root.trust_domain {
            return Err(Error::validation(format!(
                "identity trust domain {} does not match CA trust domain {}",
                identity.trust_domain(),
                root.trust_domain
            )));
        }

        let requested = csr_uri_sans(csr_pem).map_err(|e| Error::validation(e.to_string()))?;
        let expected = identity.uri();
        if !requested.iter().any(|uri| *uri == expected) {
            return Err(Error::validation(format!(
                "CSR does not request identity {expected}"
            )));
        }

        check_signing_chain(&root, self.now(), self.config.drift_buffer)?;
        let cert = provider.sign(csr_pem).await?;
        debug!("signed leaf certificate");
        Ok(cert)
    }

    /// Sign an intermediate CSR from a secondary datacenter
    #[instrument(skip(self, csr_pem))]
    pub async fn sign_intermediate(&self, csr_pem: &str) -> Result<String> {
        if !self.config.is_primary() {
            return Err(Error::validation(
                "intermediates are only signed by the primary datacenter",
            ));
        }
        let (provider, _, root) = self.current()?;
        check_signing_chain(&root, self.now(), self.config.drift_buffer)?;
        let cert = provider.sign_intermediate(csr_pem).await?;
        debug!("signed intermediate for secondary datacenter");
        Ok(cert)
    }

    fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.leadership.is_leader() {
            Ok(())
        } else {
            Err(Error::NotLeader)
        }
    }

    fn current(&self) -> Result<(Arc<dyn Provider>, ProviderKind, CaRoot)> {
        let active = self.active.read();
        let active = active.as_ref().ok_or(Error::NotInitialized)?;
        Ok((active.provider.clone(), active.kind, active.root.clone()))
    }

    fn install(&self, provider: Arc<dyn Provider>, kind: ProviderKind, root: CaRoot) {
        debug!(provider = %kind, root_id = %root.id, signing_key_id = %root.signing_key_id, "installing active CA");
        *self.active.write() = Some(ActiveCa {
            provider,
            kind,
            root,
        });
    }

    fn provider_state_id(&self, kind: ProviderKind) -> String {
        ProviderState::id_for(kind, &self.config.datacenter)
    }

    /// Create a backend for `config` and configure it with its stored state
    async fn configured_provider(
        &self,
        config: &CaConfiguration,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Provider>> {
        let id = self.provider_state_id(config.provider);
        let state = cancellable(cancel, self.store.provider_state(&id))
            .await?
            .map(|s| s.state)
            .unwrap_or_default();

        let provider = self.providers.create(config.provider);
        let provider_config = ProviderConfig {
            cluster_id: config.cluster_id.clone(),
            datacenter: self.config.datacenter.clone(),
            is_primary: self.config.is_primary(),
            raw: config.config.clone(),
            state,
        };
        cancellable(cancel, provider.configure(&provider_config)).await?;
        debug!(provider = %config.provider, "configured provider");
        Ok(provider)
    }

    /// Store the backend's state when it differs from `stored`
    ///
    /// Returns whether anything was written.
    async fn persist_provider_state(
        &self,
        provider: &dyn Provider,
        kind: ProviderKind,
        stored: Option<&ProviderState>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let state = cancellable(cancel, provider.state()).await?;
        let unchanged = match stored {
            Some(stored) => stored.state == state,
            None => state.is_empty(),
        };
        if unchanged {
            return Ok(false);
        }
        let id = self.provider_state_id(kind);
        cancellable(cancel, self.store.set_provider_state(ProviderState { id, state })).await?;
        debug!(provider = %kind, "stored provider state");
        Ok(true)
    }

    /// Store the backend's state, then replace roots and configuration
    ///
    /// Roots never reference key material the store does not hold: a failed
    /// state write aborts before the commit, and a failed commit puts the
    /// previous state back.
    async fn commit_with_provider_state(
        &self,
        provider: &dyn Provider,
        kind: ProviderKind,
        expected_index: u64,
        roots: Vec<CaRoot>,
        config: CaConfiguration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = self.provider_state_id(kind);
        let previous = cancellable(cancel, self.store.provider_state(&id)).await?;
        let written = self
            .persist_provider_state(provider, kind, previous.as_ref(), cancel)
            .await?;

        let committed = self.commit(expected_index, roots, config, cancel).await;
        if committed.is_err() && written {
            self.restore_provider_state(&id, previous).await;
        }
        committed
    }

    /// Put back the provider state that was stored before a failed commit
    ///
    /// Runs to completion even when the operation was cancelled.
    async fn restore_provider_state(&self, id: &str, previous: Option<ProviderState>) {
        let restored = match previous {
            Some(state) => self.store.set_provider_state(state).await,
            None => self.store.delete_provider_state(id).await,
        };
        match restored {
            Ok(()) => debug!(id, "restored provider state after failed commit"),
            Err(e) => warn!(id, error = %e, "failed to restore provider state"),
        }
    }

    /// Replace roots and configuration if the configuration is unchanged
    /// since `expected_index`
    async fn commit(
        &self,
        expected_index: u64,
        roots: Vec<CaRoot>,
        config: CaConfiguration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let applied = cancellable(
            cancel,
            self.store.set_roots_and_config(expected_index, roots, config),
        )
        .await?;
        if !applied {
            return Err(Error::conflict(
                "could not atomically update roots and config",
            ));
        }
        debug!(expected_index, "committed roots and configuration");
        Ok(())
    }

    /// Stored configuration, writing the bootstrap one if none exists
    async fn load_or_bootstrap_config(
        &self,
        stored: Option<CaConfiguration>,
        cancel: &CancellationToken,
    ) -> Result<CaConfiguration> {
        if let Some(config) = stored {
            return Ok(config);
        }

        let mut config = self.config.bootstrap.clone().unwrap_or_else(|| {
            CaConfiguration::new(self.config.cluster_id.clone(), ProviderKind::Local)
        });
        if config.cluster_id.is_empty() {
            config.cluster_id = self.config.cluster_id.clone();
        }
        if config.cluster_id.is_empty() {
            return Err(Error::validation(
                "a cluster id is required to bootstrap the CA configuration",
            ));
        }

        let config = cancellable(cancel, self.store.set_config(config)).await?;
        debug!(provider = %config.provider, index = config.modify_index, "bootstrapped CA configuration");
        Ok(config)
    }

    /// Current root set of the primary datacenter
    async fn fetch_primary_roots(&self, cancel: &CancellationToken) -> Result<IndexedCaRoots> {
        let primary = &self.config.primary_datacenter;
        let response =
            cancellable(cancel, self.transport.forward(primary, ForwardRequest::Roots)).await?;
        match response {
            ForwardResponse::Roots(roots) => {
                debug!(datacenter = %primary, active_root_id = %roots.active_root_id, "fetched primary roots");
                Ok(roots)
            }
            _ => Err(TransportError::UnexpectedResponse("ConnectCA.Roots").into()),
        }
    }

    /// The primary's active root, which every secondary chains to
    async fn primary_active_root(&self, cancel: &CancellationToken) -> Result<CaRoot> {
        let roots = self.fetch_primary_roots(cancel).await?;
        let mut root = roots.active().cloned().ok_or_else(|| {
            Error::validation("primary datacenter does not have an active root CA")
        })?;
        root.active = true;
        root.rotated_out_at = None;
        root.create_index = 0;
        Ok(root)
    }

    /// Have the primary sign a fresh intermediate for `provider` and append
    /// it to `root`'s chain
    async fn intermediate_from_primary(
        &self,
        provider: &dyn Provider,
        root: &mut CaRoot,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let csr = cancellable(cancel, provider.generate_intermediate_csr()).await?;

        let primary = &self.config.primary_datacenter;
        let response = cancellable(
            cancel,
            self.transport
                .forward(primary, ForwardRequest::SignIntermediate { csr }),
        )
        .await?;
        let intermediate = match response {
            ForwardResponse::Intermediate(pem) => pem,
            _ => {
                return Err(
                    TransportError::UnexpectedResponse("ConnectCA.SignIntermediate").into(),
                )
            }
        };

        cancellable(cancel, provider.set_intermediate(&intermediate, &root.root_cert)).await?;
        append_signing_cert(root, &intermediate, self.now())?;
        debug!(datacenter = %primary, signing_key_id = %root.signing_key_id, "installed intermediate signed by primary");
        Ok(())
    }

    /// Whether `provider`'s active intermediate has the given key id
    async fn provider_signs_with(
        &self,
        provider: &dyn Provider,
        key_id: &str,
        cancel: &CancellationToken,
    ) -> bool {
        match cancellable(cancel, provider.active_intermediate()).await {
            Ok(pem) => signing_key_id(&pem).map(|id| id == key_id).unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Race `fut` against `cancel`
pub(crate) async fn cancellable<T, E>(
    cancel: &CancellationToken,
    fut: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T>
where
    E: Into<Error>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}
