//! Initialize: load or generate the signing material

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use meshca_pki::cert::ca_root_from_pem;

use super::chain::{append_signing_cert, merge_roots};
use super::{cancellable, CaManager, LifecycleState, Operation};
use crate::{Error, Result};

impl CaManager {
    /// Bring the CA from `Uninitialized` to `Initialized`
    ///
    /// The primary datacenter generates (or reloads) its root; a secondary
    /// obtains an intermediate signed by the primary's root. Calling this on
    /// an initialized manager does nothing. On failure the manager stays
    /// `Uninitialized` and the call may be retried.
    #[instrument(skip(self, cancel), fields(datacenter = %self.config.datacenter))]
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        let guard = self.lifecycle.begin(Operation::Initialize)?;
        if guard.prior() == LifecycleState::Initialized {
            debug!("CA already initialized");
            return Ok(());
        }
        self.ensure_leader()?;
        guard.show(LifecycleState::Initializing);

        let result = if self.config.is_primary() {
            self.initialize_primary(cancel).await
        } else {
            self.initialize_secondary(cancel).await
        };

        match result {
            Ok(()) => {
                guard.complete(LifecycleState::Initialized);
                info!(
                    primary = self.config.is_primary(),
                    provider = ?self.provider_kind(),
                    "initialized CA"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "CA initialization failed");
                Err(e)
            }
        }
    }

    async fn initialize_primary(&self, cancel: &CancellationToken) -> Result<()> {
        let snapshot = cancellable(cancel, self.store.read()).await?;
        let stored_root = snapshot.active_root().cloned();
        let config = self
            .load_or_bootstrap_config(snapshot.config.clone(), cancel)
            .await?;

        let provider = self.configured_provider(&config, cancel).await?;
        let generated = cancellable(cancel, provider.generate_root()).await?;
        let mut root = ca_root_from_pem(&generated.root_cert, &config)?;

        if let Some(stored) = stored_root {
            if stored.id != root.id {
                return Err(Error::validation(format!(
                    "stored active root {} does not match the provider's root {}",
                    stored.id, root.id
                )));
            }
            debug!(root_id = %stored.id, "reusing stored active root");
            self.install(provider, config.provider, stored);
            return Ok(());
        }

        let signer = if provider.primary_uses_intermediate() {
            cancellable(cancel, provider.generate_intermediate()).await?
        } else {
            cancellable(cancel, provider.active_intermediate()).await?
        };
        if signer != root.root_cert {
            append_signing_cert(&mut root, &signer, self.now())?;
        }

        let roots = merge_roots(&snapshot.roots, root.clone(), self.now());
        self.commit_with_provider_state(
            provider.as_ref(),
            config.provider,
            config.modify_index,
            roots,
            config.clone(),
            cancel,
        )
        .await?;
        info!(root_id = %root.id, provider = %config.provider, "stored new root CA");
        self.install(provider, config.provider, root);
        Ok(())
    }

    async fn initialize_secondary(&self, cancel: &CancellationToken) -> Result<()> {
        let snapshot = cancellable(cancel, self.store.read()).await?;
        let stored_root = snapshot.active_root().cloned();
        let config = self
            .load_or_bootstrap_config(snapshot.config.clone(), cancel)
            .await?;

        let mut root = self.primary_active_root(cancel).await?;
        let provider = self.configured_provider(&config, cancel).await?;

        if let Some(stored) = stored_root {
            if stored.id == root.id
                && self
                    .provider_signs_with(provider.as_ref(), &stored.signing_key_id, cancel)
                    .await
            {
                debug!(root_id = %stored.id, "local intermediate already chains to the primary root");
                self.install(provider, config.provider, stored);
                return Ok(());
            }
        }

        self.intermediate_from_primary(provider.as_ref(), &mut root, cancel)
            .await?;
        let roots = merge_roots(&snapshot.roots, root.clone(), self.now());
        self.commit_with_provider_state(
            provider.as_ref(),
            config.provider,
            config.modify_index,
            roots,
            config.clone(),
            cancel,
        )
        .await?;
        info!(
            root_id = %root.id,
            primary = %self.config.primary_datacenter,
            "stored intermediate signed by the primary datacenter"
        );
        self.install(provider, config.provider, root);
        Ok(())
    }
}
