//! UpdateConfiguration: apply a new CA configuration, rotating the root
//! when the backend produces a different one

use std::sync::Arc;

use meshca_common::{CaConfiguration, CaRoot, ProviderKind};
use meshca_pki::cert::ca_root_from_pem;
use meshca_pki::Provider;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::chain::{append_signing_cert, merge_roots};
use super::{cancellable, CaManager, LifecycleState, Operation};
use crate::store::StoreSnapshot;
use crate::{Error, Result};

/// Outgoing backend and the root it signs with
struct Outgoing<'a> {
    provider: &'a dyn Provider,
    kind: ProviderKind,
    root: &'a CaRoot,
}

impl CaManager {
    /// Replace the CA configuration
    ///
    /// A request with the settings already in force is a no-op. The stored
    /// cluster id always wins over the request's. When the new backend has
    /// a different root, the outgoing backend cross-signs it so leaves
    /// issued under the old root stay verifiable; a backend that cannot
    /// cross-sign needs `force_without_cross_signing`.
    ///
    /// The write is a compare-and-set on the configuration index read at
    /// the start, so a concurrent change turns into [`Error::Conflict`].
    #[instrument(skip(self, cancel, request), fields(datacenter = %self.config.datacenter, provider = %request.provider))]
    pub async fn update_configuration(
        &self,
        cancel: &CancellationToken,
        request: CaConfiguration,
    ) -> Result<()> {
        let guard = self.lifecycle.begin(Operation::UpdateConfiguration)?;
        if guard.prior() != LifecycleState::Initialized {
            return Err(Error::NotInitialized);
        }
        self.ensure_leader()?;

        let snapshot = cancellable(cancel, self.store.read()).await?;
        let current = snapshot.config.clone().ok_or(Error::NotInitialized)?;

        let mut next = request;
        if !next.cluster_id.is_empty() && next.cluster_id != current.cluster_id {
            warn!(
                requested = %next.cluster_id,
                stored = %current.cluster_id,
                "ignoring cluster id change"
            );
        }
        next.cluster_id = current.cluster_id.clone();
        next.modify_index = current.modify_index;

        if next.same_settings(&current) {
            debug!("CA configuration unchanged");
            return Ok(());
        }

        let (old_provider, old_kind, old_root) = self.current()?;
        let new_provider = self.configured_provider(&next, cancel).await?;
        let outgoing = Outgoing {
            provider: old_provider.as_ref(),
            kind: old_kind,
            root: &old_root,
        };

        let result = if self.config.is_primary() {
            self.rotate_primary(&snapshot, &next, &outgoing, new_provider.as_ref(), cancel)
                .await
        } else {
            self.rotate_secondary(&snapshot, &next, &outgoing, new_provider.as_ref(), cancel)
                .await
        };

        let kind_changed = next.provider != old_kind;
        let new_root = match result {
            Ok(root) => root,
            Err(e) => {
                if let Err(cleanup) = new_provider.cleanup(kind_changed, &current.config).await {
                    warn!(error = %cleanup, "failed to clean up unused provider");
                }
                warn!(error = %e, "CA configuration update failed");
                return Err(e);
            }
        };

        let rotated = new_root.id != old_root.id;
        self.install(new_provider.clone(), next.provider, new_root.clone());
        self.retire_provider(old_provider, old_kind, kind_changed, &next, cancel)
            .await;

        if rotated {
            info!(
                old_root_id = %old_root.id,
                new_root_id = %new_root.id,
                provider = %next.provider,
                "rotated root CA"
            );
        } else {
            info!(provider = %next.provider, "updated CA configuration");
        }
        Ok(())
    }

    async fn rotate_primary(
        &self,
        snapshot: &StoreSnapshot,
        next: &CaConfiguration,
        outgoing: &Outgoing<'_>,
        provider: &dyn Provider,
        cancel: &CancellationToken,
    ) -> Result<CaRoot> {
        let generated = cancellable(cancel, provider.generate_root()).await?;
        let mut root = ca_root_from_pem(&generated.root_cert, next)?;

        if root.id == outgoing.root.id {
            debug!(root_id = %root.id, "root unchanged, replacing configuration only");
            self.commit_with_provider_state(
                provider,
                next.provider,
                snapshot.config_index(),
                snapshot.roots.clone(),
                next.clone(),
                cancel,
            )
            .await?;
            return Ok(outgoing.root.clone());
        }

        if outgoing.provider.supports_cross_signing() {
            let cross_signed =
                cancellable(cancel, outgoing.provider.cross_sign_ca(&root.root_cert)).await?;
            debug!(old_provider = %outgoing.kind, "cross-signed incoming root with outgoing root");
            root.intermediate_certs = vec![cross_signed];
        } else if next.force_without_cross_signing {
            warn!(old_provider = %outgoing.kind, "rotating root without a cross-signed certificate");
        } else {
            return Err(Error::validation(format!(
                "the {} provider cannot cross-sign the new root; set force_without_cross_signing to rotate anyway",
                outgoing.kind
            )));
        }

        let signer = cancellable(cancel, provider.generate_intermediate()).await?;
        if signer != root.root_cert {
            append_signing_cert(&mut root, &signer, self.now())?;
        }

        let roots = merge_roots(&snapshot.roots, root.clone(), self.now());
        self.commit_with_provider_state(
            provider,
            next.provider,
            snapshot.config_index(),
            roots,
            next.clone(),
            cancel,
        )
        .await?;
        Ok(root)
    }

    /// Keep the current chain when the new backend already holds its
    /// signing key; otherwise have the primary sign an intermediate for it
    async fn rotate_secondary(
        &self,
        snapshot: &StoreSnapshot,
        next: &CaConfiguration,
        outgoing: &Outgoing<'_>,
        provider: &dyn Provider,
        cancel: &CancellationToken,
    ) -> Result<CaRoot> {
        if self
            .provider_signs_with(provider, &outgoing.root.signing_key_id, cancel)
            .await
        {
            debug!("new provider holds the current signing key, replacing configuration only");
            self.commit_with_provider_state(
                provider,
                next.provider,
                snapshot.config_index(),
                snapshot.roots.clone(),
                next.clone(),
                cancel,
            )
            .await?;
            return Ok(outgoing.root.clone());
        }

        let primary_root = self.primary_active_root(cancel).await?;
        let mut root = if primary_root.id == outgoing.root.id {
            outgoing.root.clone()
        } else {
            primary_root
        };
        self.intermediate_from_primary(provider, &mut root, cancel)
            .await?;
        let roots = merge_roots(&snapshot.roots, root.clone(), self.now());
        self.commit_with_provider_state(
            provider,
            next.provider,
            snapshot.config_index(),
            roots,
            next.clone(),
            cancel,
        )
        .await?;
        Ok(root)
    }

    /// Release the outgoing backend once its replacement is installed
    async fn retire_provider(
        &self,
        provider: Arc<dyn Provider>,
        kind: ProviderKind,
        kind_changed: bool,
        next: &CaConfiguration,
        cancel: &CancellationToken,
    ) {
        if let Err(e) = provider.cleanup(kind_changed, &next.config).await {
            warn!(provider = %kind, error = %e, "failed to clean up previous provider");
        }
        if !kind_changed {
            return;
        }
        let id = self.provider_state_id(kind);
        if let Err(e) = cancellable(cancel, self.store.delete_provider_state(&id)).await {
            warn!(provider = %kind, error = %e, "failed to delete previous provider state");
        }
    }
}
