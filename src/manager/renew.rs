//! RenewIntermediate: replace the leaf-signing intermediate before it expires

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use meshca_pki::CertificateInfo;

use super::chain::{append_signing_cert, leaf_signer, merge_roots, root_signs_leaves};
use super::{cancellable, CaManager, LifecycleState, Operation};
use crate::{Error, Result};

impl CaManager {
    /// Renew the intermediate once it has used up the renewal fraction of
    /// its lifetime
    ///
    /// `force` renews regardless of remaining validity. A primary whose
    /// root signs leaves directly has nothing to renew unless forced.
    /// Failures leave the current chain in place.
    #[instrument(skip(self, cancel), fields(datacenter = %self.config.datacenter))]
    pub async fn renew_intermediate(&self, cancel: &CancellationToken, force: bool) -> Result<()> {
        let guard = self.lifecycle.begin(Operation::RenewIntermediate)?;
        if guard.prior() != LifecycleState::Initialized {
            return Err(Error::NotInitialized);
        }
        self.ensure_leader()?;
        guard.show(LifecycleState::RenewingIntermediate);

        let result = self.renew(cancel, force).await;
        if let Err(e) = &result {
            warn!(error = %e, retryable = e.is_retryable(), "intermediate renewal failed");
        }
        result
    }

    async fn renew(&self, cancel: &CancellationToken, force: bool) -> Result<()> {
        let (provider, kind, active) = self.current()?;
        let is_primary = self.config.is_primary();
        let now = self.now();

        if is_primary && root_signs_leaves(&active) && !force {
            debug!("root signs leaves directly, nothing to renew");
            return Ok(());
        }
        if !force {
            let info = CertificateInfo::from_pem(leaf_signer(&active))?;
            if !info.needs_renewal_at(now, self.config.drift_buffer, self.config.renew_fraction) {
                debug!(
                    not_after = info.not_after,
                    remaining_secs = info.remaining_secs_at(now),
                    "intermediate does not need renewal yet"
                );
                return Ok(());
            }
        }

        let mut root = active;
        if is_primary {
            let intermediate = cancellable(cancel, provider.generate_intermediate()).await?;
            if intermediate != root.root_cert {
                append_signing_cert(&mut root, &intermediate, now)?;
            }
        } else {
            self.intermediate_from_primary(provider.as_ref(), &mut root, cancel)
                .await?;
        }

        let snapshot = cancellable(cancel, self.store.read()).await?;
        let config = snapshot.config.clone().ok_or(Error::NotInitialized)?;
        let roots = merge_roots(&snapshot.roots, root.clone(), now);
        self.commit_with_provider_state(
            provider.as_ref(),
            kind,
            config.modify_index,
            roots,
            config,
            cancel,
        )
        .await?;

        info!(
            root_id = %root.id,
            signing_key_id = %root.signing_key_id,
            forced = force,
            "renewed intermediate certificate"
        );
        self.install(provider, kind, root);
        Ok(())
    }
}
