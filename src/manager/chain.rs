//! Trust chain bookkeeping for [`CaRoot`] records

use std::time::Duration;

use meshca_common::CaRoot;
use meshca_pki::cert::{signing_key_id, CertificateInfo};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::CertRole;
use crate::{Error, Result};

/// Append a new leaf-signing certificate to `root`'s chain
///
/// Intermediates already expired at `now` are dropped first. The signing
/// key id follows the new certificate.
pub(crate) fn append_signing_cert(root: &mut CaRoot, cert_pem: &str, now: OffsetDateTime) -> Result<()> {
    let key_id = signing_key_id(cert_pem)?;
    prune_expired(&mut root.intermediate_certs, now);
    root.intermediate_certs.push(cert_pem.to_string());
    root.signing_key_id = key_id;
    Ok(())
}

/// Remove certificates whose `NotAfter` has passed
///
/// Certificates that fail to parse are kept; dropping them could only
/// break verification of leaves that still chain through them.
pub(crate) fn prune_expired(certs: &mut Vec<String>, now: OffsetDateTime) {
    let before = certs.len();
    certs.retain(|pem| {
        CertificateInfo::from_pem(pem)
            .map(|info| !info.is_expired_at(now, Duration::ZERO))
            .unwrap_or(true)
    });
    if certs.len() != before {
        debug!(pruned = before - certs.len(), "dropped expired intermediates");
    }
}

/// Root set after `new_active` becomes the active root
///
/// A previous record with the same id is replaced. Any other active root is
/// kept for verification, marked inactive and stamped with `now`.
pub(crate) fn merge_roots(existing: &[CaRoot], new_active: CaRoot, now: OffsetDateTime) -> Vec<CaRoot> {
    let mut roots: Vec<CaRoot> = existing
        .iter()
        .filter(|r| r.id != new_active.id)
        .cloned()
        .map(|mut r| {
            if r.active {
                r.active = false;
                r.rotated_out_at = Some(now.unix_timestamp());
            }
            r
        })
        .collect();

    let mut new_active = new_active;
    new_active.active = true;
    new_active.rotated_out_at = None;
    if let Some(previous) = existing.iter().find(|r| r.id == new_active.id) {
        new_active.create_index = previous.create_index;
    }
    roots.push(new_active);
    roots
}

/// Certificate whose key matches `root.signing_key_id`
///
/// After a rotation the chain can hold a cross-signed copy of the new root
/// while the root itself still signs leaves, so position alone is not
/// enough. Records without a matching key id fall back to the last
/// intermediate, or the root when there is none.
pub(crate) fn leaf_signer(root: &CaRoot) -> &str {
    let matches = |pem: &str| {
        !root.signing_key_id.is_empty()
            && signing_key_id(pem).is_ok_and(|id| id == root.signing_key_id)
    };
    if matches(&root.root_cert) {
        return &root.root_cert;
    }
    root.intermediate_certs
        .iter()
        .rev()
        .find(|pem| matches(pem))
        .map(String::as_str)
        .unwrap_or_else(|| root.leaf_signing_cert())
}

/// Whether leaves are signed by the root certificate itself
pub(crate) fn root_signs_leaves(root: &CaRoot) -> bool {
    leaf_signer(root) == root.root_cert
}

/// Fail if any certificate used to sign leaves is expired at `now`
///
/// Checks the root, then the leaf signer if it is an intermediate. A
/// `NotBefore` in the future is accepted.
pub(crate) fn check_signing_chain(root: &CaRoot, now: OffsetDateTime, drift: Duration) -> Result<()> {
    let root_info = CertificateInfo::from_pem(&root.root_cert)?;
    if root_info.is_expired_at(now, drift) {
        return Err(Error::Expired {
            role: CertRole::Root,
            not_after: root_info.not_after_time(),
        });
    }

    if !root_signs_leaves(root) {
        let info = CertificateInfo::from_pem(leaf_signer(root))?;
        if info.is_expired_at(now, drift) {
            return Err(Error::Expired {
                role: CertRole::Intermediate,
                not_after: info.not_after_time(),
            });
        }
    }
    Ok(())
}
