//! Stories about configuration changes and root rotation

use std::sync::Arc;

use meshca::{CaManager, CaStore, Error, LifecycleState};
use meshca_common::{CaConfiguration, ProviderKind};
use meshca_pki::cert::{signing_key_id, verify_signed_by};
use meshca_pki::{CertificateInfo, Provider};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::helpers::*;

fn local_primary(store: Arc<RecordingStore>) -> Arc<CaManager> {
    Arc::new(manager(
        primary_config(),
        store,
        Arc::new(NoForwarding),
        Arc::new(LocalEverywhere),
    ))
}

#[tokio::test]
async fn story_switching_backends_cross_signs_the_new_root() {
    let log = CallLog::default();
    let store = seeded_store(&log, local_config(), None).await;
    let manager = local_primary(store.clone());
    let cancel = CancellationToken::new();

    // Chapter 1: The cluster starts on the local backend with a root-only chain
    manager.initialize(&cancel).await.unwrap();
    let old_root = manager.active_root().unwrap();
    assert!(old_root.intermediate_certs.is_empty());

    // Chapter 2: An operator switches to a different backend
    manager
        .update_configuration(&cancel, CaConfiguration::new(CLUSTER_ID, ProviderKind::Vault))
        .await
        .unwrap();
    assert_eq!(manager.state(), LifecycleState::Initialized);
    assert_eq!(manager.provider_kind(), Some(ProviderKind::Vault));

    // Chapter 3: The new root carries the cross-signature plus one fresh signer
    let new_root = manager.active_root().unwrap();
    assert_ne!(new_root.id, old_root.id);
    assert_eq!(new_root.intermediate_certs.len(), 2);
    let cross_signed = &new_root.intermediate_certs[0];
    let signer = &new_root.intermediate_certs[1];
    assert!(verify_signed_by(cross_signed, &old_root.root_cert).unwrap());
    assert!(verify_signed_by(signer, &new_root.root_cert).unwrap());

    // Chapter 4: The old root is retired, not dropped
    let snapshot = store.read().await.unwrap();
    assert_eq!(snapshot.roots.len(), 2);
    assert_eq!(snapshot.active_root().unwrap().id, new_root.id);
    let retired = snapshot.roots.iter().find(|r| r.id == old_root.id).unwrap();
    assert!(!retired.active);
    assert!(retired.rotated_out_at.is_some());
    assert_eq!(snapshot.config.unwrap().provider, ProviderKind::Vault);

    // Chapter 5: The outgoing backend's state is gone, the new one is stored
    assert!(store.provider_state("local/dc1").await.unwrap().is_none());
    assert!(store.provider_state("vault/dc1").await.unwrap().is_some());
    assert_eq!(log.count("store.delete_provider_state(local/dc1)"), 1);

    // Chapter 6: Leaves now chain through the new signer
    let (request, identity) = leaf_request("web");
    let leaf = manager
        .sign_certificate(request.csr_pem(), &identity)
        .await
        .unwrap();
    assert!(verify_signed_by(&leaf, signer).unwrap());
}

#[tokio::test]
async fn story_unchanged_configuration_is_a_no_op() {
    let log = CallLog::default();
    let store = seeded_store(&log, local_config(), None).await;
    let manager = local_primary(store.clone());
    let cancel = CancellationToken::new();
    manager.initialize(&cancel).await.unwrap();
    log.clear();

    manager
        .update_configuration(&cancel, local_config())
        .await
        .unwrap();
    assert!(log.calls().is_empty());
}

#[tokio::test]
async fn story_setting_change_keeps_the_root() {
    let log = CallLog::default();
    let store = seeded_store(&log, local_config(), None).await;
    let manager = local_primary(store.clone());
    let cancel = CancellationToken::new();
    manager.initialize(&cancel).await.unwrap();
    let root = manager.active_root().unwrap();
    log.clear();

    // Chapter 1: Shorter leaves, same backend; a different cluster id is ignored
    let mut request = local_config().with_setting("LeafCertTTL", "1h");
    request.cluster_id = "some-other-cluster".to_string();
    manager.update_configuration(&cancel, request).await.unwrap();

    // Chapter 2: One write, same roots, new settings
    assert_eq!(log.count("store.set_roots_and_config"), 1);
    let snapshot = store.read().await.unwrap();
    assert_eq!(snapshot.roots.len(), 1);
    assert_eq!(snapshot.active_root().unwrap().id, root.id);
    let config = snapshot.config.unwrap();
    assert_eq!(config.cluster_id, CLUSTER_ID);
    assert_eq!(config.setting_str("LeafCertTTL"), Some("1h"));
    assert_eq!(manager.active_root().unwrap().id, root.id);

    // Chapter 3: New leaves get the shorter lifetime
    let (request, identity) = leaf_request("web");
    let leaf = manager
        .sign_certificate(request.csr_pem(), &identity)
        .await
        .unwrap();
    let info = CertificateInfo::from_pem(&leaf).unwrap();
    assert!(info.lifetime_secs() <= 3600 + 60);
}

#[tokio::test]
async fn story_rotation_without_cross_signing_needs_force() {
    let now = OffsetDateTime::now_utc();
    let log = CallLog::default();
    let old_root = TestCa::fresh_root("old root", hours(24 * 365));
    let new_root = TestCa::fresh_root("new root", hours(24 * 365));
    let new_signer = new_root.intermediate("new signer", now - hours(1), now + hours(24 * 30));

    let providers = FixedProviders::default()
        .with(
            ProviderKind::Local,
            Arc::new(FakeProvider::new(&log, &old_root.cert_pem).without_cross_signing()),
        )
        .with(
            ProviderKind::Vault,
            Arc::new(
                FakeProvider::new(&log, &new_root.cert_pem)
                    .with_next_intermediate(&new_signer.cert_pem),
            ),
        );
    let store = seeded_store(&log, local_config(), None).await;
    let manager = manager(
        primary_config(),
        store.clone(),
        Arc::new(NoForwarding),
        Arc::new(providers),
    );
    let cancel = CancellationToken::new();
    manager.initialize(&cancel).await.unwrap();
    let before = store.read().await.unwrap();

    // Chapter 1: The outgoing backend cannot cross-sign, so the switch is refused
    let err = manager
        .update_configuration(&cancel, CaConfiguration::new(CLUSTER_ID, ProviderKind::Vault))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(log.count("provider.cross_sign_ca"), 0);
    assert_eq!(log.count("provider.cleanup(type_changed=true)"), 1);
    assert_eq!(store.read().await.unwrap(), before);
    assert_eq!(manager.provider_kind(), Some(ProviderKind::Local));

    // Chapter 2: With force the rotation goes through without a cross-signature
    let mut forced = CaConfiguration::new(CLUSTER_ID, ProviderKind::Vault);
    forced.force_without_cross_signing = true;
    manager.update_configuration(&cancel, forced).await.unwrap();

    let active = manager.active_root().unwrap();
    assert_eq!(active.root_cert, new_root.cert_pem);
    assert_eq!(active.intermediate_certs, vec![new_signer.cert_pem.clone()]);
    assert_eq!(log.count("provider.cleanup(type_changed=true)"), 2);
}

#[tokio::test]
async fn story_concurrent_updates_one_wins() {
    let log = CallLog::default();
    let store = seeded_store(&log, local_config(), None).await;

    // Chapter 1: Two managers share one store and the same root
    let first = local_primary(store.clone());
    let second = local_primary(store.clone());
    let cancel = CancellationToken::new();
    first.initialize(&cancel).await.unwrap();
    second.initialize(&cancel).await.unwrap();
    assert_eq!(first.active_root(), second.active_root());

    // Chapter 2: Both read the configuration before either writes
    store.hold_reads(2);
    let attempts: Vec<_> = [("1h", first.clone()), ("2h", second.clone())]
        .into_iter()
        .map(|(ttl, manager)| {
            tokio::spawn(async move {
                let result = manager
                    .update_configuration(
                        &CancellationToken::new(),
                        local_config().with_setting("LeafCertTTL", ttl),
                    )
                    .await;
                (ttl, result)
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            (ttl, Ok(())) => winners.push(ttl),
            (_, Err(Error::Conflict(_))) => conflicts += 1,
            (_, Err(e)) => panic!("unexpected error: {e}"),
        }
    }

    // Chapter 3: Exactly one applied and the store shows only its change
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 1);
    store.release_reads();
    let config = store.read().await.unwrap().config.unwrap();
    assert_eq!(config.setting_str("LeafCertTTL"), Some(winners[0]));
}

#[tokio::test]
async fn story_secondary_backend_without_the_key_gets_a_new_intermediate() {
    let now = OffsetDateTime::now_utc();
    let log = CallLog::default();
    let x = TestCa::fresh_root("root X", hours(24 * 365));
    let y = x.intermediate("intermediate Y", now - hours(1), now + hours(24 * 30));
    let y2 = x.intermediate("intermediate Y2", now - hours(1), now + hours(24 * 30));
    let primary = Arc::new(ScriptedPrimary::new(&log, indexed(x.record()), &y.cert_pem));

    // Chapter 1: The secondary comes up on backend A with intermediate Y
    let first = Arc::new(FakeProvider::new(&log, &x.cert_pem));
    let replacement_log = CallLog::default();
    let replacement = Arc::new(FakeProvider::new(&replacement_log, &x.cert_pem));
    let keeper_log = CallLog::default();
    let keeper = Arc::new(FakeProvider::new(&keeper_log, &x.cert_pem).with_active(&y2.cert_pem));
    let providers = SequencedProviders::default()
        .then(first)
        .then(replacement.clone())
        .then(keeper);
    let store = seeded_store(&log, local_config(), None).await;
    let secondary = manager(secondary_config(), store.clone(), primary.clone(), Arc::new(providers));
    let cancel = CancellationToken::new();
    secondary.initialize(&cancel).await.unwrap();
    assert_eq!(secondary.active_signing_cert(), Some(y.cert_pem.clone()));

    // Chapter 2: A setting change lands on backend B, which never held Y's key
    primary.will_sign(&y2.cert_pem);
    secondary
        .update_configuration(&cancel, local_config().with_setting("LeafCertTTL", "1h"))
        .await
        .unwrap();

    // Chapter 3: B got its own intermediate from the primary under the same root
    assert_eq!(replacement_log.count("provider.generate_intermediate_csr"), 1);
    assert_eq!(replacement_log.count("provider.set_intermediate"), 1);
    assert_eq!(replacement.active_intermediate().await.unwrap(), y2.cert_pem);
    assert_eq!(secondary.active_signing_cert(), Some(y2.cert_pem.clone()));

    let active = secondary.active_root().unwrap();
    assert_eq!(active.id, x.record().id);
    assert_eq!(active.intermediate_certs, vec![y.cert_pem.clone(), y2.cert_pem.clone()]);
    assert_eq!(active.signing_key_id, signing_key_id(&y2.cert_pem).unwrap());
    let snapshot = store.read().await.unwrap();
    assert_eq!(snapshot.roots.len(), 1);
    let stored = snapshot.active_root().unwrap();
    assert_eq!(stored.intermediate_certs, active.intermediate_certs);
    assert_eq!(stored.signing_key_id, active.signing_key_id);

    // Chapter 4: A backend that already holds Y2's key only takes the new settings
    let signed = log.count("transport.ConnectCA.SignIntermediate");
    secondary
        .update_configuration(&cancel, local_config().with_setting("LeafCertTTL", "2h"))
        .await
        .unwrap();
    assert_eq!(keeper_log.count("provider.generate_intermediate_csr"), 0);
    assert_eq!(log.count("transport.ConnectCA.SignIntermediate"), signed);
    assert_eq!(secondary.active_root().unwrap(), active);
}
