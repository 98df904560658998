//! Stories about a secondary datacenter obtaining its signing intermediate

use std::sync::Arc;

use meshca::{CaStore, LifecycleState};
use meshca_common::ProviderKind;
use meshca_pki::cert::signing_key_id;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::helpers::*;

const ORDERED_CALLS: [&str; 5] = [
    "transport.ConnectCA.Roots",
    "provider.generate_intermediate_csr",
    "transport.ConnectCA.SignIntermediate",
    "provider.set_intermediate",
    "store.set_roots_and_config",
];

#[tokio::test]
async fn story_secondary_initialize_chains_to_primary_root() {
    let now = OffsetDateTime::now_utc();
    let log = CallLog::default();

    // Chapter 1: The primary datacenter owns root X and will sign the
    // secondary's CSR as intermediate Y
    let x = TestCa::fresh_root("root X", hours(24 * 365));
    let y = x.intermediate("intermediate Y", now - hours(1), now + hours(24 * 30));
    let primary = Arc::new(ScriptedPrimary::new(&log, indexed(x.record()), &y.cert_pem));

    // Chapter 2: The secondary starts with configuration but no roots
    let provider = Arc::new(FakeProvider::new(&log, &x.cert_pem));
    let store = seeded_store(&log, local_config(), None).await;
    let secondary = manager(
        secondary_config(),
        store.clone(),
        primary,
        Arc::new(FixedProviders::default().with(ProviderKind::Local, provider)),
    );

    secondary.initialize(&CancellationToken::new()).await.unwrap();
    assert_eq!(secondary.state(), LifecycleState::Initialized);

    // Chapter 3: Every step ran exactly once, in order
    assert_eq!(log.only(&ORDERED_CALLS), ORDERED_CALLS.to_vec());
    let writes: Vec<String> = log
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("store."))
        .collect();
    assert_eq!(writes, vec!["store.set_roots_and_config"]);

    // Chapter 4: The stored root is X and leaves are signed by Y
    let snapshot = store.read().await.unwrap();
    assert_eq!(snapshot.roots.len(), 1);
    let root = snapshot.active_root().unwrap();
    assert_eq!(root.root_cert, x.cert_pem);
    assert_eq!(root.id, x.record().id);
    assert_eq!(root.intermediate_certs, vec![y.cert_pem.clone()]);
    assert_eq!(root.signing_key_id, signing_key_id(&y.cert_pem).unwrap());
    assert_eq!(secondary.active_signing_cert(), Some(y.cert_pem.clone()));
}

#[tokio::test]
async fn story_restarted_secondary_keeps_its_intermediate() {
    let now = OffsetDateTime::now_utc();
    let log = CallLog::default();
    let x = TestCa::fresh_root("root X", hours(24 * 365));
    let y = x.intermediate("intermediate Y", now - hours(1), now + hours(24 * 30));

    // Chapter 1: The store already holds X with Y from a previous run
    let mut stored = x.record();
    stored.intermediate_certs = vec![y.cert_pem.clone()];
    stored.signing_key_id = signing_key_id(&y.cert_pem).unwrap();
    let store = seeded_store(&log, local_config(), Some(stored)).await;

    // Chapter 2: The backend reloads Y from its persisted state
    let provider = Arc::new(FakeProvider::new(&log, &x.cert_pem).with_active(&y.cert_pem));
    let primary = Arc::new(ScriptedPrimary::new(&log, indexed(x.record()), "unused"));
    let secondary = manager(
        secondary_config(),
        store.clone(),
        primary,
        Arc::new(FixedProviders::default().with(ProviderKind::Local, provider)),
    );

    secondary.initialize(&CancellationToken::new()).await.unwrap();

    // Chapter 3: Nothing was signed or written
    assert_eq!(log.count("transport.ConnectCA.Roots"), 1);
    assert_eq!(log.count("transport.ConnectCA.SignIntermediate"), 0);
    assert_eq!(log.count("provider.generate_intermediate_csr"), 0);
    assert_eq!(log.count("store.set_roots_and_config"), 0);
    assert_eq!(
        secondary.active_root().as_ref(),
        store.read().await.unwrap().active_root()
    );
}

#[tokio::test]
async fn story_secondary_follows_a_rotated_primary_root() {
    let now = OffsetDateTime::now_utc();
    let log = CallLog::default();

    // Chapter 1: The secondary last stored old root W
    let w = TestCa::fresh_root("root W", hours(24 * 365));
    let store = seeded_store(&log, local_config(), Some(w.record())).await;

    // Chapter 2: Meanwhile the primary moved to root X
    let x = TestCa::fresh_root("root X", hours(24 * 365));
    let y = x.intermediate("intermediate Y", now - hours(1), now + hours(24 * 30));
    let primary = Arc::new(ScriptedPrimary::new(&log, indexed(x.record()), &y.cert_pem));
    let provider = Arc::new(FakeProvider::new(&log, &x.cert_pem));
    let secondary = manager(
        secondary_config(),
        store.clone(),
        primary,
        Arc::new(FixedProviders::default().with(ProviderKind::Local, provider)),
    );

    secondary.initialize(&CancellationToken::new()).await.unwrap();

    // Chapter 3: X is active, W is kept for verification but retired
    let snapshot = store.read().await.unwrap();
    assert_eq!(snapshot.roots.len(), 2);
    let active: Vec<_> = snapshot.roots.iter().filter(|r| r.active).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, x.record().id);
    let retired = snapshot.roots.iter().find(|r| r.id == w.record().id).unwrap();
    assert!(!retired.active);
    assert!(retired.rotated_out_at.is_some());
}
