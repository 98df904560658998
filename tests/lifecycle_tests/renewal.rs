//! Stories about when intermediate renewal happens

use std::sync::Arc;
use std::time::Duration;

use meshca::{CaManager, CaStore, Clock, RenewalScheduler};
use meshca_common::ProviderKind;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::helpers::*;

fn clock_ahead(offset: time::Duration) -> Clock {
    Arc::new(move || OffsetDateTime::now_utc() + offset)
}

struct Secondary {
    log: CallLog,
    primary: Arc<ScriptedPrimary>,
    store: Arc<RecordingStore>,
    root: TestCa,
    first: TestCa,
}

/// Secondary whose intermediate was issued an hour ago for 30 days
async fn secondary_setup() -> Secondary {
    let now = OffsetDateTime::now_utc();
    let log = CallLog::default();
    let root = TestCa::fresh_root("root X", hours(24 * 365));
    let first = root.intermediate("first", now - hours(1), now + hours(24 * 30) - hours(1));
    let primary = Arc::new(ScriptedPrimary::new(&log, indexed(root.record()), &first.cert_pem));
    let store = seeded_store(&log, local_config(), None).await;
    Secondary {
        log,
        primary,
        store,
        root,
        first,
    }
}

fn secondary_manager(setup: &Secondary, clock: Option<Clock>) -> CaManager {
    let provider = Arc::new(FakeProvider::new(&setup.log, &setup.root.cert_pem));
    let manager = manager(
        secondary_config(),
        setup.store.clone(),
        setup.primary.clone(),
        Arc::new(FixedProviders::default().with(ProviderKind::Local, provider)),
    );
    match clock {
        Some(clock) => manager.with_clock(clock),
        None => manager,
    }
}

#[tokio::test]
async fn story_renewal_with_ample_validity_does_nothing() {
    let setup = secondary_setup().await;
    let manager = secondary_manager(&setup, None);
    let cancel = CancellationToken::new();
    manager.initialize(&cancel).await.unwrap();
    let before = setup.store.read().await.unwrap();

    // Chapter 1: The timer fires well before the renewal threshold
    setup.log.clear();
    manager.renew_intermediate(&cancel, false).await.unwrap();

    // Chapter 2: No backend call, no forward, no write
    assert!(setup.log.calls().is_empty());
    assert_eq!(setup.store.read().await.unwrap(), before);
}

#[tokio::test]
async fn story_secondary_renews_past_the_threshold() {
    let setup = secondary_setup().await;

    // Chapter 1: Twenty days in, the 30-day intermediate is past half its life
    let manager = secondary_manager(&setup, Some(clock_ahead(hours(24 * 20))));
    let cancel = CancellationToken::new();
    manager.initialize(&cancel).await.unwrap();

    let now = OffsetDateTime::now_utc();
    let second = setup
        .root
        .intermediate("second", now - hours(1), now + hours(24 * 60));
    setup.primary.will_sign(&second.cert_pem);
    setup.log.clear();

    manager.renew_intermediate(&cancel, false).await.unwrap();

    // Chapter 2: The primary signed a new intermediate and it was stored once
    assert_eq!(
        setup.log.only(&[
            "provider.generate_intermediate_csr",
            "transport.ConnectCA.SignIntermediate",
            "provider.set_intermediate",
            "store.set_roots_and_config",
        ]),
        vec![
            "provider.generate_intermediate_csr",
            "transport.ConnectCA.SignIntermediate",
            "provider.set_intermediate",
            "store.set_roots_and_config",
        ]
    );

    // Chapter 3: The old intermediate stays in the chain until it expires
    let root = setup.store.read().await.unwrap().active_root().cloned().unwrap();
    assert_eq!(
        root.intermediate_certs,
        vec![setup.first.cert_pem.clone(), second.cert_pem.clone()]
    );
    assert_eq!(manager.active_signing_cert(), Some(second.cert_pem.clone()));
}

#[tokio::test]
async fn story_root_only_primary_renews_only_when_forced() {
    let now = OffsetDateTime::now_utc();
    let log = CallLog::default();
    let root = TestCa::fresh_root("root", hours(24 * 10));
    let intermediate = root.intermediate(
        "intermediate",
        now - hours(1),
        now + hours(24 * 10) - hours(2),
    );
    let provider = Arc::new(
        FakeProvider::new(&log, &root.cert_pem).with_next_intermediate(&intermediate.cert_pem),
    );
    let store = seeded_store(&log, local_config(), None).await;
    let manager = manager(
        primary_config(),
        store.clone(),
        Arc::new(NoForwarding),
        Arc::new(FixedProviders::default().with(ProviderKind::Local, provider)),
    )
    .with_clock(clock_ahead(hours(24 * 9)));
    let cancel = CancellationToken::new();
    manager.initialize(&cancel).await.unwrap();

    // Chapter 1: The root signs leaves itself; an unforced renewal has nothing to do
    manager.renew_intermediate(&cancel, false).await.unwrap();
    assert_eq!(log.count("provider.generate_intermediate"), 0);

    // Chapter 2: An operator forces one and leaves move to an intermediate
    manager.renew_intermediate(&cancel, true).await.unwrap();
    assert_eq!(log.count("provider.generate_intermediate"), 1);
    let stored = store.read().await.unwrap();
    let active = stored.active_root().unwrap();
    assert_eq!(active.intermediate_certs, vec![intermediate.cert_pem.clone()]);
    assert_eq!(manager.active_signing_cert(), Some(intermediate.cert_pem.clone()));
}

#[tokio::test]
async fn story_scheduler_renews_on_its_own() {
    let setup = secondary_setup().await;
    let manager = Arc::new(secondary_manager(&setup, Some(clock_ahead(hours(24 * 20)))));
    let cancel = CancellationToken::new();
    manager.initialize(&cancel).await.unwrap();

    let now = OffsetDateTime::now_utc();
    let second = setup
        .root
        .intermediate("second", now - hours(1), now + hours(24 * 60));
    setup.primary.will_sign(&second.cert_pem);

    // Chapter 1: The scheduler ticks and notices the intermediate is due
    let handle = RenewalScheduler::spawn(manager.clone(), Duration::from_millis(20), cancel.clone());
    let renewed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if manager.active_signing_cert() == Some(second.cert_pem.clone()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(renewed.is_ok(), "scheduler did not renew the intermediate");

    // Chapter 2: Cancelling the token stops the loop
    cancel.cancel();
    handle.await.unwrap();
}
