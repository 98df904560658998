//! Stories about leaf issuance refusing expired signers

use std::sync::Arc;

use meshca::{CaManager, CertRole, Error};
use meshca_common::ProviderKind;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::helpers::*;

/// Initialized primary whose backend reports `signer` as its active
/// intermediate (the root itself when `None`)
async fn primary_signing_with(log: &CallLog, root: &TestCa, signer: Option<&TestCa>) -> CaManager {
    let mut provider = FakeProvider::new(log, &root.cert_pem);
    if let Some(signer) = signer {
        provider = provider.with_active(&signer.cert_pem);
    }
    let manager = manager(
        primary_config(),
        seeded_store(log, local_config(), None).await,
        Arc::new(NoForwarding),
        Arc::new(FixedProviders::default().with(ProviderKind::Local, Arc::new(provider))),
    );
    manager.initialize(&CancellationToken::new()).await.unwrap();
    manager
}

#[tokio::test]
async fn story_expired_root_stops_issuance() {
    let now = OffsetDateTime::now_utc();
    let log = CallLog::default();

    // Chapter 1: The root expired an hour ago
    let root = TestCa::root("expired root", now - hours(48), now - hours(1));
    let manager = primary_signing_with(&log, &root, None).await;

    // Chapter 2: A workload asks for a certificate and is refused before the backend is asked
    let (request, identity) = leaf_request("web");
    let err = manager
        .sign_certificate(request.csr_pem(), &identity)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Expired {
            role: CertRole::Root,
            ..
        }
    ));
    assert!(err
        .to_string()
        .starts_with("root expired: certificate expired, expiration date:"));
    assert_eq!(log.count("provider.sign"), 0);
}

#[tokio::test]
async fn story_expired_intermediate_stops_issuance() {
    let now = OffsetDateTime::now_utc();
    let log = CallLog::default();

    // Chapter 1: The root is fine but the intermediate ran out
    let root = TestCa::fresh_root("root", hours(24 * 365));
    let intermediate = root.intermediate("intermediate", now - hours(48), now - hours(1));
    let manager = primary_signing_with(&log, &root, Some(&intermediate)).await;
    assert_eq!(
        manager.active_signing_cert(),
        Some(intermediate.cert_pem.clone())
    );

    // Chapter 2: Signing fails naming the intermediate
    let (request, identity) = leaf_request("web");
    let err = manager
        .sign_certificate(request.csr_pem(), &identity)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Expired {
            role: CertRole::Intermediate,
            ..
        }
    ));
    assert!(err.to_string().starts_with("intermediate expired"));
    assert!(!err.is_retryable());
    assert_eq!(log.count("provider.sign"), 0);
}

#[tokio::test]
async fn intermediate_inside_drift_buffer_counts_as_expired() {
    let now = OffsetDateTime::now_utc();
    let log = CallLog::default();
    let root = TestCa::fresh_root("root", hours(24 * 365));
    let intermediate = root.intermediate(
        "intermediate",
        now - hours(1),
        now + time::Duration::seconds(30),
    );
    let manager = primary_signing_with(&log, &root, Some(&intermediate)).await;

    let (request, identity) = leaf_request("web");
    assert!(matches!(
        manager.sign_certificate(request.csr_pem(), &identity).await,
        Err(Error::Expired {
            role: CertRole::Intermediate,
            ..
        })
    ));
}

#[tokio::test]
async fn story_not_yet_valid_signer_is_accepted() {
    let now = OffsetDateTime::now_utc();
    let log = CallLog::default();

    // Chapter 1: The intermediate's NotBefore is an hour in the future
    let root = TestCa::fresh_root("root", hours(24 * 365));
    let intermediate = root.intermediate("intermediate", now + hours(1), now + hours(24));
    let manager = primary_signing_with(&log, &root, Some(&intermediate)).await;

    // Chapter 2: Signing goes ahead
    let (request, identity) = leaf_request("web");
    manager
        .sign_certificate(request.csr_pem(), &identity)
        .await
        .unwrap();
    assert_eq!(log.count("provider.sign"), 1);
}

#[tokio::test]
async fn root_expiring_by_the_injected_clock_is_refused() {
    let log = CallLog::default();
    let root = TestCa::fresh_root("root", hours(24));
    let manager = primary_signing_with(&log, &root, None).await;
    let manager = manager.with_clock(Arc::new(|| OffsetDateTime::now_utc() + hours(48)));

    let (request, identity) = leaf_request("web");
    assert!(matches!(
        manager.sign_certificate(request.csr_pem(), &identity).await,
        Err(Error::Expired {
            role: CertRole::Root,
            ..
        })
    ));
}

#[tokio::test]
async fn story_root_not_yet_valid_still_signs() {
    let now = OffsetDateTime::now_utc();
    let log = CallLog::default();

    // Chapter 1: The root's NotBefore is an hour ahead, as after a clock step
    let root = TestCa::root("future root", now + hours(1), now + hours(24));
    let manager = primary_signing_with(&log, &root, None).await;
    assert_eq!(manager.active_signing_cert(), Some(root.cert_pem.clone()));

    // Chapter 2: Only expiry stops issuance, so signing goes ahead
    let (request, identity) = leaf_request("web");
    manager
        .sign_certificate(request.csr_pem(), &identity)
        .await
        .unwrap();
    assert_eq!(log.count("provider.sign"), 1);
}
