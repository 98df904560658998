//! A primary and a secondary datacenter wired together in one process

use std::sync::Arc;

use meshca::{CaManager, CaStore, InMemoryCaStore, LocalTransport, StaticLeadership};
use meshca_common::ManagerConfig;
use meshca_pki::cert::{signing_key_id, verify_signed_by};
use tokio_util::sync::CancellationToken;

use super::helpers::*;

async fn local_store() -> Arc<InMemoryCaStore> {
    let store = Arc::new(InMemoryCaStore::new());
    store.set_config(local_config()).await.unwrap();
    store
}

fn datacenter(
    config: ManagerConfig,
    store: Arc<InMemoryCaStore>,
    transport: Arc<LocalTransport>,
) -> Arc<CaManager> {
    Arc::new(
        CaManager::new(config, store, transport, Arc::new(StaticLeadership::default()))
            .unwrap()
            .with_provider_factory(Arc::new(LocalEverywhere)),
    )
}

#[tokio::test]
async fn story_secondary_issues_under_the_primary_root() {
    let cancel = CancellationToken::new();
    let transport = Arc::new(LocalTransport::new());
    let primary_store = local_store().await;
    let secondary_store = local_store().await;

    // Chapter 1: The primary datacenter creates the root
    let primary = datacenter(primary_config(), primary_store.clone(), transport.clone());
    transport.attach("dc1", &primary);
    primary.initialize(&cancel).await.unwrap();
    let root = primary.active_root().unwrap();

    // Chapter 2: The secondary joins and gets an intermediate from the primary
    let secondary = datacenter(secondary_config(), secondary_store.clone(), transport.clone());
    secondary.initialize(&cancel).await.unwrap();
    let joined = secondary.active_root().unwrap();
    assert_eq!(joined.id, root.id);
    assert_eq!(joined.intermediate_certs.len(), 1);
    let intermediate = joined.intermediate_certs[0].clone();
    assert!(verify_signed_by(&intermediate, &root.root_cert).unwrap());
    assert_eq!(joined.signing_key_id, signing_key_id(&intermediate).unwrap());

    // Chapter 3: Leaves issued in the secondary chain to the intermediate
    let (request, identity) = leaf_request("api");
    let leaf = secondary
        .sign_certificate(request.csr_pem(), &identity)
        .await
        .unwrap();
    assert!(verify_signed_by(&leaf, &intermediate).unwrap());
    assert!(!verify_signed_by(&leaf, &root.root_cert).unwrap());

    // Chapter 4: A forced renewal adds a second intermediate from the primary
    secondary.renew_intermediate(&cancel, true).await.unwrap();
    let renewed = secondary.active_root().unwrap();
    assert_eq!(renewed.id, root.id);
    assert_eq!(renewed.intermediate_certs.len(), 2);
    assert_eq!(renewed.intermediate_certs[0], intermediate);
    assert_ne!(renewed.signing_key_id, joined.signing_key_id);
    assert!(verify_signed_by(renewed.leaf_signing_cert(), &root.root_cert).unwrap());
    let snapshot = secondary_store.read().await.unwrap();
    let stored = snapshot.active_root().unwrap();
    assert_eq!(stored.intermediate_certs, renewed.intermediate_certs);
    assert_eq!(stored.signing_key_id, renewed.signing_key_id);

    // Chapter 5: Restarted managers pick up where they left off
    let restarted_primary = datacenter(primary_config(), primary_store.clone(), transport.clone());
    transport.attach("dc1", &restarted_primary);
    restarted_primary.initialize(&cancel).await.unwrap();
    assert_eq!(restarted_primary.active_root().unwrap().id, root.id);

    let restarted = datacenter(secondary_config(), secondary_store.clone(), transport.clone());
    restarted.initialize(&cancel).await.unwrap();
    let resumed = restarted.active_root().unwrap();
    assert_eq!(resumed.id, root.id);
    assert_eq!(resumed.signing_key_id, renewed.signing_key_id);
    assert_eq!(secondary_store.read().await.unwrap().roots.len(), 1);
}

#[tokio::test]
async fn primary_serves_its_roots_to_other_datacenters() {
    let cancel = CancellationToken::new();
    let transport = Arc::new(LocalTransport::new());
    let primary = datacenter(primary_config(), local_store().await, transport.clone());
    transport.attach("dc1", &primary);
    primary.initialize(&cancel).await.unwrap();

    let roots = primary.roots().await.unwrap();
    assert_eq!(roots.trust_domain, CLUSTER_ID);
    assert_eq!(
        roots.active().map(|r| r.id.clone()),
        primary.active_root().map(|r| r.id)
    );
}
