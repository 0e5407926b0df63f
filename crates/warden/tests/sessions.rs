//! Session brokering: get/release pairing, loss handling, and the
//! one-shot method-call path.

use std::sync::Arc;

use warden::proxy::members;
use warden::testing::{accept_all_manifests, MockPeer};
use warden::{Error, ProxyObjectManager, SecurityManager, SecurityManagerConfig};
use warden_bus::{AuthMechanism, BusAttachment, BusError};
use warden_model::SigningKey;
use warden_store::SqliteStore;

fn broker_for(peer: &Arc<MockPeer>) -> ProxyObjectManager {
    let bus: Arc<dyn BusAttachment> = peer.clone();
    ProxyObjectManager::new(bus, "/net/warden/PermissionMgmt", "net.warden.PermissionMgmt")
}

#[tokio::test]
async fn get_release_is_symmetric() {
    let peer = Arc::new(MockPeer::claimable());
    let broker = broker_for(&peer);
    let app = peer.application_info();

    assert_eq!(peer.open_sessions(), 0);

    let proxy = broker
        .get_proxy_object(&app, AuthMechanism::EcdheNull)
        .await
        .unwrap();
    // Exactly one session resource was consumed.
    assert_eq!(peer.open_sessions(), 1);
    assert_eq!(broker.active_sessions(), 1);

    broker.release_proxy_object(proxy).await.unwrap();
    // And it returned to its prior value after the matching release.
    assert_eq!(peer.open_sessions(), 0);
    assert_eq!(broker.active_sessions(), 0);
}

#[tokio::test]
async fn lost_session_fails_fast() {
    let peer = Arc::new(MockPeer::claimable());
    let broker = broker_for(&peer);
    let app = peer.application_info();

    let proxy = broker
        .get_proxy_object(&app, AuthMechanism::EcdheNull)
        .await
        .unwrap();
    let session = proxy.session();

    peer.lose_session(session);
    // Give the watcher task a chance to see the event.
    tokio::task::yield_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // The next operation on the outstanding handle fails immediately and
    // informatively instead of hanging into a transport timeout.
    let err = proxy.get_manifest().await.unwrap_err();
    assert!(
        matches!(err, Error::Bus(BusError::SessionLost(id)) if id == session),
        "got {err:?}"
    );

    // Releasing the dead handle is still required and still succeeds.
    broker.release_proxy_object(proxy).await.unwrap();
    assert_eq!(broker.active_sessions(), 0);
}

#[tokio::test]
async fn peer_death_invalidates_outstanding_handles() {
    let peer = Arc::new(MockPeer::claimable());
    let broker = broker_for(&peer);
    let app = peer.application_info();

    let proxy = broker
        .get_proxy_object(&app, AuthMechanism::EcdheNull)
        .await
        .unwrap();

    peer.kill();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert!(matches!(
        proxy.get_public_key().await.unwrap_err(),
        Error::Bus(BusError::SessionLost(_))
    ));
    broker.release_proxy_object(proxy).await.unwrap();
}

#[tokio::test]
async fn method_call_releases_even_on_refusal() {
    let peer = Arc::new(MockPeer::claimable());
    let broker = broker_for(&peer);
    let app = peer.application_info();

    peer.deny(members::GET_MANIFEST);
    let err = broker
        .method_call(&app, members::GET_MANIFEST, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied));

    // The refused call still released its session.
    assert_eq!(peer.open_sessions(), 0);
    assert_eq!(broker.active_sessions(), 0);
}

#[tokio::test]
async fn method_call_selects_mechanism_by_member() {
    let peer = Arc::new(MockPeer::claimable());
    let broker = broker_for(&peer);
    let app = peer.application_info();

    // GetManifest is a claim-window member and may use ECDHE_NULL.
    let reply = broker
        .method_call(&app, members::GET_MANIFEST, vec![])
        .await
        .unwrap();
    assert!(!reply.is_empty());

    // A claimed peer refuses anonymous sessions, so the same call against
    // it must fail during session setup if NULL were still selected; the
    // broker uses ECDSA for post-claim members instead.
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let bus: Arc<dyn BusAttachment> = peer.clone();
    let manager = SecurityManager::new(
        bus,
        store,
        SigningKey::generate().unwrap(),
        SecurityManagerConfig::default(),
    )
    .unwrap();
    let identity = manager.create_identity("admin");
    manager.store_identity(&identity, false).unwrap();
    let claimed = manager
        .claim_application(&app, identity.guid, accept_all_manifests)
        .await
        .unwrap();

    let reply = broker
        .method_call(&claimed, members::GET_POLICY, vec![])
        .await;
    // No policy installed yet: the peer answers with an ordinary error
    // reply, which proves the ECDSA session itself was accepted.
    assert!(matches!(reply, Err(Error::Bus(BusError::ErrorReply { .. }))));
}

#[tokio::test]
async fn anonymous_exchange_refused_after_claim() {
    let peer = Arc::new(MockPeer::claimable());
    let broker = broker_for(&peer);
    let app = peer.application_info();

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let bus: Arc<dyn BusAttachment> = peer.clone();
    let manager = SecurityManager::new(
        bus,
        store,
        SigningKey::generate().unwrap(),
        SecurityManagerConfig::default(),
    )
    .unwrap();
    let identity = manager.create_identity("admin");
    manager.store_identity(&identity, false).unwrap();
    manager
        .claim_application(&app, identity.guid, accept_all_manifests)
        .await
        .unwrap();

    // The claim window is over: ECDHE_NULL no longer buys a session.
    let err = broker
        .get_proxy_object(&app, AuthMechanism::EcdheNull)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Bus(BusError::Connection(_))));
}
