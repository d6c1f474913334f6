//! Integration tests for death cascades, reconnection and user switches.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use common::{
    app_caller, eventually, input_of, next_notification, snapshot_until, system_caller,
    tuner_entry, Harness, TestClient,
};
use tokio::time::sleep;
use tvim_core::{CallerIdentity, InputState, UserId};
use tvim_provider::{Peer, SessionOp};
use tvimd::broker::{BrokerError, ClientEvent, InputNotification, RegistryCallback};
use tvimd::watch_log::{WatchLogStore, WatchRecord};

const TUNER: &str = "com.example.tuner";

// ============================================================================
// Death cascades
// ============================================================================

#[tokio::test]
async fn test_client_death_releases_its_sessions() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let client = TestClient::new("doomed");
    let bystander = TestClient::new("bystander");
    let caller = system_caller();

    harness.open_session(&caller, &client, TUNER, 0).await.unwrap();
    harness.open_session(&caller, &client, TUNER, 1).await.unwrap();
    let survivor = harness
        .open_session(&caller, &bystander, TUNER, 0)
        .await
        .unwrap();

    client.peer.kill();

    let snapshot = snapshot_until(&harness.broker, "dead client's sessions gone", |s| {
        s.user(UserId::SYSTEM).unwrap().sessions.len() == 1
    })
    .await;
    let user = snapshot.user(UserId::SYSTEM).unwrap();
    assert!(user.session(survivor).is_some());
    assert_eq!(user.clients.len(), 1);

    let journal = harness.connector.journal().clone();
    eventually("both sessions released", || {
        journal.executed(1) == vec![SessionOp::Release]
            && journal.executed(2) == vec![SessionOp::Release]
    })
    .await;
    assert!(journal.executed(3).is_empty());
}

#[tokio::test]
async fn test_provider_crash_notifies_owner_once() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let client = TestClient::new("app");
    let token = harness
        .open_session(&system_caller(), &client, TUNER, 5)
        .await
        .unwrap();

    harness
        .connector
        .provider(TUNER, UserId::SYSTEM)
        .expect("provider should be running")
        .crash();

    match client.next_event().await {
        ClientEvent::SessionReleased { token: t, seq } => {
            assert_eq!(t, token);
            assert_eq!(seq, 5);
        }
        other => panic!("expected SessionReleased, got {other:?}"),
    }
    assert!(client.try_next_event().await.is_none());

    snapshot_until(&harness.broker, "crashed session removed", |s| {
        s.user(UserId::SYSTEM).unwrap().sessions.is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_callback_death_unregisters() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let peer = Peer::new("callback");
    let (callback, _rx) = RegistryCallback::new(peer.clone());

    harness
        .broker
        .register_callback(system_caller(), UserId::CURRENT, callback)
        .await
        .unwrap();
    let snapshot = harness.broker.snapshot().await.unwrap();
    assert_eq!(snapshot.user(UserId::SYSTEM).unwrap().callbacks, 1);

    peer.kill();
    snapshot_until(&harness.broker, "callback removed", |s| {
        s.user(UserId::SYSTEM).unwrap().callbacks == 0
    })
    .await;
}

// ============================================================================
// Reconnection
// ============================================================================

#[tokio::test]
async fn test_reconnecting_provider_refuses_until_drained() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let client = TestClient::new("app");
    let caller = system_caller();
    let live = harness.open_session(&caller, &client, TUNER, 0).await.unwrap();

    harness.connector.disconnect(TUNER, UserId::SYSTEM);

    let refused = harness.open_session(&caller, &client, TUNER, 1).await;
    assert_eq!(refused, None, "no sessions while reconnecting");

    let snapshot = harness.broker.snapshot().await.unwrap();
    let user = snapshot.user(UserId::SYSTEM).unwrap();
    let service = user.service(&common::component(TUNER)).unwrap();
    assert!(service.reconnecting);
    assert!(user.session(live).is_some(), "live sessions survive a lost connection");

    harness
        .broker
        .release_session(caller.clone(), UserId::CURRENT, live)
        .await
        .unwrap();

    let fresh = harness.open_session(&caller, &client, TUNER, 2).await;
    assert!(fresh.is_some(), "drained provider binds again");
    assert_eq!(harness.connector.binds(), 2);
}

#[tokio::test]
async fn test_lost_connection_keeps_input_state() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let client = TestClient::new("app");
    let caller = system_caller();
    let (callback, mut rx) = RegistryCallback::new(Peer::new("watcher"));
    harness
        .broker
        .register_callback(caller.clone(), UserId::CURRENT, callback)
        .await
        .unwrap();
    let live = harness.open_session(&caller, &client, TUNER, 0).await.unwrap();

    harness.connector.disconnect(TUNER, UserId::SYSTEM);
    snapshot_until(&harness.broker, "provider reconnecting", |s| {
        s.user(UserId::SYSTEM)
            .and_then(|u| u.service(&common::component(TUNER)))
            .is_some_and(|service| service.reconnecting)
    })
    .await;

    // Whatever a watcher is told must match what a query returns
    sleep(common::QUIET_PERIOD).await;
    assert!(rx.try_recv().is_err(), "no state change was stored");
    let state = harness
        .broker
        .get_input_state(caller.clone(), UserId::CURRENT, input_of(TUNER))
        .await
        .unwrap();
    assert_eq!(state, InputState::Connected);

    harness
        .broker
        .release_session(caller.clone(), UserId::CURRENT, live)
        .await
        .unwrap();
    assert!(harness.open_session(&caller, &client, TUNER, 1).await.is_some());
    let state = harness
        .broker
        .get_input_state(caller, UserId::CURRENT, input_of(TUNER))
        .await
        .unwrap();
    assert_eq!(state, InputState::Connected);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_lost_connection_aborts_pending_requests() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    harness.connector.set_auto_connect(false);
    let client = TestClient::new("app");

    let token = harness
        .broker
        .create_session(
            system_caller(),
            UserId::CURRENT,
            client.handle.clone(),
            input_of(TUNER),
            3,
        )
        .await
        .unwrap();
    assert!(token.is_some());

    harness.connector.disconnect(TUNER, UserId::SYSTEM);
    assert_eq!(client.created().await, (None, 3));
}

// ============================================================================
// Users
// ============================================================================

#[tokio::test]
async fn test_switch_user_tears_down_previous_user() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let client = TestClient::new("app");
    let caller = system_caller();
    let token = harness.open_session(&caller, &client, TUNER, 8).await.unwrap();

    let next_user = UserId::new(10);
    harness.broker.switch_user(next_user).await.unwrap();
    client.released(token).await;

    let snapshot = harness.broker.snapshot().await.unwrap();
    assert_eq!(snapshot.current_user, next_user);
    assert!(snapshot.user(UserId::SYSTEM).unwrap().sessions.is_empty());
    assert_eq!(harness.connector.unbinds(), 1);

    // The new user's registry is built on switch
    let inputs = harness
        .broker
        .get_input_list(caller, UserId::CURRENT)
        .await
        .unwrap();
    assert_eq!(inputs.len(), 1);

    harness.watch_log.flush().await;
    let records = harness.watch_store.records(UserId::SYSTEM).unwrap();
    assert!(records
        .iter()
        .any(|r| matches!(r, WatchRecord::End { session_token, .. } if session_token == &token.to_string())));
}

#[tokio::test]
async fn test_switch_user_keeps_registry_callbacks() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let (callback, mut rx) = RegistryCallback::new(Peer::new("system-ui"));
    harness
        .broker
        .register_callback(system_caller(), UserId::CURRENT, callback)
        .await
        .unwrap();

    harness.broker.switch_user(UserId::new(10)).await.unwrap();
    harness.broker.switch_user(UserId::SYSTEM).await.unwrap();

    let snapshot = harness.broker.snapshot().await.unwrap();
    let user = snapshot.user(UserId::SYSTEM).unwrap();
    assert_eq!(user.callbacks, 1, "callback survives the round trip");
    assert_eq!(user.inputs.len(), 1);

    harness
        .directory
        .set(vec![tuner_entry(TUNER), tuner_entry("com.example.other")]);
    harness
        .broker
        .rebuild_inputs(UserId::CURRENT, Vec::new())
        .await
        .unwrap();
    assert_eq!(
        next_notification(&mut rx).await,
        InputNotification::Added(input_of("com.example.other"))
    );
}

#[tokio::test]
async fn test_switch_user_resolves_pending_requests() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    harness.connector.set_auto_connect(false);
    let client = TestClient::new("app");

    harness
        .broker
        .create_session(
            system_caller(),
            UserId::CURRENT,
            client.handle.clone(),
            input_of(TUNER),
            2,
        )
        .await
        .unwrap();

    harness.broker.switch_user(UserId::new(10)).await.unwrap();
    assert_eq!(client.created().await, (None, 2));
    assert!(!harness.connector.is_bound(TUNER, UserId::SYSTEM));
}

#[tokio::test]
async fn test_current_user_follows_switch() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let app: CallerIdentity = app_caller(10_050, UserId::SYSTEM);

    harness
        .broker
        .get_input_list(app.clone(), UserId::CURRENT)
        .await
        .expect("own user is allowed");

    harness.broker.switch_user(UserId::new(10)).await.unwrap();
    let err = harness
        .broker
        .get_input_list(app, UserId::CURRENT)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::PermissionDenied(_)));
}

#[tokio::test]
async fn test_remove_user_drops_state() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let caller = system_caller();
    let background = UserId::new(11);

    // Registry of a user that is not active
    harness
        .broker
        .rebuild_inputs(background, Vec::new())
        .await
        .unwrap();
    let inputs = harness
        .broker
        .get_input_list(caller, background)
        .await
        .unwrap();
    assert_eq!(inputs.len(), 1);

    harness.broker.remove_user(background).await.unwrap();
    let snapshot = harness.broker.snapshot().await.unwrap();
    assert!(snapshot.user(background).is_none());
    assert!(snapshot.user(UserId::SYSTEM).is_some());
}
