//! Integration tests for the input registry, user scoping and parental
//! controls.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use common::{
    app_caller, input_of, next_notification, system_caller, tuner_entry, Harness, TestClient,
};
use tvim_core::{ContentRating, InputId, InputState, UserId};
use tvim_provider::Peer;
use tvimd::broker::{BrokerError, InputNotification, RegistryCallback};

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_startup_builds_input_list() {
    let mut unpermitted = tuner_entry("com.example.rogue");
    unpermitted.permission = None;
    let harness = Harness::start(vec![
        tuner_entry("com.example.a"),
        tuner_entry("com.example.b"),
        unpermitted,
    ]);
    let caller = system_caller();

    let inputs = harness
        .broker
        .get_input_list(caller.clone(), UserId::CURRENT)
        .await
        .unwrap();
    let mut ids: Vec<InputId> = inputs.into_iter().map(|i| i.id).collect();
    ids.sort();
    assert_eq!(ids, vec![input_of("com.example.a"), input_of("com.example.b")]);

    let info = harness
        .broker
        .get_input_info(caller.clone(), UserId::CURRENT, input_of("com.example.a"))
        .await
        .unwrap()
        .expect("known input");
    assert_eq!(info.label.as_deref(), Some("com.example.a"));
    assert_eq!(info.setup_activity.as_deref(), Some("com.example.a.Setup"));

    let missing = harness
        .broker
        .get_input_info(caller.clone(), UserId::CURRENT, input_of("com.example.rogue"))
        .await
        .unwrap();
    assert!(missing.is_none(), "providers without the bind permission are skipped");

    let state = harness
        .broker
        .get_input_state(caller, UserId::CURRENT, input_of("com.example.nowhere"))
        .await
        .unwrap();
    assert_eq!(state, InputState::Connected);

    // Non-hardware providers stay unbound until a session needs them
    assert_eq!(harness.connector.binds(), 0);
}

#[tokio::test]
async fn test_rebuild_reports_added_updated_removed() {
    let harness = Harness::start(vec![
        tuner_entry("com.example.a"),
        tuner_entry("com.example.c"),
    ]);
    let peer = Peer::new("watcher");
    let (callback, mut rx) = RegistryCallback::new(peer);
    harness
        .broker
        .register_callback(system_caller(), UserId::CURRENT, callback)
        .await
        .unwrap();

    harness.directory.set(vec![
        tuner_entry("com.example.b"),
        tuner_entry("com.example.c"),
    ]);
    harness
        .broker
        .rebuild_inputs(
            UserId::CURRENT,
            vec!["com.example.c".to_string(), "com.example.gone".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(
        next_notification(&mut rx).await,
        InputNotification::Added(input_of("com.example.b"))
    );
    assert_eq!(
        next_notification(&mut rx).await,
        InputNotification::Updated(input_of("com.example.c"))
    );
    assert_eq!(
        next_notification(&mut rx).await,
        InputNotification::Removed(input_of("com.example.a"))
    );
    assert!(rx.try_recv().is_err(), "nothing else changed");
}

#[tokio::test]
async fn test_removed_input_aborts_pending_sessions() {
    let harness = Harness::start(vec![tuner_entry("com.example.a")]);
    harness.connector.set_auto_connect(false);
    let client = TestClient::new("app");

    let token = harness
        .broker
        .create_session(
            system_caller(),
            UserId::CURRENT,
            client.handle.clone(),
            input_of("com.example.a"),
            6,
        )
        .await
        .unwrap();
    assert!(token.is_some());

    harness.directory.set(Vec::new());
    harness
        .broker
        .rebuild_inputs(UserId::CURRENT, Vec::new())
        .await
        .unwrap();

    assert_eq!(client.created().await, (None, 6));
}

// ============================================================================
// User scoping
// ============================================================================

#[tokio::test]
async fn test_cross_user_calls_are_rejected() {
    let harness = Harness::start(vec![tuner_entry("com.example.a")]);
    let other_user = UserId::new(10);
    let app = app_caller(1_010_050, other_user);

    let err = harness
        .broker
        .get_input_list(app.clone(), UserId::CURRENT)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::PermissionDenied(_)));

    let err = harness
        .broker
        .create_session(
            app.clone(),
            UserId::SYSTEM,
            TestClient::new("app").handle,
            input_of("com.example.a"),
            0,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::PermissionDenied(_)));

    // Its own user is fine, even if that user has no registry yet
    let own = harness
        .broker
        .get_input_list(app, other_user)
        .await
        .unwrap();
    assert!(own.is_empty());

    // The system caller may act on anyone
    harness
        .broker
        .get_input_list(system_caller(), other_user)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_registry_notifications_stay_with_their_user() {
    let harness = Harness::start(vec![tuner_entry("com.example.a")]);
    let other_user = UserId::new(10);
    let (callback, mut rx) = RegistryCallback::new(Peer::new("other"));
    harness
        .broker
        .register_callback(system_caller(), other_user, callback)
        .await
        .unwrap();

    harness.directory.set(vec![
        tuner_entry("com.example.a"),
        tuner_entry("com.example.b"),
    ]);
    harness
        .broker
        .rebuild_inputs(UserId::CURRENT, Vec::new())
        .await
        .unwrap();
    assert!(rx.try_recv().is_err(), "active user's changes are not broadcast");

    harness
        .broker
        .rebuild_inputs(other_user, Vec::new())
        .await
        .unwrap();
    let mut added = vec![next_notification(&mut rx).await, next_notification(&mut rx).await];
    added.sort_by_key(|n| format!("{n:?}"));
    assert_eq!(
        added,
        vec![
            InputNotification::Added(input_of("com.example.a")),
            InputNotification::Added(input_of("com.example.b")),
        ]
    );
}

// ============================================================================
// Parental controls
// ============================================================================

#[tokio::test]
async fn test_parental_controls_require_permission() {
    let harness = Harness::start(Vec::new());
    let app = app_caller(10_050, UserId::SYSTEM);
    let rating = ContentRating::new("com.example", "US_TV", "US_TV_MA");

    let err = harness
        .broker
        .set_parental_controls_enabled(app.clone(), UserId::CURRENT, true)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::PermissionDenied(_)));
    let err = harness
        .broker
        .add_blocked_rating(app.clone(), UserId::CURRENT, rating.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::PermissionDenied(_)));

    // Reads are open to the user's own apps
    assert!(!harness
        .broker
        .is_parental_controls_enabled(app.clone(), UserId::CURRENT)
        .await
        .unwrap());
    assert!(!harness
        .broker
        .is_rating_blocked(app, UserId::CURRENT, rating)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_blocked_ratings_round_trip() {
    let harness = Harness::start(Vec::new());
    let caller = system_caller();
    let rating = ContentRating::new("com.example", "US_TV", "US_TV_MA");

    harness
        .broker
        .set_parental_controls_enabled(caller.clone(), UserId::CURRENT, true)
        .await
        .unwrap();
    harness
        .broker
        .add_blocked_rating(caller.clone(), UserId::CURRENT, rating.clone())
        .await
        .unwrap();

    assert!(harness
        .broker
        .is_parental_controls_enabled(caller.clone(), UserId::CURRENT)
        .await
        .unwrap());
    assert!(harness
        .broker
        .is_rating_blocked(caller.clone(), UserId::CURRENT, rating.clone())
        .await
        .unwrap());
    assert_eq!(
        harness
            .broker
            .get_blocked_ratings(caller.clone(), UserId::CURRENT)
            .await
            .unwrap(),
        vec![rating.clone()]
    );

    harness
        .broker
        .remove_blocked_rating(caller.clone(), UserId::CURRENT, rating.clone())
        .await
        .unwrap();
    assert!(!harness
        .broker
        .is_rating_blocked(caller, UserId::CURRENT, rating)
        .await
        .unwrap());
}
