//! End-to-end tests of the in-process client against a running broker.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use common::{eventually, input_of, snapshot_until, system_caller, tuner_entry, Harness};
use tokio::sync::mpsc;
use tokio::time::timeout;

use tvim_core::{ChannelUri, InputId, TrackType, TuneParams, UserId};
use tvim_provider::{InputEvent, SessionOp};
use tvimd::broker::InputNotification;
use tvimd::client::{Session, SessionCallbackEvent, TvInputManager};

const TUNER: &str = "com.example.tuner";

// ============================================================================
// Test Helpers
// ============================================================================

async fn next(rx: &mut mpsc::UnboundedReceiver<SessionCallbackEvent>) -> SessionCallbackEvent {
    timeout(common::EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a session callback")
        .expect("session channel closed")
}

fn describe(event: &SessionCallbackEvent) -> String {
    match event {
        SessionCallbackEvent::Created(session) => format!("created {}", session.is_some()),
        SessionCallbackEvent::Released => "released".to_string(),
        SessionCallbackEvent::Event(e) => e.name().to_string(),
        SessionCallbackEvent::VideoSizeChanged { width, height } => {
            format!("video_size {width}x{height}")
        }
    }
}

async fn open(
    manager: &TvInputManager,
) -> (Session, mpsc::UnboundedReceiver<SessionCallbackEvent>) {
    let mut rx = manager.create_session(input_of(TUNER)).await.unwrap();
    match next(&mut rx).await {
        SessionCallbackEvent::Created(Some(session)) => (session, rx),
        other => panic!("expected a created session, got {}", describe(&other)),
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_tune_reports_video_size_once() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let manager = TvInputManager::new(harness.broker.clone(), system_caller(), UserId::CURRENT);
    let (session, mut rx) = open(&manager).await;

    session
        .tune(ChannelUri::channel(4), TuneParams::new())
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(describe(&next(&mut rx).await));
    }
    assert_eq!(
        seen,
        vec![
            "video_unavailable",
            "tracks_changed",
            "track_selected",
            "video_size 1920x1080",
            "video_available",
        ]
    );
    assert_eq!(session.tracks(TrackType::Video).len(), 1);
    assert_eq!(session.tracks(TrackType::Audio).len(), 1);
    assert_eq!(session.selected_track(TrackType::Video).as_deref(), Some("v0"));

    // Re-selecting the same track reports nothing new
    session
        .select_track(TrackType::Video, Some("v0".to_string()))
        .await
        .unwrap();
    session.set_caption_enabled(true).await.unwrap();
    let journal = harness.connector.journal().clone();
    eventually("caption reached the provider", || {
        journal
            .executed(1)
            .contains(&SessionOp::SetCaptionEnabled(true))
    })
    .await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_input_yields_empty_creation() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let manager = TvInputManager::new(harness.broker.clone(), system_caller(), UserId::CURRENT);

    let mut rx = manager
        .create_session(InputId::new("com.example.none/.Nothing"))
        .await
        .unwrap();
    assert!(matches!(next(&mut rx).await, SessionCallbackEvent::Created(None)));
}

#[tokio::test]
async fn test_input_events_reach_provider() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let manager = TvInputManager::new(harness.broker.clone(), system_caller(), UserId::CURRENT);
    let (session, _rx) = open(&manager).await;

    assert!(
        session
            .dispatch_input_event(InputEvent::Key {
                key_code: 19,
                down: true
            })
            .await
    );
    assert!(
        !session
            .dispatch_input_event(InputEvent::Motion {
                action: 0,
                x: 1.0,
                y: 2.0
            })
            .await
    );

    session.release().await.unwrap();
    assert!(
        !session
            .dispatch_input_event(InputEvent::Key {
                key_code: 19,
                down: false
            })
            .await
    );
}

#[tokio::test]
async fn test_provider_crash_delivers_released() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let manager = TvInputManager::new(harness.broker.clone(), system_caller(), UserId::CURRENT);
    let (_session, mut rx) = open(&manager).await;

    harness
        .connector
        .provider(TUNER, UserId::SYSTEM)
        .expect("provider running")
        .crash();

    assert!(matches!(next(&mut rx).await, SessionCallbackEvent::Released));
}

// ============================================================================
// Lifetime
// ============================================================================

#[tokio::test]
async fn test_dropping_manager_releases_sessions() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let manager = TvInputManager::new(harness.broker.clone(), system_caller(), UserId::CURRENT);
    let _first = open(&manager).await;
    let _second = open(&manager).await;

    drop(manager);

    snapshot_until(&harness.broker, "sessions released with their client", |s| {
        let user = s.user(UserId::SYSTEM).unwrap();
        user.sessions.is_empty() && user.clients.is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_registry_callback_lives_until_dropped() {
    let harness = Harness::start(vec![tuner_entry(TUNER)]);
    let manager = TvInputManager::new(harness.broker.clone(), system_caller(), UserId::CURRENT);
    let mut callback = manager.register_callback().await.unwrap();

    harness
        .directory
        .set(vec![tuner_entry(TUNER), tuner_entry("com.example.other")]);
    harness
        .broker
        .rebuild_inputs(UserId::CURRENT, Vec::new())
        .await
        .unwrap();
    let added = timeout(common::EVENT_TIMEOUT, callback.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(added, InputNotification::Added(input_of("com.example.other")));
    assert_eq!(manager.get_input_list().await.unwrap().len(), 2);

    drop(callback);
    snapshot_until(&harness.broker, "callback unregistered", |s| {
        s.user(UserId::SYSTEM).unwrap().callbacks == 0
    })
    .await;
}
