//! Integration tests for hardware providers, the main session and
//! sessions that wrap a hardware session.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use std::sync::Arc;

use common::{
    app_caller, component, eventually, hardware_entry, snapshot_until, system_caller,
    tuner_entry, Harness, TestClient,
};
use tokio::time::sleep;
use tvim_core::{
    HardwareInfo, HdmiDeviceInfo, HdmiPowerStatus, InputId, InputState, InputType, SessionToken,
    StreamConfig, SurfaceHandle, UserId,
};
use tvim_provider::{JournalEntry, Peer, SessionOp};
use tvimd::broker::{BrokerError, InputNotification, RegistryCallback};
use tvimd::hardware::InMemoryHardwareManager;

const HW: &str = "com.example.hw";
const TUNER: &str = "com.example.tuner";

// ============================================================================
// Test Helpers
// ============================================================================

fn device(device_id: u32) -> HardwareInfo {
    HardwareInfo::new(device_id, InputType::Hdmi).with_hdmi_port(device_id)
}

fn hardware_input(device_id: u32) -> InputId {
    InputId::for_hardware(&component(HW), &device(device_id))
}

fn stream_config() -> StreamConfig {
    StreamConfig {
        stream_id: 1,
        generation: 1,
        max_width: 1920,
        max_height: 1080,
    }
}

fn hdmi_device() -> HdmiDeviceInfo {
    HdmiDeviceInfo::new(7, 1, 4)
}

async fn input_state(harness: &Harness, input_id: InputId) -> InputState {
    harness
        .broker
        .get_input_state(system_caller(), UserId::CURRENT, input_id)
        .await
        .unwrap()
}

async fn watch(harness: &Harness) -> tokio::sync::mpsc::UnboundedReceiver<InputNotification> {
    let (callback, rx) = RegistryCallback::new(Peer::new("watcher"));
    harness
        .broker
        .register_callback(system_caller(), UserId::CURRENT, callback)
        .await
        .unwrap();
    rx
}

/// Starts a broker with one plugged device and waits for its input.
async fn start_with_device() -> Harness {
    let hardware = Arc::new(InMemoryHardwareManager::new());
    hardware.plug_hardware(device(1), vec![stream_config()]);
    let harness = Harness::start_with(vec![hardware_entry(HW), tuner_entry(TUNER)], hardware);

    let expected = hardware_input(1);
    snapshot_until(&harness.broker, "hardware input reported", |s| {
        s.user(UserId::SYSTEM)
            .is_some_and(|u| u.inputs.iter().any(|i| i.input_id == expected))
    })
    .await;
    harness
}

// ============================================================================
// Hardware providers
// ============================================================================

#[tokio::test]
async fn test_hardware_provider_binds_at_startup() {
    let harness = start_with_device().await;

    assert_eq!(harness.connector.binds(), 1, "only the hardware provider binds");
    let info = harness
        .broker
        .get_input_info(system_caller(), UserId::CURRENT, hardware_input(1))
        .await
        .unwrap()
        .expect("hardware input listed");
    assert!(info.is_hardware);
    assert_eq!(info.component, component(HW));

    let entries = harness.connector.journal().entries();
    assert_eq!(entries.first(), Some(&JournalEntry::CallbackRegistered));
    assert!(entries.contains(&JournalEntry::HardwareAdded(device(1))));
}

#[tokio::test]
async fn test_hot_plug_adds_and_removes_inputs() {
    let harness = start_with_device().await;
    let (callback, mut rx) = RegistryCallback::new(Peer::new("watcher"));
    harness
        .broker
        .register_callback(system_caller(), UserId::CURRENT, callback)
        .await
        .unwrap();

    harness.hardware.plug_hardware(device(2), Vec::new());
    assert_eq!(
        common::next_notification(&mut rx).await,
        InputNotification::Added(hardware_input(2))
    );

    harness.hardware.unplug_hardware(2);
    assert_eq!(
        common::next_notification(&mut rx).await,
        InputNotification::Removed(hardware_input(2))
    );
}

// ============================================================================
// Input state
// ============================================================================

#[tokio::test]
async fn test_hardware_state_change_is_stored_and_notified() {
    let harness = start_with_device().await;
    let mut rx = watch(&harness).await;
    assert_eq!(input_state(&harness, hardware_input(1)).await, InputState::Connected);

    harness.hardware.set_hardware_state(1, InputState::Disconnected);
    assert_eq!(
        common::next_notification(&mut rx).await,
        InputNotification::StateChanged {
            input_id: hardware_input(1),
            state: InputState::Disconnected,
        }
    );
    assert_eq!(input_state(&harness, hardware_input(1)).await, InputState::Disconnected);

    // Same state again is not a change
    harness.hardware.set_hardware_state(1, InputState::Disconnected);
    sleep(common::QUIET_PERIOD).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_state_change_held_back_until_reconnect() {
    let harness = start_with_device().await;
    let mut rx = watch(&harness).await;
    harness.connector.set_auto_connect(false);

    harness.connector.disconnect(HW, UserId::SYSTEM);
    snapshot_until(&harness.broker, "hardware provider lost", |s| {
        s.user(UserId::SYSTEM)
            .and_then(|u| u.service(&component(HW)))
            .is_some_and(|service| !service.connected)
    })
    .await;

    harness.hardware.set_hardware_state(1, InputState::Disconnected);
    assert_eq!(input_state(&harness, hardware_input(1)).await, InputState::Disconnected);
    sleep(common::QUIET_PERIOD).await;
    assert!(rx.try_recv().is_err(), "held back while the provider is away");

    harness.connector.connect(HW, UserId::SYSTEM);
    assert_eq!(
        common::next_notification(&mut rx).await,
        InputNotification::StateChanged {
            input_id: hardware_input(1),
            state: InputState::Disconnected,
        }
    );
}

#[tokio::test]
async fn test_hdmi_power_status_maps_to_state() {
    let harness = start_with_device().await;
    let mut rx = watch(&harness).await;
    let hdmi_input = InputId::for_hdmi_device(&component(HW), &hdmi_device());

    harness.hardware.plug_hdmi(hdmi_device());
    assert_eq!(
        common::next_notification(&mut rx).await,
        InputNotification::Added(hdmi_input.clone())
    );

    harness
        .hardware
        .update_hdmi(hdmi_device().with_power_status(HdmiPowerStatus::Standby));
    assert_eq!(
        common::next_notification(&mut rx).await,
        InputNotification::StateChanged {
            input_id: hdmi_input.clone(),
            state: InputState::ConnectedStandby,
        }
    );
    assert_eq!(input_state(&harness, hdmi_input.clone()).await, InputState::ConnectedStandby);

    // Unknown power leaves the state alone
    harness
        .hardware
        .update_hdmi(hdmi_device().with_power_status(HdmiPowerStatus::Unknown));
    harness
        .hardware
        .update_hdmi(hdmi_device().with_power_status(HdmiPowerStatus::On));
    assert_eq!(
        common::next_notification(&mut rx).await,
        InputNotification::StateChanged {
            input_id: hdmi_input.clone(),
            state: InputState::Connected,
        }
    );
    assert_eq!(input_state(&harness, hdmi_input).await, InputState::Connected);
}

#[tokio::test]
async fn test_hardware_queries_need_permissions() {
    let harness = start_with_device().await;
    let app = app_caller(10_050, UserId::SYSTEM);
    let caller = system_caller();

    assert!(harness.broker.get_hardware_list(app.clone()).await.unwrap().is_empty());
    assert_eq!(
        harness.broker.get_hardware_list(caller.clone()).await.unwrap(),
        vec![device(1)]
    );

    let err = harness
        .broker
        .get_available_stream_configs(app, UserId::CURRENT, hardware_input(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::PermissionDenied(_)));

    let configs = harness
        .broker
        .get_available_stream_configs(caller.clone(), UserId::CURRENT, hardware_input(1))
        .await
        .unwrap();
    assert_eq!(configs, vec![stream_config()]);

    let err = harness
        .broker
        .get_available_stream_configs(caller.clone(), UserId::CURRENT, InputId::new("nowhere"))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::InputNotFound(InputId::new("nowhere")));

    let captured = harness
        .broker
        .capture_frame(
            caller,
            UserId::CURRENT,
            InputId::new("nowhere"),
            SurfaceHandle::new(1),
            stream_config(),
        )
        .await
        .unwrap();
    assert!(!captured);
}

// ============================================================================
// Main session
// ============================================================================

#[tokio::test]
async fn test_main_session_handover_order() {
    let harness = start_with_device().await;
    let client = TestClient::new("app");
    let caller = system_caller();
    let first = harness
        .open_session_on(&caller, &client, hardware_input(1), 0)
        .await
        .unwrap();
    let second = harness
        .open_session_on(&caller, &client, hardware_input(1), 1)
        .await
        .unwrap();

    harness
        .broker
        .set_main_session(caller.clone(), UserId::CURRENT, Some(first))
        .await
        .unwrap();
    harness
        .broker
        .set_main_session(caller.clone(), UserId::CURRENT, Some(second))
        .await
        .unwrap();

    let journal = harness.connector.journal().clone();
    eventually("main moved to the second session", || {
        journal.executed(1) == vec![SessionOp::SetMain(true), SessionOp::SetMain(false)]
            && journal.executed(2) == vec![SessionOp::SetMain(true)]
    })
    .await;

    let err = harness
        .broker
        .set_main_session(caller.clone(), UserId::CURRENT, Some(SessionToken::new(999)))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::SessionNotFound(SessionToken::new(999)));

    let snapshot = harness.broker.snapshot().await.unwrap();
    assert_eq!(snapshot.user(UserId::SYSTEM).unwrap().main_session, Some(second));
}

#[tokio::test]
async fn test_releasing_main_session_clears_it_first() {
    let harness = start_with_device().await;
    let client = TestClient::new("app");
    let caller = system_caller();
    let token = harness
        .open_session_on(&caller, &client, hardware_input(1), 0)
        .await
        .unwrap();

    harness
        .broker
        .set_main_session(caller.clone(), UserId::CURRENT, Some(token))
        .await
        .unwrap();
    harness
        .broker
        .release_session(caller, UserId::CURRENT, token)
        .await
        .unwrap();

    let journal = harness.connector.journal().clone();
    eventually("main cleared before release", || {
        journal.executed(1)
            == vec![
                SessionOp::SetMain(true),
                SessionOp::SetMain(false),
                SessionOp::Release,
            ]
    })
    .await;

    let snapshot = harness.broker.snapshot().await.unwrap();
    let user = snapshot.user(UserId::SYSTEM).unwrap();
    assert_eq!(user.main_session, None);
    // Hardware providers of the active user stay bound
    assert!(user.service(&component(HW)).unwrap().connected);
}

#[tokio::test]
async fn test_main_flag_only_reaches_hardware_providers() {
    let harness = start_with_device().await;
    let client = TestClient::new("app");
    let caller = system_caller();
    let token = harness.open_session(&caller, &client, TUNER, 0).await.unwrap();

    harness
        .broker
        .set_main_session(caller.clone(), UserId::CURRENT, Some(token))
        .await
        .unwrap();
    harness
        .broker
        .session_op(caller, UserId::CURRENT, token, SessionOp::SetCaptionEnabled(true))
        .await
        .unwrap();

    let journal = harness.connector.journal().clone();
    eventually("caption toggled", || {
        journal.executed(1) == vec![SessionOp::SetCaptionEnabled(true)]
    })
    .await;
    let snapshot = harness.broker.snapshot().await.unwrap();
    assert_eq!(snapshot.user(UserId::SYSTEM).unwrap().main_session, Some(token));
}

// ============================================================================
// Wrapped hardware sessions
// ============================================================================

/// Opens a hardware session and a tuner session wrapping it.
async fn open_wrapped(
    harness: &Harness,
    hw_client: &TestClient,
    app_client: &TestClient,
) -> (SessionToken, SessionToken) {
    let caller = system_caller();
    let hardware = harness
        .open_session_on(&caller, hw_client, hardware_input(1), 0)
        .await
        .unwrap();
    harness.connector.wrap_sessions(TUNER, hardware);
    let wrapper = harness
        .open_session(&caller, app_client, TUNER, 0)
        .await
        .unwrap();

    let snapshot = harness.broker.snapshot().await.unwrap();
    let session = snapshot.user(UserId::SYSTEM).unwrap().session(wrapper).unwrap();
    assert_eq!(session.hardware_session, Some(hardware));
    (hardware, wrapper)
}

#[tokio::test]
async fn test_wrapper_ops_redirect_to_hardware_session() {
    let harness = start_with_device().await;
    let hw_client = TestClient::new("hw");
    let app_client = TestClient::new("app");
    let caller = system_caller();
    let (_hardware, wrapper) = open_wrapped(&harness, &hw_client, &app_client).await;

    for op in [
        SessionOp::SetSurface(Some(SurfaceHandle::new(5))),
        SessionOp::SetVolume(0.25),
    ] {
        harness
            .broker
            .session_op(caller.clone(), UserId::CURRENT, wrapper, op)
            .await
            .unwrap();
    }
    harness
        .broker
        .set_main_session(caller.clone(), UserId::CURRENT, Some(wrapper))
        .await
        .unwrap();

    let journal = harness.connector.journal().clone();
    eventually("hardware session took the redirected ops", || {
        journal.executed(1)
            == vec![
                SessionOp::SetSurface(Some(SurfaceHandle::new(5))),
                SessionOp::SetVolume(1.0),
                SessionOp::SetMain(true),
            ]
            && journal.executed(2) == vec![SessionOp::SetVolume(0.25)]
    })
    .await;

    assert!(harness
        .broker
        .is_single_session_active(caller, UserId::CURRENT)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_hardware_session_death_releases_wrappers() {
    let harness = start_with_device().await;
    let hw_client = TestClient::new("hw");
    let app_client = TestClient::new("app");
    let (hardware, wrapper) = open_wrapped(&harness, &hw_client, &app_client).await;

    harness
        .connector
        .provider(HW, UserId::SYSTEM)
        .expect("hardware provider running")
        .crash();

    hw_client.released(hardware).await;
    app_client.released(wrapper).await;

    let journal = harness.connector.journal().clone();
    eventually("wrapper released on its provider", || {
        journal.executed(2) == vec![SessionOp::Release]
    })
    .await;
    snapshot_until(&harness.broker, "both sessions gone", |s| {
        s.user(UserId::SYSTEM).unwrap().sessions.is_empty()
    })
    .await;
}
