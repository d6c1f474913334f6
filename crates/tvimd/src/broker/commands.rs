//! Broker actor commands, errors, and client-facing events.
//!
//! This module defines the message types for communicating with the `BrokerActor`:
//! - `BrokerCommand`: Public requests and internal reports sent to the actor
//! - `BrokerError`: Errors surfaced to callers
//! - `ClientEvent` / `InputNotification`: What clients and registry
//!   callbacks receive
//!
//! Internal reports (provider, session and peer callbacks) carry no
//! responder; they are fire-and-forget.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

use tvim_core::{
    CallerIdentity, ClientId, ComponentName, ContentRating, HardwareInfo, HdmiDeviceInfo,
    InputDescriptor, InputId, InputState, SessionEvent, SessionToken, StreamConfig,
    SurfaceHandle, UserId,
};
use tvim_provider::{InputChannelClient, PeerId, ProviderService, RemoteSession, SessionOp};

use super::fanout::{ClientHandle, RegistryCallback};
use super::state::BrokerSnapshot;
use crate::hardware::{HardwareCallback, HardwareLease};

/// Responder for a fallible broker request.
pub type Respond<T> = oneshot::Sender<Result<T, BrokerError>>;

// ============================================================================
// Broker Commands
// ============================================================================

/// Commands sent to the broker actor.
///
/// Every public request names the calling identity and the user it
/// targets; the actor resolves the user before touching any state.
pub enum BrokerCommand {
    // ------------------------------------------------------------------
    // Input registry
    // ------------------------------------------------------------------
    GetInputList {
        caller: CallerIdentity,
        user: UserId,
        respond_to: Respond<Vec<InputDescriptor>>,
    },
    GetInputInfo {
        caller: CallerIdentity,
        user: UserId,
        input_id: InputId,
        respond_to: Respond<Option<InputDescriptor>>,
    },
    /// Unknown inputs report `Connected`.
    GetInputState {
        caller: CallerIdentity,
        user: UserId,
        input_id: InputId,
        respond_to: Respond<InputState>,
    },
    RegisterCallback {
        caller: CallerIdentity,
        user: UserId,
        callback: RegistryCallback,
        respond_to: Respond<()>,
    },
    UnregisterCallback {
        caller: CallerIdentity,
        user: UserId,
        /// Peer of the registered callback
        callback: PeerId,
        respond_to: Respond<()>,
    },
    /// Re-reads the directory for `user`.
    RebuildInputs {
        user: UserId,
        /// Packages reported as updated since the last scan
        changed_packages: Vec<String>,
        respond_to: oneshot::Sender<()>,
    },

    // ------------------------------------------------------------------
    // Parental controls
    // ------------------------------------------------------------------
    IsParentalControlsEnabled {
        caller: CallerIdentity,
        user: UserId,
        respond_to: Respond<bool>,
    },
    SetParentalControlsEnabled {
        caller: CallerIdentity,
        user: UserId,
        enabled: bool,
        respond_to: Respond<()>,
    },
    IsRatingBlocked {
        caller: CallerIdentity,
        user: UserId,
        rating: ContentRating,
        respond_to: Respond<bool>,
    },
    GetBlockedRatings {
        caller: CallerIdentity,
        user: UserId,
        respond_to: Respond<Vec<ContentRating>>,
    },
    AddBlockedRating {
        caller: CallerIdentity,
        user: UserId,
        rating: ContentRating,
        respond_to: Respond<()>,
    },
    RemoveBlockedRating {
        caller: CallerIdentity,
        user: UserId,
        rating: ContentRating,
        respond_to: Respond<()>,
    },

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------
    /// Responds with the minted token, or `None` when the request was
    /// answered with a null creation result right away. Either way the
    /// client receives exactly one `ClientEvent::SessionCreated`.
    CreateSession {
        caller: CallerIdentity,
        user: UserId,
        client: ClientHandle,
        input_id: InputId,
        seq: u64,
        respond_to: Respond<Option<SessionToken>>,
    },
    /// Unknown tokens are a logged no-op.
    ReleaseSession {
        caller: CallerIdentity,
        user: UserId,
        token: SessionToken,
        respond_to: Respond<()>,
    },
    SetMainSession {
        caller: CallerIdentity,
        user: UserId,
        token: Option<SessionToken>,
        respond_to: Respond<()>,
    },
    /// Any per-session operation except `Release` and `SetMain`.
    Session {
        caller: CallerIdentity,
        user: UserId,
        token: SessionToken,
        op: SessionOp,
        respond_to: Respond<()>,
    },
    IsSingleSessionActive {
        caller: CallerIdentity,
        user: UserId,
        respond_to: Respond<bool>,
    },

    // ------------------------------------------------------------------
    // Hardware pass-through
    // ------------------------------------------------------------------
    GetHardwareList {
        caller: CallerIdentity,
        respond_to: oneshot::Sender<Vec<HardwareInfo>>,
    },
    AcquireHardware {
        caller: CallerIdentity,
        user: UserId,
        device_id: u32,
        input: InputDescriptor,
        callback: Arc<dyn HardwareCallback>,
        respond_to: Respond<Option<HardwareLease>>,
    },
    ReleaseHardware {
        caller: CallerIdentity,
        user: UserId,
        lease: HardwareLease,
        respond_to: Respond<()>,
    },
    GetAvailableStreamConfigs {
        caller: CallerIdentity,
        user: UserId,
        input_id: InputId,
        respond_to: Respond<Vec<StreamConfig>>,
    },
    CaptureFrame {
        caller: CallerIdentity,
        user: UserId,
        input_id: InputId,
        surface: SurfaceHandle,
        config: StreamConfig,
        respond_to: Respond<bool>,
    },

    // ------------------------------------------------------------------
    // Users & diagnostics
    // ------------------------------------------------------------------
    SwitchUser {
        user: UserId,
        respond_to: oneshot::Sender<()>,
    },
    RemoveUser {
        user: UserId,
        respond_to: oneshot::Sender<()>,
    },
    Snapshot {
        respond_to: oneshot::Sender<BrokerSnapshot>,
    },

    // ------------------------------------------------------------------
    // Internal reports
    // ------------------------------------------------------------------
    ServiceConnected {
        user: UserId,
        component: ComponentName,
        service: Arc<dyn ProviderService>,
    },
    /// The connector lost the provider.
    ServiceDisconnected {
        user: UserId,
        component: ComponentName,
    },
    /// The provider's peer died.
    ServiceDied {
        user: UserId,
        component: ComponentName,
        peer: PeerId,
    },
    SessionCreated {
        user: UserId,
        token: SessionToken,
        session: Option<Arc<dyn RemoteSession>>,
        hardware_session: Option<SessionToken>,
    },
    SessionEvent {
        user: UserId,
        token: SessionToken,
        event: SessionEvent,
    },
    SessionDied {
        user: UserId,
        token: SessionToken,
        peer: PeerId,
    },
    ClientDied {
        user: UserId,
        client: ClientId,
    },
    CallbackDied {
        user: UserId,
        callback: PeerId,
    },
    HardwareInputAdded {
        user: UserId,
        component: ComponentName,
        device_id: u32,
        input: InputDescriptor,
    },
    HdmiInputAdded {
        user: UserId,
        component: ComponentName,
        hdmi_device_id: u32,
        input: InputDescriptor,
    },
    ProviderInputRemoved {
        user: UserId,
        component: ComponentName,
        input_id: InputId,
    },
    Hardware(HardwareEvent),
}

impl BrokerCommand {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetInputList { .. } => "get_input_list",
            Self::GetInputInfo { .. } => "get_input_info",
            Self::GetInputState { .. } => "get_input_state",
            Self::RegisterCallback { .. } => "register_callback",
            Self::UnregisterCallback { .. } => "unregister_callback",
            Self::RebuildInputs { .. } => "rebuild_inputs",
            Self::IsParentalControlsEnabled { .. } => "is_parental_controls_enabled",
            Self::SetParentalControlsEnabled { .. } => "set_parental_controls_enabled",
            Self::IsRatingBlocked { .. } => "is_rating_blocked",
            Self::GetBlockedRatings { .. } => "get_blocked_ratings",
            Self::AddBlockedRating { .. } => "add_blocked_rating",
            Self::RemoveBlockedRating { .. } => "remove_blocked_rating",
            Self::CreateSession { .. } => "create_session",
            Self::ReleaseSession { .. } => "release_session",
            Self::SetMainSession { .. } => "set_main_session",
            Self::Session { .. } => "session_op",
            Self::IsSingleSessionActive { .. } => "is_single_session_active",
            Self::GetHardwareList { .. } => "get_hardware_list",
            Self::AcquireHardware { .. } => "acquire_hardware",
            Self::ReleaseHardware { .. } => "release_hardware",
            Self::GetAvailableStreamConfigs { .. } => "get_available_stream_configs",
            Self::CaptureFrame { .. } => "capture_frame",
            Self::SwitchUser { .. } => "switch_user",
            Self::RemoveUser { .. } => "remove_user",
            Self::Snapshot { .. } => "snapshot",
            Self::ServiceConnected { .. } => "service_connected",
            Self::ServiceDisconnected { .. } => "service_disconnected",
            Self::ServiceDied { .. } => "service_died",
            Self::SessionCreated { .. } => "session_created",
            Self::SessionEvent { .. } => "session_event",
            Self::SessionDied { .. } => "session_died",
            Self::ClientDied { .. } => "client_died",
            Self::CallbackDied { .. } => "callback_died",
            Self::HardwareInputAdded { .. } => "hardware_input_added",
            Self::HdmiInputAdded { .. } => "hdmi_input_added",
            Self::ProviderInputRemoved { .. } => "provider_input_removed",
            Self::Hardware(_) => "hardware_event",
        }
    }
}

/// Hot-plug and state reports from the hardware manager.
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareEvent {
    StateChanged { input_id: InputId, state: InputState },
    DeviceAdded(HardwareInfo),
    DeviceRemoved(HardwareInfo),
    HdmiDeviceAdded(HdmiDeviceInfo),
    HdmiDeviceRemoved(HdmiDeviceInfo),
    HdmiDeviceUpdated { input_id: InputId, device: HdmiDeviceInfo },
}

// ============================================================================
// Broker Errors
// ============================================================================

/// Errors surfaced to broker callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionToken),

    #[error("input not found: {0}")]
    InputNotFound(InputId),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,

    #[error("settings error: {0}")]
    Settings(String),
}

impl BrokerError {
    pub fn permission(reason: impl Into<String>) -> Self {
        Self::PermissionDenied(reason.into())
    }
}

// ============================================================================
// Client-facing events
// ============================================================================

/// Session events delivered to the owning client, in emission order.
#[derive(Debug)]
pub enum ClientEvent {
    /// Exactly one per `create_session` request. `token` is `None` when
    /// the session could not be created.
    SessionCreated {
        input_id: InputId,
        token: Option<SessionToken>,
        /// Client end of the session's input-event channel.
        channel: Option<InputChannelClient>,
        seq: u64,
    },
    SessionReleased {
        token: SessionToken,
        seq: u64,
    },
    Session {
        token: SessionToken,
        seq: u64,
        event: SessionEvent,
    },
}

/// Input registry changes delivered to every registered callback of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputNotification {
    Added(InputId),
    Removed(InputId),
    Updated(InputId),
    StateChanged { input_id: InputId, state: InputState },
}
