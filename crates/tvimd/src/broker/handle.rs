//! Client interface for interacting with the BrokerActor.
//!
//! The `BrokerHandle` is a cheap-to-clone interface for sending commands
//! to the broker actor. Every call is answered through a oneshot channel.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `BrokerError::ChannelClosed`

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use tvim_core::{
    CallerIdentity, ContentRating, HardwareInfo, InputDescriptor, InputId, InputState,
    SessionToken, StreamConfig, SurfaceHandle, UserId,
};
use tvim_provider::{PeerId, SessionOp};

use super::commands::{BrokerCommand, BrokerError};
use super::fanout::{ClientHandle, RegistryCallback};
use super::state::BrokerSnapshot;
use crate::hardware::{HardwareCallback, HardwareLease};

// ============================================================================
// Broker Handle
// ============================================================================

/// Handle for interacting with the broker actor.
///
/// # Usage
///
/// ```ignore
/// let (client, mut events) = ClientHandle::new(peer);
/// let token = handle
///     .create_session(caller, UserId::CURRENT, client, input_id, 0)
///     .await?;
///
/// while let Some(event) = events.recv().await {
///     // SessionCreated, then session events until SessionReleased
/// }
/// ```
#[derive(Clone)]
pub struct BrokerHandle {
    sender: mpsc::UnboundedSender<BrokerCommand>,
}

impl BrokerHandle {
    pub fn new(sender: mpsc::UnboundedSender<BrokerCommand>) -> Self {
        Self { sender }
    }

    /// Sends a command built around a fresh responder and awaits the answer.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> BrokerCommand,
    ) -> Result<T, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .map_err(|_| BrokerError::ChannelClosed)?;
        rx.await.map_err(|_| BrokerError::ChannelClosed)
    }

    // ------------------------------------------------------------------
    // Input registry
    // ------------------------------------------------------------------

    pub async fn get_input_list(
        &self,
        caller: CallerIdentity,
        user: UserId,
    ) -> Result<Vec<InputDescriptor>, BrokerError> {
        self.request(|respond_to| BrokerCommand::GetInputList {
            caller,
            user,
            respond_to,
        })
        .await?
    }

    pub async fn get_input_info(
        &self,
        caller: CallerIdentity,
        user: UserId,
        input_id: InputId,
    ) -> Result<Option<InputDescriptor>, BrokerError> {
        self.request(|respond_to| BrokerCommand::GetInputInfo {
            caller,
            user,
            input_id,
            respond_to,
        })
        .await?
    }

    pub async fn get_input_state(
        &self,
        caller: CallerIdentity,
        user: UserId,
        input_id: InputId,
    ) -> Result<InputState, BrokerError> {
        self.request(|respond_to| BrokerCommand::GetInputState {
            caller,
            user,
            input_id,
            respond_to,
        })
        .await?
    }

    /// Registers for input-registry notifications of `user`.
    ///
    /// The registration ends when the callback's peer dies.
    pub async fn register_callback(
        &self,
        caller: CallerIdentity,
        user: UserId,
        callback: RegistryCallback,
    ) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::RegisterCallback {
            caller,
            user,
            callback,
            respond_to,
        })
        .await?
    }

    pub async fn unregister_callback(
        &self,
        caller: CallerIdentity,
        user: UserId,
        callback: PeerId,
    ) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::UnregisterCallback {
            caller,
            user,
            callback,
            respond_to,
        })
        .await?
    }

    /// Re-reads the provider directory for `user` (`UserId::CURRENT` allowed).
    pub async fn rebuild_inputs(
        &self,
        user: UserId,
        changed_packages: Vec<String>,
    ) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::RebuildInputs {
            user,
            changed_packages,
            respond_to,
        })
        .await
    }

    // ------------------------------------------------------------------
    // Parental controls
    // ------------------------------------------------------------------

    pub async fn is_parental_controls_enabled(
        &self,
        caller: CallerIdentity,
        user: UserId,
    ) -> Result<bool, BrokerError> {
        self.request(|respond_to| BrokerCommand::IsParentalControlsEnabled {
            caller,
            user,
            respond_to,
        })
        .await?
    }

    pub async fn set_parental_controls_enabled(
        &self,
        caller: CallerIdentity,
        user: UserId,
        enabled: bool,
    ) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::SetParentalControlsEnabled {
            caller,
            user,
            enabled,
            respond_to,
        })
        .await?
    }

    pub async fn is_rating_blocked(
        &self,
        caller: CallerIdentity,
        user: UserId,
        rating: ContentRating,
    ) -> Result<bool, BrokerError> {
        self.request(|respond_to| BrokerCommand::IsRatingBlocked {
            caller,
            user,
            rating,
            respond_to,
        })
        .await?
    }

    pub async fn get_blocked_ratings(
        &self,
        caller: CallerIdentity,
        user: UserId,
    ) -> Result<Vec<ContentRating>, BrokerError> {
        self.request(|respond_to| BrokerCommand::GetBlockedRatings {
            caller,
            user,
            respond_to,
        })
        .await?
    }

    pub async fn add_blocked_rating(
        &self,
        caller: CallerIdentity,
        user: UserId,
        rating: ContentRating,
    ) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::AddBlockedRating {
            caller,
            user,
            rating,
            respond_to,
        })
        .await?
    }

    pub async fn remove_blocked_rating(
        &self,
        caller: CallerIdentity,
        user: UserId,
        rating: ContentRating,
    ) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::RemoveBlockedRating {
            caller,
            user,
            rating,
            respond_to,
        })
        .await?
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Requests a session on `input_id`.
    ///
    /// The outcome is always delivered to `client` as exactly one
    /// `ClientEvent::SessionCreated` carrying `seq`. The returned token is
    /// `None` when that event was a null result sent right away.
    ///
    /// # Errors
    ///
    /// - `BrokerError::PermissionDenied` for a cross-user call
    /// - `BrokerError::ChannelClosed` if the actor has shut down
    pub async fn create_session(
        &self,
        caller: CallerIdentity,
        user: UserId,
        client: ClientHandle,
        input_id: InputId,
        seq: u64,
    ) -> Result<Option<SessionToken>, BrokerError> {
        self.request(|respond_to| BrokerCommand::CreateSession {
            caller,
            user,
            client,
            input_id,
            seq,
            respond_to,
        })
        .await?
    }

    /// Releases a session. Unknown tokens are a no-op.
    pub async fn release_session(
        &self,
        caller: CallerIdentity,
        user: UserId,
        token: SessionToken,
    ) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::ReleaseSession {
            caller,
            user,
            token,
            respond_to,
        })
        .await?
    }

    pub async fn set_main_session(
        &self,
        caller: CallerIdentity,
        user: UserId,
        token: Option<SessionToken>,
    ) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::SetMainSession {
            caller,
            user,
            token,
            respond_to,
        })
        .await?
    }

    /// Forwards one operation to a live session.
    ///
    /// # Errors
    ///
    /// - `BrokerError::SessionNotFound` if the token is unknown or not yet live
    /// - `BrokerError::PermissionDenied` if the session belongs to another uid
    /// - `BrokerError::InvalidInput` for `Release` and `SetMain`
    pub async fn session_op(
        &self,
        caller: CallerIdentity,
        user: UserId,
        token: SessionToken,
        op: SessionOp,
    ) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::Session {
            caller,
            user,
            token,
            op,
            respond_to,
        })
        .await?
    }

    pub async fn is_single_session_active(
        &self,
        caller: CallerIdentity,
        user: UserId,
    ) -> Result<bool, BrokerError> {
        self.request(|respond_to| BrokerCommand::IsSingleSessionActive {
            caller,
            user,
            respond_to,
        })
        .await?
    }

    // ------------------------------------------------------------------
    // Hardware pass-through
    // ------------------------------------------------------------------

    /// Empty without the hardware permission.
    pub async fn get_hardware_list(
        &self,
        caller: CallerIdentity,
    ) -> Result<Vec<HardwareInfo>, BrokerError> {
        self.request(|respond_to| BrokerCommand::GetHardwareList { caller, respond_to })
            .await
    }

    pub async fn acquire_hardware(
        &self,
        caller: CallerIdentity,
        user: UserId,
        device_id: u32,
        input: InputDescriptor,
        callback: Arc<dyn HardwareCallback>,
    ) -> Result<Option<HardwareLease>, BrokerError> {
        self.request(|respond_to| BrokerCommand::AcquireHardware {
            caller,
            user,
            device_id,
            input,
            callback,
            respond_to,
        })
        .await?
    }

    pub async fn release_hardware(
        &self,
        caller: CallerIdentity,
        user: UserId,
        lease: HardwareLease,
    ) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::ReleaseHardware {
            caller,
            user,
            lease,
            respond_to,
        })
        .await?
    }

    pub async fn get_available_stream_configs(
        &self,
        caller: CallerIdentity,
        user: UserId,
        input_id: InputId,
    ) -> Result<Vec<StreamConfig>, BrokerError> {
        self.request(|respond_to| BrokerCommand::GetAvailableStreamConfigs {
            caller,
            user,
            input_id,
            respond_to,
        })
        .await?
    }

    pub async fn capture_frame(
        &self,
        caller: CallerIdentity,
        user: UserId,
        input_id: InputId,
        surface: SurfaceHandle,
        config: StreamConfig,
    ) -> Result<bool, BrokerError> {
        self.request(|respond_to| BrokerCommand::CaptureFrame {
            caller,
            user,
            input_id,
            surface,
            config,
            respond_to,
        })
        .await?
    }

    // ------------------------------------------------------------------
    // Users & diagnostics
    // ------------------------------------------------------------------

    /// Makes `user` the active user, tearing down the previous one.
    pub async fn switch_user(&self, user: UserId) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::SwitchUser { user, respond_to })
            .await
    }

    pub async fn remove_user(&self, user: UserId) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::RemoveUser { user, respond_to })
            .await
    }

    pub async fn snapshot(&self) -> Result<BrokerSnapshot, BrokerError> {
        self.request(|respond_to| BrokerCommand::Snapshot { respond_to })
            .await
    }
}
