//! Protocol message types for daemon communication.

use serde::{Deserialize, Serialize};
use tvim_core::{
    Bundle, ChannelUri, ContentRating, InputDescriptor, InputId, InputState, Permission,
    PlaybackParams, SessionEvent, SessionToken, TrackType, TuneParams, UserId,
};

use crate::version::ProtocolVersion;

/// Requests a client can send to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake. Must be the first message on a connection.
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        /// Capability permissions the client asks for.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        permissions: Vec<Permission>,
    },

    /// Ping to check connection
    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,

    // ------------------------------------------------------------------
    // Input registry
    // ------------------------------------------------------------------
    GetInputList,
    GetInputInfo { input_id: InputId },
    GetInputState { input_id: InputId },
    /// Start receiving input registry events on this connection.
    RegisterCallback,
    UnregisterCallback,

    // ------------------------------------------------------------------
    // Parental controls
    // ------------------------------------------------------------------
    IsParentalControlsEnabled,
    SetParentalControlsEnabled { enabled: bool },
    IsRatingBlocked { rating: ContentRating },
    AddBlockedRating { rating: ContentRating },
    RemoveBlockedRating { rating: ContentRating },
    GetBlockedRatings,

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------
    /// Result arrives later as `session_created` with the same `seq`.
    CreateSession { input_id: InputId, seq: u64 },
    ReleaseSession { token: SessionToken },
    SetMainSession {
        #[serde(default)]
        token: Option<SessionToken>,
    },
    Tune {
        token: SessionToken,
        uri: ChannelUri,
        #[serde(default)]
        params: TuneParams,
    },
    SetVolume { token: SessionToken, volume: f32 },
    SetCaptionEnabled { token: SessionToken, enabled: bool },
    SelectTrack {
        token: SessionToken,
        track_type: TrackType,
        #[serde(default)]
        track_id: Option<String>,
    },
    SendAppPrivateCommand {
        token: SessionToken,
        action: String,
        #[serde(default)]
        data: Bundle,
    },
    UnblockContent { token: SessionToken, rating: ContentRating },
    TimeShiftPause { token: SessionToken },
    TimeShiftResume { token: SessionToken },
    TimeShiftSeekTo { token: SessionToken, time_ms: i64 },
    TimeShiftSetPlaybackParams { token: SessionToken, params: PlaybackParams },
    TimeShiftEnablePositionTracking { token: SessionToken, enabled: bool },

    /// Diagnostic dump of broker state.
    Dump,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// User the request targets. Absent means the active user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,

    /// Message payload
    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            user_id: None,
            message,
        }
    }

    #[must_use]
    pub fn for_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn connect(client_id: Option<String>, permissions: Vec<Permission>) -> Self {
        Self::new(MessageType::Connect {
            client_id,
            permissions,
        })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }

    pub fn get_input_list() -> Self {
        Self::new(MessageType::GetInputList)
    }

    pub fn register_callback() -> Self {
        Self::new(MessageType::RegisterCallback)
    }

    pub fn create_session(input_id: InputId, seq: u64) -> Self {
        Self::new(MessageType::CreateSession { input_id, seq })
    }

    pub fn release_session(token: SessionToken) -> Self {
        Self::new(MessageType::ReleaseSession { token })
    }

    pub fn tune(token: SessionToken, uri: ChannelUri, params: TuneParams) -> Self {
        Self::new(MessageType::Tune { token, uri, params })
    }
}

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    InputNotFound,
    PermissionDenied,
    InvalidRequest,
    NotConnected,
    Internal,
}

/// Messages sent from daemon to clients.
///
/// Responses arrive in request order. Events (`input_*`, `session_*`)
/// may be interleaved between responses at any point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
        /// The user requests without `user_id` resolve to.
        user_id: UserId,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    Pong { seq: u64 },

    /// Request accepted with nothing to return.
    Ack,

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },

    // ------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------
    InputList { inputs: Vec<InputDescriptor> },
    InputInfo { input: Option<InputDescriptor> },
    InputState { input_id: InputId, state: InputState },
    ParentalControls { enabled: bool },
    RatingBlocked { rating: ContentRating, blocked: bool },
    BlockedRatings { ratings: Vec<ContentRating> },
    Dump { snapshot: serde_json::Value },

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------
    InputAdded { input_id: InputId },
    InputRemoved { input_id: InputId },
    InputUpdated { input_id: InputId },
    InputStateChanged { input_id: InputId, state: InputState },
    SessionCreated {
        input_id: InputId,
        token: Option<SessionToken>,
        seq: u64,
    },
    SessionReleased { token: SessionToken, seq: u64 },
    SessionEvent {
        token: SessionToken,
        seq: u64,
        event: SessionEvent,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String, user_id: UserId) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
            user_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn error(message: impl Into<String>, code: ErrorCode) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code),
        }
    }

    /// True for unsolicited event messages.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            Self::InputAdded { .. }
                | Self::InputRemoved { .. }
                | Self::InputUpdated { .. }
                | Self::InputStateChanged { .. }
                | Self::SessionCreated { .. }
                | Self::SessionReleased { .. }
                | Self::SessionEvent { .. }
        )
    }
}
