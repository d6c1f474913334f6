//! Events a session reports about itself.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelUri;
use crate::media::{Bundle, Rect, TimeShiftStatus, VideoUnavailableReason};
use crate::rating::ContentRating;
use crate::track::{TrackInfo, TrackType};

/// An event raised by a live session.
///
/// Providers emit these; the broker forwards them unchanged to the
/// client that owns the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    ChannelRetuned {
        uri: ChannelUri,
    },
    TracksChanged {
        tracks: Vec<TrackInfo>,
    },
    TrackSelected {
        track_type: TrackType,
        track_id: Option<String>,
    },
    VideoAvailable,
    VideoUnavailable {
        reason: VideoUnavailableReason,
    },
    ContentAllowed,
    ContentBlocked {
        rating: ContentRating,
    },
    LayoutSurface {
        frame: Rect,
    },
    /// Provider-defined event.
    Custom {
        event_type: String,
        #[serde(default)]
        args: Bundle,
    },
    TimeShiftStatusChanged {
        status: TimeShiftStatus,
    },
    TimeShiftStartPositionChanged {
        time_ms: i64,
    },
    TimeShiftCurrentPositionChanged {
        time_ms: i64,
    },
}

impl SessionEvent {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChannelRetuned { .. } => "channel_retuned",
            Self::TracksChanged { .. } => "tracks_changed",
            Self::TrackSelected { .. } => "track_selected",
            Self::VideoAvailable => "video_available",
            Self::VideoUnavailable { .. } => "video_unavailable",
            Self::ContentAllowed => "content_allowed",
            Self::ContentBlocked { .. } => "content_blocked",
            Self::LayoutSurface { .. } => "layout_surface",
            Self::Custom { .. } => "session_event",
            Self::TimeShiftStatusChanged { .. } => "time_shift_status_changed",
            Self::TimeShiftStartPositionChanged { .. } => "time_shift_start_position_changed",
            Self::TimeShiftCurrentPositionChanged { .. } => "time_shift_current_position_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let json = serde_json::to_string(&SessionEvent::VideoAvailable).unwrap();
        assert_eq!(json, r#"{"event":"video_available"}"#);

        let event: SessionEvent =
            serde_json::from_str(r#"{"event":"video_unavailable","reason":"weak_signal"}"#)
                .unwrap();
        assert_eq!(
            event,
            SessionEvent::VideoUnavailable {
                reason: VideoUnavailableReason::WeakSignal
            }
        );
    }
}
