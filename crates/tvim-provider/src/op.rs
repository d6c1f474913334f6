//! Operations a session accepts, one variant per public call.

use tvim_core::{
    Bundle, ChannelUri, ContentRating, PlaybackParams, Rect, SurfaceHandle, TrackType, TuneParams,
};

/// One message on a session's dispatch queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOp {
    Release,
    SetMain(bool),
    SetSurface(Option<SurfaceHandle>),
    DispatchSurfaceChanged {
        format: i32,
        width: u32,
        height: u32,
    },
    SetVolume(f32),
    Tune {
        uri: ChannelUri,
        params: TuneParams,
    },
    SetCaptionEnabled(bool),
    SelectTrack {
        track_type: TrackType,
        track_id: Option<String>,
    },
    AppPrivateCommand {
        action: String,
        data: Bundle,
    },
    CreateOverlayView {
        window_token: u64,
        frame: Rect,
    },
    RelayoutOverlayView(Rect),
    RemoveOverlayView,
    UnblockContent(ContentRating),
    TimeShiftPause,
    TimeShiftResume,
    TimeShiftSeekTo(i64),
    TimeShiftSetPlaybackParams(PlaybackParams),
    TimeShiftEnablePositionTracking(bool),
}

impl SessionOp {
    /// Short name for logs and latency reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::SetMain(_) => "set_main",
            Self::SetSurface(_) => "set_surface",
            Self::DispatchSurfaceChanged { .. } => "dispatch_surface_changed",
            Self::SetVolume(_) => "set_volume",
            Self::Tune { .. } => "tune",
            Self::SetCaptionEnabled(_) => "set_caption_enabled",
            Self::SelectTrack { .. } => "select_track",
            Self::AppPrivateCommand { .. } => "app_private_command",
            Self::CreateOverlayView { .. } => "create_overlay_view",
            Self::RelayoutOverlayView(_) => "relayout_overlay_view",
            Self::RemoveOverlayView => "remove_overlay_view",
            Self::UnblockContent(_) => "unblock_content",
            Self::TimeShiftPause => "time_shift_pause",
            Self::TimeShiftResume => "time_shift_resume",
            Self::TimeShiftSeekTo(_) => "time_shift_seek_to",
            Self::TimeShiftSetPlaybackParams(_) => "time_shift_set_playback_params",
            Self::TimeShiftEnablePositionTracking(_) => "time_shift_enable_position_tracking",
        }
    }

    pub fn is_tune(&self) -> bool {
        matches!(self, Self::Tune { .. })
    }

    pub fn is_release(&self) -> bool {
        matches!(self, Self::Release)
    }
}
