//! The trait a provider implements for each session it creates.

use async_trait::async_trait;

use tvim_core::{
    Bundle, ChannelUri, ContentRating, PlaybackParams, Rect, SurfaceHandle, TrackType, TuneParams,
};

use crate::input::{InputDispatch, InputEvent, InputEventFinisher};
use crate::op::SessionOp;

/// Provider-side behaviour of one session.
///
/// Methods run one at a time on the session's worker, in the order the
/// broker issued them. Only `on_release`, `on_set_surface`,
/// `on_set_stream_volume`, `on_tune` and `on_set_caption_enabled` are
/// mandatory.
#[async_trait]
pub trait SessionImpl: Send + Sync + 'static {
    async fn on_release(&self);

    async fn on_set_main(&self, _is_main: bool) {}

    async fn on_set_surface(&self, surface: Option<SurfaceHandle>) -> bool;

    async fn on_surface_changed(&self, _format: i32, _width: u32, _height: u32) {}

    async fn on_set_stream_volume(&self, volume: f32);

    async fn on_tune(&self, uri: &ChannelUri, params: &TuneParams) -> bool;

    async fn on_set_caption_enabled(&self, enabled: bool);

    async fn on_select_track(&self, _track_type: TrackType, _track_id: Option<&str>) -> bool {
        false
    }

    async fn on_app_private_command(&self, _action: &str, _data: &Bundle) {}

    async fn on_create_overlay_view(&self, _window_token: u64, _frame: Rect) {}

    async fn on_relayout_overlay_view(&self, _frame: Rect) {}

    async fn on_remove_overlay_view(&self) {}

    async fn on_unblock_content(&self, _rating: &ContentRating) {}

    async fn on_time_shift_pause(&self) {}

    async fn on_time_shift_resume(&self) {}

    async fn on_time_shift_seek_to(&self, _time_ms: i64) {}

    async fn on_time_shift_set_playback_params(&self, _params: PlaybackParams) {}

    async fn on_time_shift_enable_position_tracking(&self, _enabled: bool) {}

    /// Handles an input event. Runs on the input receiver, not the worker.
    fn on_input_event(&self, _event: &InputEvent, _finisher: InputEventFinisher) -> InputDispatch {
        InputDispatch::NotHandled
    }

    /// Release hook run synchronously by the caller, before the release
    /// message is queued.
    fn schedule_overlay_view_cleanup(&self) {}
}

/// Runs one queued operation against the implementation.
pub(crate) async fn execute(session: &dyn SessionImpl, op: SessionOp) {
    match op {
        SessionOp::Release => session.on_release().await,
        SessionOp::SetMain(is_main) => session.on_set_main(is_main).await,
        SessionOp::SetSurface(surface) => {
            session.on_set_surface(surface).await;
        }
        SessionOp::DispatchSurfaceChanged {
            format,
            width,
            height,
        } => session.on_surface_changed(format, width, height).await,
        SessionOp::SetVolume(volume) => session.on_set_stream_volume(volume).await,
        SessionOp::Tune { uri, params } => {
            session.on_tune(&uri, &params).await;
        }
        SessionOp::SetCaptionEnabled(enabled) => session.on_set_caption_enabled(enabled).await,
        SessionOp::SelectTrack {
            track_type,
            track_id,
        } => {
            session.on_select_track(track_type, track_id.as_deref()).await;
        }
        SessionOp::AppPrivateCommand { action, data } => {
            session.on_app_private_command(&action, &data).await
        }
        SessionOp::CreateOverlayView {
            window_token,
            frame,
        } => session.on_create_overlay_view(window_token, frame).await,
        SessionOp::RelayoutOverlayView(frame) => session.on_relayout_overlay_view(frame).await,
        SessionOp::RemoveOverlayView => session.on_remove_overlay_view().await,
        SessionOp::UnblockContent(rating) => session.on_unblock_content(&rating).await,
        SessionOp::TimeShiftPause => session.on_time_shift_pause().await,
        SessionOp::TimeShiftResume => session.on_time_shift_resume().await,
        SessionOp::TimeShiftSeekTo(time_ms) => session.on_time_shift_seek_to(time_ms).await,
        SessionOp::TimeShiftSetPlaybackParams(params) => {
            session.on_time_shift_set_playback_params(params).await
        }
        SessionOp::TimeShiftEnablePositionTracking(enabled) => {
            session.on_time_shift_enable_position_tracking(enabled).await
        }
    }
}
