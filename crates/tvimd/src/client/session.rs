//! Client-side session handle and its input-event sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use tvim_core::{
    Bundle, ChannelUri, ContentRating, InputId, PlaybackParams, Rect, SessionToken,
    SurfaceHandle, TrackInfo, TrackType, TuneParams,
};
use tvim_provider::{InputChannelClient, InputEvent, SessionOp};

use super::tracks::TrackState;
use super::CallContext;
use crate::broker::BrokerError;

/// How long a dispatched input event may stay unacknowledged.
pub const INPUT_EVENT_TIMEOUT: Duration = Duration::from_millis(2500);

/// A live session owned by this client.
///
/// Operations are forwarded to the broker. Dropping the handle does not
/// release the session; call [`Session::release`].
pub struct Session {
    token: SessionToken,
    input_id: InputId,
    seq: u64,
    context: CallContext,
    tracks: Arc<Mutex<TrackState>>,
    input: Option<InputSender>,
    released: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        token: SessionToken,
        input_id: InputId,
        seq: u64,
        context: CallContext,
        tracks: Arc<Mutex<TrackState>>,
        channel: Option<InputChannelClient>,
    ) -> Self {
        Self {
            token,
            input_id,
            seq,
            context,
            tracks,
            input: channel.map(InputSender::spawn),
            released: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn input_id(&self) -> &InputId {
        &self.input_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    async fn op(&self, op: SessionOp) -> Result<(), BrokerError> {
        if self.is_released() {
            return Err(BrokerError::SessionNotFound(self.token));
        }
        let ctx = &self.context;
        ctx.broker
            .session_op(ctx.caller.clone(), ctx.user, self.token, op)
            .await
    }

    // ------------------------------------------------------------------
    // Playback
    // ------------------------------------------------------------------

    pub async fn tune(&self, uri: ChannelUri, params: TuneParams) -> Result<(), BrokerError> {
        self.op(SessionOp::Tune { uri, params }).await
    }

    pub async fn set_surface(&self, surface: Option<SurfaceHandle>) -> Result<(), BrokerError> {
        self.op(SessionOp::SetSurface(surface)).await
    }

    pub async fn dispatch_surface_changed(
        &self,
        format: i32,
        width: u32,
        height: u32,
    ) -> Result<(), BrokerError> {
        self.op(SessionOp::DispatchSurfaceChanged {
            format,
            width,
            height,
        })
        .await
    }

    pub async fn set_volume(&self, volume: f32) -> Result<(), BrokerError> {
        self.op(SessionOp::SetVolume(volume)).await
    }

    pub async fn set_caption_enabled(&self, enabled: bool) -> Result<(), BrokerError> {
        self.op(SessionOp::SetCaptionEnabled(enabled)).await
    }

    pub async fn select_track(
        &self,
        track_type: TrackType,
        track_id: Option<String>,
    ) -> Result<(), BrokerError> {
        self.op(SessionOp::SelectTrack {
            track_type,
            track_id,
        })
        .await
    }

    pub async fn send_app_private_command(
        &self,
        action: impl Into<String>,
        data: Bundle,
    ) -> Result<(), BrokerError> {
        self.op(SessionOp::AppPrivateCommand {
            action: action.into(),
            data,
        })
        .await
    }

    pub async fn unblock_content(&self, rating: ContentRating) -> Result<(), BrokerError> {
        self.op(SessionOp::UnblockContent(rating)).await
    }

    // ------------------------------------------------------------------
    // Overlay view
    // ------------------------------------------------------------------

    pub async fn create_overlay_view(&self, window_token: u64, frame: Rect) -> Result<(), BrokerError> {
        self.op(SessionOp::CreateOverlayView {
            window_token,
            frame,
        })
        .await
    }

    pub async fn relayout_overlay_view(&self, frame: Rect) -> Result<(), BrokerError> {
        self.op(SessionOp::RelayoutOverlayView(frame)).await
    }

    pub async fn remove_overlay_view(&self) -> Result<(), BrokerError> {
        self.op(SessionOp::RemoveOverlayView).await
    }

    // ------------------------------------------------------------------
    // Time shift
    // ------------------------------------------------------------------

    pub async fn time_shift_pause(&self) -> Result<(), BrokerError> {
        self.op(SessionOp::TimeShiftPause).await
    }

    pub async fn time_shift_resume(&self) -> Result<(), BrokerError> {
        self.op(SessionOp::TimeShiftResume).await
    }

    pub async fn time_shift_seek_to(&self, time_ms: i64) -> Result<(), BrokerError> {
        self.op(SessionOp::TimeShiftSeekTo(time_ms)).await
    }

    pub async fn time_shift_set_playback_params(
        &self,
        params: PlaybackParams,
    ) -> Result<(), BrokerError> {
        self.op(SessionOp::TimeShiftSetPlaybackParams(params)).await
    }

    pub async fn time_shift_enable_position_tracking(&self, enabled: bool) -> Result<(), BrokerError> {
        self.op(SessionOp::TimeShiftEnablePositionTracking(enabled))
            .await
    }

    // ------------------------------------------------------------------
    // Tracks
    // ------------------------------------------------------------------

    pub fn tracks(&self, track_type: TrackType) -> Vec<TrackInfo> {
        self.tracks.lock().tracks(track_type)
    }

    pub fn selected_track(&self, track_type: TrackType) -> Option<String> {
        self.tracks.lock().selected(track_type)
    }

    // ------------------------------------------------------------------
    // Input events
    // ------------------------------------------------------------------

    /// Sends an input event to the provider and waits for its answer.
    ///
    /// Returns whether the provider handled it. An event left unanswered
    /// for [`INPUT_EVENT_TIMEOUT`] resolves as not handled.
    pub async fn dispatch_input_event(&self, event: InputEvent) -> bool {
        let Some(input) = &self.input else {
            return false;
        };
        if self.is_released() {
            return false;
        }
        let Some(answer) = input.send(event) else {
            return false;
        };
        match tokio::time::timeout(INPUT_EVENT_TIMEOUT, answer).await {
            Ok(Ok(handled)) => handled,
            // Flushed on release, or the provider end is gone
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(token = %self.token, "Input event timed out, treating as not handled");
                false
            }
        }
    }

    /// Releases the session. Pending input events resolve as not handled.
    pub async fn release(&self) -> Result<(), BrokerError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(input) = &self.input {
            input.flush();
        }
        let ctx = &self.context;
        ctx.broker
            .release_session(ctx.caller.clone(), ctx.user, self.token)
            .await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("input_id", &self.input_id)
            .field("seq", &self.seq)
            .finish()
    }
}

// ============================================================================
// Input sender
// ============================================================================

enum InputRequest {
    Dispatch {
        event: InputEvent,
        answer: oneshot::Sender<bool>,
    },
    Flush,
}

/// Owns the client end of the input channel on a background task.
struct InputSender {
    requests: mpsc::UnboundedSender<InputRequest>,
}

impl InputSender {
    fn spawn(channel: InputChannelClient) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_input_sender(channel, rx));
        Self { requests }
    }

    fn send(&self, event: InputEvent) -> Option<oneshot::Receiver<bool>> {
        let (answer, rx) = oneshot::channel();
        self.requests
            .send(InputRequest::Dispatch { event, answer })
            .ok()?;
        Some(rx)
    }

    fn flush(&self) {
        let _ = self.requests.send(InputRequest::Flush);
    }
}

/// Answers waiting for the provider to finish their event, by sequence.
#[derive(Default)]
struct PendingAnswers {
    answers: HashMap<u64, oneshot::Sender<bool>>,
}

impl PendingAnswers {
    /// Drops answers whose caller stopped waiting before adding `answer`.
    fn insert(&mut self, seq: u64, answer: oneshot::Sender<bool>) {
        self.answers.retain(|_, waiting| !waiting.is_closed());
        self.answers.insert(seq, answer);
    }

    fn resolve(&mut self, seq: u64, handled: bool) {
        // Late answers to timed-out events find a closed receiver
        if let Some(answer) = self.answers.remove(&seq) {
            let _ = answer.send(handled);
        }
    }

    fn flush(&mut self) {
        for (_, answer) in self.answers.drain() {
            let _ = answer.send(false);
        }
    }

    fn len(&self) -> usize {
        self.answers.len()
    }
}

async fn run_input_sender(
    mut channel: InputChannelClient,
    mut requests: mpsc::UnboundedReceiver<InputRequest>,
) {
    let mut pending = PendingAnswers::default();
    let mut next_seq: u64 = 0;

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(InputRequest::Dispatch { event, answer }) => {
                    next_seq += 1;
                    if channel.send(next_seq, event).is_err() {
                        let _ = answer.send(false);
                        continue;
                    }
                    pending.insert(next_seq, answer);
                    trace!(channel = channel.name(), pending = pending.len(), "Input event sent");
                }
                Some(InputRequest::Flush) | None => {
                    pending.flush();
                    debug!(channel = channel.name(), "Input channel flushed");
                    break;
                }
            },
            finished = channel.recv_finished() => match finished {
                Some((seq, handled)) => pending.resolve(seq, handled),
                None => {
                    pending.flush();
                    break;
                }
            },
        }
    }
}
