//! In-process client of the broker.
//!
//! A [`TvInputManager`] is one client: it owns a peer (its liveness), one
//! ordered event channel from the broker, and a `seq → record` table that
//! routes each session's events to the channel returned by
//! [`TvInputManager::create_session`].
//!
//! ```ignore
//! let manager = TvInputManager::new(broker, caller, UserId::CURRENT);
//! let mut request = manager.create_session(input_id).await?;
//! if let Some(SessionCallbackEvent::Created(Some(session))) = request.recv().await {
//!     session.tune(ChannelUri::channel(7), TuneParams::new()).await?;
//! }
//! ```

mod session;
mod tracks;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use tvim_core::{
    CallerIdentity, ContentRating, HardwareInfo, InputDescriptor, InputId, InputState,
    SessionEvent, SessionToken, UserId,
};
use tvim_provider::Peer;

use crate::broker::{
    BrokerError, BrokerHandle, ClientEvent, ClientHandle, InputNotification, RegistryCallback,
};

pub use session::{Session, INPUT_EVENT_TIMEOUT};
use tracks::TrackState;

/// What a session request's channel delivers, in order.
#[derive(Debug)]
pub enum SessionCallbackEvent {
    /// Exactly once, first. `None` when the session could not be created.
    Created(Option<Session>),
    Released,
    Event(SessionEvent),
    /// The selected video track's size changed.
    VideoSizeChanged { width: u32, height: u32 },
}

/// The broker, the identity calls are made with, and the target user.
#[derive(Clone)]
pub(crate) struct CallContext {
    pub(crate) broker: BrokerHandle,
    pub(crate) caller: CallerIdentity,
    pub(crate) user: UserId,
}

/// Routing record of one `create_session` request.
struct SessionRecord {
    events: mpsc::UnboundedSender<SessionCallbackEvent>,
    tracks: Arc<Mutex<TrackState>>,
}

type Records = Arc<Mutex<HashMap<u64, SessionRecord>>>;

// ============================================================================
// Manager
// ============================================================================

/// A broker client.
///
/// Dropping the manager kills its peer; the broker then releases every
/// session it still owns.
pub struct TvInputManager {
    context: CallContext,
    peer: Peer,
    client: ClientHandle,
    next_seq: AtomicU64,
    records: Records,
    pump: JoinHandle<()>,
}

impl TvInputManager {
    pub fn new(broker: BrokerHandle, caller: CallerIdentity, user: UserId) -> Self {
        let peer = Peer::new(format!("client-{}", caller.pid));
        let (client, events) = ClientHandle::new(peer.clone());
        let context = CallContext {
            broker,
            caller,
            user,
        };
        let records: Records = Arc::new(Mutex::new(HashMap::new()));
        let pump = tokio::spawn(run_event_pump(events, records.clone(), context.clone()));
        Self {
            context,
            peer,
            client,
            next_seq: AtomicU64::new(0),
            records,
            pump,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    fn caller(&self) -> CallerIdentity {
        self.context.caller.clone()
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Requests a session on `input_id`.
    ///
    /// The returned channel yields `Created` exactly once, then the
    /// session's events until `Released`.
    pub async fn create_session(
        &self,
        input_id: InputId,
    ) -> Result<mpsc::UnboundedReceiver<SessionCallbackEvent>, BrokerError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (events, rx) = mpsc::unbounded_channel();
        self.records.lock().insert(
            seq,
            SessionRecord {
                events,
                tracks: Arc::new(Mutex::new(TrackState::default())),
            },
        );

        let result = self
            .context
            .broker
            .create_session(
                self.caller(),
                self.context.user,
                self.client.clone(),
                input_id,
                seq,
            )
            .await;
        if let Err(e) = result {
            self.records.lock().remove(&seq);
            return Err(e);
        }
        Ok(rx)
    }

    pub async fn set_main_session(&self, session: Option<&Session>) -> Result<(), BrokerError> {
        self.context
            .broker
            .set_main_session(self.caller(), self.context.user, session.map(Session::token))
            .await
    }

    pub async fn is_single_session_active(&self) -> Result<bool, BrokerError> {
        self.context
            .broker
            .is_single_session_active(self.caller(), self.context.user)
            .await
    }

    // ------------------------------------------------------------------
    // Input registry
    // ------------------------------------------------------------------

    pub async fn get_input_list(&self) -> Result<Vec<InputDescriptor>, BrokerError> {
        self.context
            .broker
            .get_input_list(self.caller(), self.context.user)
            .await
    }

    pub async fn get_input_info(
        &self,
        input_id: InputId,
    ) -> Result<Option<InputDescriptor>, BrokerError> {
        self.context
            .broker
            .get_input_info(self.caller(), self.context.user, input_id)
            .await
    }

    pub async fn get_input_state(&self, input_id: InputId) -> Result<InputState, BrokerError> {
        self.context
            .broker
            .get_input_state(self.caller(), self.context.user, input_id)
            .await
    }

    /// Registers for input-registry notifications.
    ///
    /// The registration lasts until the returned callback is dropped.
    pub async fn register_callback(&self) -> Result<InputCallback, BrokerError> {
        let peer = self.peer.child("registry-callback");
        let (callback, events) = RegistryCallback::new(peer.clone());
        self.context
            .broker
            .register_callback(self.caller(), self.context.user, callback)
            .await?;
        Ok(InputCallback { peer, events })
    }

    // ------------------------------------------------------------------
    // Parental controls
    // ------------------------------------------------------------------

    pub async fn is_parental_controls_enabled(&self) -> Result<bool, BrokerError> {
        self.context
            .broker
            .is_parental_controls_enabled(self.caller(), self.context.user)
            .await
    }

    pub async fn set_parental_controls_enabled(&self, enabled: bool) -> Result<(), BrokerError> {
        self.context
            .broker
            .set_parental_controls_enabled(self.caller(), self.context.user, enabled)
            .await
    }

    pub async fn is_rating_blocked(&self, rating: ContentRating) -> Result<bool, BrokerError> {
        self.context
            .broker
            .is_rating_blocked(self.caller(), self.context.user, rating)
            .await
    }

    pub async fn get_blocked_ratings(&self) -> Result<Vec<ContentRating>, BrokerError> {
        self.context
            .broker
            .get_blocked_ratings(self.caller(), self.context.user)
            .await
    }

    pub async fn add_blocked_rating(&self, rating: ContentRating) -> Result<(), BrokerError> {
        self.context
            .broker
            .add_blocked_rating(self.caller(), self.context.user, rating)
            .await
    }

    pub async fn remove_blocked_rating(&self, rating: ContentRating) -> Result<(), BrokerError> {
        self.context
            .broker
            .remove_blocked_rating(self.caller(), self.context.user, rating)
            .await
    }

    pub async fn get_hardware_list(&self) -> Result<Vec<HardwareInfo>, BrokerError> {
        self.context.broker.get_hardware_list(self.caller()).await
    }
}

impl Drop for TvInputManager {
    fn drop(&mut self) {
        self.peer.kill();
        self.pump.abort();
    }
}

/// Registry notifications for one registration.
pub struct InputCallback {
    peer: Peer,
    events: mpsc::UnboundedReceiver<InputNotification>,
}

impl InputCallback {
    pub async fn recv(&mut self) -> Option<InputNotification> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InputNotification> {
        self.events.try_recv().ok()
    }
}

impl Drop for InputCallback {
    fn drop(&mut self) {
        self.peer.kill();
    }
}

// ============================================================================
// Event pump
// ============================================================================

/// Routes broker events to session records by `seq`.
async fn run_event_pump(
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    records: Records,
    context: CallContext,
) {
    while let Some(event) = events.recv().await {
        route_event(event, &records, &context);
    }
    debug!("Client event pump stopped");
}

fn route_event(event: ClientEvent, records: &Records, context: &CallContext) {
    match event {
        ClientEvent::SessionCreated {
            input_id,
            token,
            channel,
            seq,
        } => {
            let mut records = records.lock();
            let Some(record) = records.get(&seq) else {
                trace!(seq, "Creation result for unknown request");
                return;
            };
            let session = token.map(|token| {
                Session::new(
                    token,
                    input_id,
                    seq,
                    context.clone(),
                    record.tracks.clone(),
                    channel,
                )
            });
            let created = session.is_some();
            let _ = record.events.send(SessionCallbackEvent::Created(session));
            if !created {
                records.remove(&seq);
            }
        }
        ClientEvent::SessionReleased { token, seq } => {
            if let Some(record) = records.lock().remove(&seq) {
                debug!(token = %token, seq, "Session released by broker");
                let _ = record.events.send(SessionCallbackEvent::Released);
            }
        }
        ClientEvent::Session { token, seq, event } => {
            let records = records.lock();
            let Some(record) = records.get(&seq) else {
                trace!(token = %token, seq, "Event for unknown session dropped");
                return;
            };
            deliver_session_event(record, event);
        }
    }
}

fn deliver_session_event(record: &SessionRecord, event: SessionEvent) {
    let mut tracks = record.tracks.lock();
    let track_change = match &event {
        SessionEvent::TracksChanged { tracks: list } => {
            tracks.update_tracks(list.clone());
            true
        }
        SessionEvent::TrackSelected {
            track_type,
            track_id,
        } => {
            if !tracks.update_selection(*track_type, track_id.clone()) {
                // Repeated selection
                return;
            }
            true
        }
        _ => false,
    };
    let video_size = if track_change {
        tracks.video_size_to_notify()
    } else {
        None
    };
    drop(tracks);

    let _ = record.events.send(SessionCallbackEvent::Event(event));
    if let Some((width, height)) = video_size {
        let _ = record.events.send(SessionCallbackEvent::VideoSizeChanged { width, height });
    }
}

impl SessionCallbackEvent {
    /// The token of a created session.
    pub fn token(&self) -> Option<SessionToken> {
        match self {
            Self::Created(Some(session)) => Some(session.token()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tvim_core::{TrackInfo, TrackType};

    fn record() -> (SessionRecord, mpsc::UnboundedReceiver<SessionCallbackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            SessionRecord {
                events,
                tracks: Arc::new(Mutex::new(TrackState::default())),
            },
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionCallbackEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(match event {
                SessionCallbackEvent::Event(e) => e.name().to_string(),
                SessionCallbackEvent::VideoSizeChanged { width, height } => {
                    format!("video_size {width}x{height}")
                }
                SessionCallbackEvent::Created(_) => "created".to_string(),
                SessionCallbackEvent::Released => "released".to_string(),
            });
        }
        out
    }

    #[test]
    fn test_video_size_follows_track_events() {
        let (record, mut rx) = record();
        deliver_session_event(
            &record,
            SessionEvent::TracksChanged {
                tracks: vec![TrackInfo::video("v1", 1920, 1080)],
            },
        );
        deliver_session_event(
            &record,
            SessionEvent::TrackSelected {
                track_type: TrackType::Video,
                track_id: Some("v1".into()),
            },
        );
        // Repeated selection is swallowed
        deliver_session_event(
            &record,
            SessionEvent::TrackSelected {
                track_type: TrackType::Video,
                track_id: Some("v1".into()),
            },
        );
        deliver_session_event(&record, SessionEvent::VideoAvailable);

        assert_eq!(
            drain(&mut rx),
            vec![
                "tracks_changed",
                "track_selected",
                "video_size 1920x1080",
                "video_available"
            ]
        );
    }
}
