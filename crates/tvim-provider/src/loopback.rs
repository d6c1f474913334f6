//! Loopback provider: a complete in-process provider.
//!
//! Sessions run on real [`SessionWrapper`]s and journal every executed
//! operation. A tune reports the usual sequence of events (video
//! unavailable while tuning, track list, selected video track, video
//! available). Registered as a hardware provider, it turns hardware and
//! HDMI notifications into input reports.
//!
//! The daemon serves it for manifests that name the `loopback` runtime;
//! the broker tests drive it directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use tvim_core::{
    Bundle, ChannelUri, ComponentName, ContentRating, HardwareInfo, HdmiDeviceInfo,
    InputDescriptor, InputId, PlaybackParams, Rect, SessionEvent, SessionToken, SurfaceHandle,
    TimeShiftStatus, TrackInfo, TrackType, TuneParams, VideoUnavailableReason,
};

use crate::error::RemoteError;
use crate::input::{InputChannelServer, InputDispatch, InputEvent, InputEventFinisher};
use crate::op::SessionOp;
use crate::peer::Peer;
use crate::remote::{ProviderService, RemoteSession, ServiceCallback, SessionCallback};
use crate::session::SessionImpl;
use crate::wrapper::{LatencyLimits, SessionWrapper};

// ============================================================================
// Journal
// ============================================================================

/// Something the loopback provider observed.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    CallbackRegistered,
    CallbackUnregistered,
    SessionCreated { session: u64, input_id: InputId },
    Executed { session: u64, op: SessionOp },
    HardwareAdded(HardwareInfo),
    HardwareRemoved(HardwareInfo),
    HdmiDeviceAdded(HdmiDeviceInfo),
    HdmiDeviceRemoved(HdmiDeviceInfo),
}

#[derive(Debug, Default)]
struct JournalInner {
    entries: Vec<JournalEntry>,
    sessions: u64,
}

/// Shared, append-only record of a loopback provider's activity.
///
/// Session numbers are allocated from the journal, so providers sharing
/// one journal never reuse a number.
#[derive(Debug, Clone, Default)]
pub struct LoopbackJournal(Arc<Mutex<JournalInner>>);

impl LoopbackJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: JournalEntry) {
        self.0.lock().entries.push(entry);
    }

    fn record_session(&self, input_id: &InputId) -> u64 {
        let mut inner = self.0.lock();
        inner.sessions += 1;
        let session = inner.sessions;
        inner.entries.push(JournalEntry::SessionCreated {
            session,
            input_id: input_id.clone(),
        });
        session
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().entries.clone()
    }

    /// Operations executed by one session, in execution order.
    pub fn executed(&self, session: u64) -> Vec<SessionOp> {
        self.0
            .lock()
            .entries
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::Executed { session: s, op } if *s == session => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every operation executed by any session, with its session number.
    pub fn all_executed(&self) -> Vec<(u64, SessionOp)> {
        self.0
            .lock()
            .entries
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::Executed { session, op } => Some((*session, op.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn sessions_created(&self) -> usize {
        self.0
            .lock()
            .entries
            .iter()
            .filter(|entry| matches!(entry, JournalEntry::SessionCreated { .. }))
            .count()
    }
}

// ============================================================================
// Provider
// ============================================================================

/// An in-process provider.
pub struct LoopbackProvider {
    component: ComponentName,
    peer: Peer,
    journal: LoopbackJournal,
    limits: LatencyLimits,
    fail_creation: AtomicBool,
    gate: Option<Arc<Semaphore>>,
    hardware_session: Mutex<Option<SessionToken>>,
    service_callback: Mutex<Option<Arc<dyn ServiceCallback>>>,
}

impl LoopbackProvider {
    pub fn new(component: ComponentName) -> Self {
        let peer = Peer::new(format!("provider:{component}"));
        Self {
            component,
            peer,
            journal: LoopbackJournal::new(),
            limits: LatencyLimits::default(),
            fail_creation: AtomicBool::new(false),
            gate: None,
            hardware_session: Mutex::new(None),
            service_callback: Mutex::new(None),
        }
    }

    /// Shares a journal across provider instances (e.g. reconnects).
    #[must_use]
    pub fn with_journal(mut self, journal: LoopbackJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Every session operation waits for a permit before running.
    ///
    /// Permits are returned after use, so one permit opens the gate.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: LatencyLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Reports every created session as wrapping `token`.
    pub fn set_hardware_session(&self, token: Option<SessionToken>) {
        *self.hardware_session.lock() = token;
    }

    /// Makes later creations fail with a null session.
    pub fn set_fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    pub fn component(&self) -> &ComponentName {
        &self.component
    }

    pub fn journal(&self) -> &LoopbackJournal {
        &self.journal
    }

    /// Simulates a provider crash.
    pub fn crash(&self) {
        info!(component = %self.component, "Loopback provider crashing");
        self.peer.kill();
    }

    fn service_callback(&self) -> Option<Arc<dyn ServiceCallback>> {
        self.service_callback.lock().clone()
    }

    fn hardware_descriptor(&self, hardware: &HardwareInfo) -> InputDescriptor {
        InputDescriptor::new(
            InputId::for_hardware(&self.component, hardware),
            self.component.clone(),
            hardware.input_type,
        )
        .with_hardware(true)
    }
}

impl ProviderService for LoopbackProvider {
    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn register_callback(&self, callback: Arc<dyn ServiceCallback>) -> Result<(), RemoteError> {
        self.peer.ensure_alive()?;
        *self.service_callback.lock() = Some(callback);
        self.journal.push(JournalEntry::CallbackRegistered);
        Ok(())
    }

    fn unregister_callback(&self) -> Result<(), RemoteError> {
        self.peer.ensure_alive()?;
        *self.service_callback.lock() = None;
        self.journal.push(JournalEntry::CallbackUnregistered);
        Ok(())
    }

    fn create_session(
        &self,
        channel: InputChannelServer,
        callback: Arc<dyn SessionCallback>,
        input_id: &InputId,
    ) -> Result<(), RemoteError> {
        self.peer.ensure_alive()?;

        if self.fail_creation.load(Ordering::SeqCst) {
            debug!(input_id = %input_id, "Loopback refusing session");
            callback.on_session_created(None, None);
            return Ok(());
        }

        let number = self.journal.record_session(input_id);

        let session = Arc::new(LoopbackSession {
            number,
            journal: self.journal.clone(),
            gate: self.gate.clone(),
            callback: callback.clone(),
        });
        let wrapper = SessionWrapper::spawn(
            session,
            &self.peer,
            &format!("{input_id}#{number}"),
            Some(channel),
            self.limits,
        );
        let hardware_session = *self.hardware_session.lock();
        callback.on_session_created(Some(wrapper as Arc<dyn RemoteSession>), hardware_session);
        Ok(())
    }

    fn notify_hardware_added(&self, hardware: &HardwareInfo) -> Result<(), RemoteError> {
        self.peer.ensure_alive()?;
        self.journal.push(JournalEntry::HardwareAdded(hardware.clone()));
        if let Some(callback) = self.service_callback() {
            callback.add_hardware_input(hardware.device_id, self.hardware_descriptor(hardware));
        }
        Ok(())
    }

    fn notify_hardware_removed(&self, hardware: &HardwareInfo) -> Result<(), RemoteError> {
        self.peer.ensure_alive()?;
        self.journal.push(JournalEntry::HardwareRemoved(hardware.clone()));
        if let Some(callback) = self.service_callback() {
            callback.remove_input(InputId::for_hardware(&self.component, hardware));
        }
        Ok(())
    }

    fn notify_hdmi_device_added(&self, device: &HdmiDeviceInfo) -> Result<(), RemoteError> {
        self.peer.ensure_alive()?;
        self.journal.push(JournalEntry::HdmiDeviceAdded(device.clone()));
        if let Some(callback) = self.service_callback() {
            let mut descriptor = InputDescriptor::new(
                InputId::for_hdmi_device(&self.component, device),
                self.component.clone(),
                tvim_core::InputType::Hdmi,
            )
            .with_hardware(true)
            .with_hdmi_device(device.id);
            descriptor.label = device.display_name.clone();
            callback.add_hdmi_input(device.id, descriptor);
        }
        Ok(())
    }

    fn notify_hdmi_device_removed(&self, device: &HdmiDeviceInfo) -> Result<(), RemoteError> {
        self.peer.ensure_alive()?;
        self.journal.push(JournalEntry::HdmiDeviceRemoved(device.clone()));
        if let Some(callback) = self.service_callback() {
            callback.remove_input(InputId::for_hdmi_device(&self.component, device));
        }
        Ok(())
    }
}

// ============================================================================
// Session
// ============================================================================

struct LoopbackSession {
    number: u64,
    journal: LoopbackJournal,
    gate: Option<Arc<Semaphore>>,
    callback: Arc<dyn SessionCallback>,
}

impl LoopbackSession {
    async fn record(&self, op: SessionOp) {
        if let Some(gate) = &self.gate {
            // A closed semaphore opens the gate for good
            let _permit = gate.acquire().await;
        }
        self.journal.push(JournalEntry::Executed {
            session: self.number,
            op,
        });
    }

    fn emit(&self, event: SessionEvent) {
        self.callback.on_event(event);
    }
}

#[async_trait]
impl SessionImpl for LoopbackSession {
    async fn on_release(&self) {
        self.record(SessionOp::Release).await;
    }

    async fn on_set_main(&self, is_main: bool) {
        self.record(SessionOp::SetMain(is_main)).await;
    }

    async fn on_set_surface(&self, surface: Option<SurfaceHandle>) -> bool {
        self.record(SessionOp::SetSurface(surface)).await;
        true
    }

    async fn on_surface_changed(&self, format: i32, width: u32, height: u32) {
        self.record(SessionOp::DispatchSurfaceChanged {
            format,
            width,
            height,
        })
        .await;
    }

    async fn on_set_stream_volume(&self, volume: f32) {
        self.record(SessionOp::SetVolume(volume)).await;
    }

    async fn on_tune(&self, uri: &ChannelUri, params: &TuneParams) -> bool {
        self.record(SessionOp::Tune {
            uri: uri.clone(),
            params: params.clone(),
        })
        .await;

        self.emit(SessionEvent::VideoUnavailable {
            reason: VideoUnavailableReason::Tuning,
        });
        self.emit(SessionEvent::TracksChanged {
            tracks: vec![
                TrackInfo::video("v0", 1920, 1080),
                TrackInfo::audio("a0", 2).with_language("en"),
            ],
        });
        self.emit(SessionEvent::TrackSelected {
            track_type: TrackType::Video,
            track_id: Some("v0".to_string()),
        });
        self.emit(SessionEvent::VideoAvailable);
        true
    }

    async fn on_set_caption_enabled(&self, enabled: bool) {
        self.record(SessionOp::SetCaptionEnabled(enabled)).await;
    }

    async fn on_select_track(&self, track_type: TrackType, track_id: Option<&str>) -> bool {
        self.record(SessionOp::SelectTrack {
            track_type,
            track_id: track_id.map(str::to_string),
        })
        .await;
        self.emit(SessionEvent::TrackSelected {
            track_type,
            track_id: track_id.map(str::to_string),
        });
        true
    }

    async fn on_app_private_command(&self, action: &str, data: &Bundle) {
        self.record(SessionOp::AppPrivateCommand {
            action: action.to_string(),
            data: data.clone(),
        })
        .await;
    }

    async fn on_create_overlay_view(&self, window_token: u64, frame: Rect) {
        self.record(SessionOp::CreateOverlayView {
            window_token,
            frame,
        })
        .await;
    }

    async fn on_relayout_overlay_view(&self, frame: Rect) {
        self.record(SessionOp::RelayoutOverlayView(frame)).await;
    }

    async fn on_remove_overlay_view(&self) {
        self.record(SessionOp::RemoveOverlayView).await;
    }

    async fn on_unblock_content(&self, rating: &ContentRating) {
        self.record(SessionOp::UnblockContent(rating.clone())).await;
        self.emit(SessionEvent::ContentAllowed);
    }

    async fn on_time_shift_pause(&self) {
        self.record(SessionOp::TimeShiftPause).await;
    }

    async fn on_time_shift_resume(&self) {
        self.record(SessionOp::TimeShiftResume).await;
    }

    async fn on_time_shift_seek_to(&self, time_ms: i64) {
        self.record(SessionOp::TimeShiftSeekTo(time_ms)).await;
        self.emit(SessionEvent::TimeShiftCurrentPositionChanged { time_ms });
    }

    async fn on_time_shift_set_playback_params(&self, params: PlaybackParams) {
        self.record(SessionOp::TimeShiftSetPlaybackParams(params)).await;
    }

    async fn on_time_shift_enable_position_tracking(&self, enabled: bool) {
        self.record(SessionOp::TimeShiftEnablePositionTracking(enabled))
            .await;
        if enabled {
            self.emit(SessionEvent::TimeShiftStatusChanged {
                status: TimeShiftStatus::Unsupported,
            });
        }
    }

    fn on_input_event(&self, event: &InputEvent, _finisher: InputEventFinisher) -> InputDispatch {
        match event {
            InputEvent::Key { .. } => InputDispatch::Handled,
            InputEvent::Motion { .. } => InputDispatch::NotHandled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::input_channel_pair;
    use std::time::Duration;

    #[derive(Default)]
    struct CapturingCallback {
        created: Mutex<Vec<Option<Arc<dyn RemoteSession>>>>,
        events: Mutex<Vec<SessionEvent>>,
    }

    impl SessionCallback for CapturingCallback {
        fn on_session_created(
            &self,
            session: Option<Arc<dyn RemoteSession>>,
            _hardware_session: Option<SessionToken>,
        ) {
            self.created.lock().push(session);
        }

        fn on_event(&self, event: SessionEvent) {
            self.events.lock().push(event);
        }
    }

    #[derive(Default)]
    struct CapturingServiceCallback {
        added: Mutex<Vec<(u32, InputDescriptor)>>,
        removed: Mutex<Vec<InputId>>,
    }

    impl ServiceCallback for CapturingServiceCallback {
        fn add_hardware_input(&self, device_id: u32, input: InputDescriptor) {
            self.added.lock().push((device_id, input));
        }

        fn add_hdmi_input(&self, hdmi_device_id: u32, input: InputDescriptor) {
            self.added.lock().push((hdmi_device_id, input));
        }

        fn remove_input(&self, input_id: InputId) {
            self.removed.lock().push(input_id);
        }
    }

    fn provider() -> LoopbackProvider {
        LoopbackProvider::new(ComponentName::new("com.loop", "com.loop.Service"))
    }

    #[tokio::test]
    async fn test_create_and_tune() {
        let provider = provider();
        let callback = Arc::new(CapturingCallback::default());
        let (_client, server) = input_channel_pair("s");
        provider
            .create_session(server, callback.clone(), &InputId::new("com.loop/.Service"))
            .unwrap();

        let session = callback.created.lock().first().cloned().flatten().unwrap();
        session
            .send(SessionOp::Tune {
                uri: ChannelUri::channel(5),
                params: TuneParams::new(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(provider.journal().sessions_created(), 1);
        assert_eq!(provider.journal().executed(1).len(), 1);
        let events = callback.events.lock().clone();
        assert_eq!(events.last(), Some(&SessionEvent::VideoAvailable));
    }

    #[tokio::test]
    async fn test_failed_creation_reports_none() {
        let provider = provider();
        provider.set_fail_creation(true);
        let callback = Arc::new(CapturingCallback::default());
        let (_client, server) = input_channel_pair("s");
        provider
            .create_session(server, callback.clone(), &InputId::new("x"))
            .unwrap();

        let created = callback.created.lock();
        assert_eq!(created.len(), 1);
        assert!(created.first().map(Option::is_none).unwrap_or(false));
    }

    #[tokio::test]
    async fn test_crash_kills_sessions() {
        let provider = provider();
        let callback = Arc::new(CapturingCallback::default());
        let (_client, server) = input_channel_pair("s");
        provider
            .create_session(server, callback.clone(), &InputId::new("x"))
            .unwrap();
        let session = callback.created.lock().first().cloned().flatten().unwrap();

        provider.crash();
        assert!(!session.peer().is_alive());
        assert!(provider
            .create_session(input_channel_pair("t").1, callback.clone(), &InputId::new("x"))
            .is_err());
    }

    #[tokio::test]
    async fn test_hardware_notifications_report_inputs() {
        let provider = provider();
        let service_callback = Arc::new(CapturingServiceCallback::default());
        provider.register_callback(service_callback.clone()).unwrap();

        let hw = HardwareInfo::new(2, tvim_core::InputType::Hdmi).with_hdmi_port(1);
        provider.notify_hardware_added(&hw).unwrap();
        provider.notify_hardware_removed(&hw).unwrap();

        let added = service_callback.added.lock().clone();
        assert_eq!(added.len(), 1);
        let (device_id, descriptor) = added.first().cloned().unwrap();
        assert_eq!(device_id, 2);
        assert!(descriptor.is_hardware);
        assert_eq!(descriptor.id.as_str(), "com.loop/.Service/HW2");
        assert_eq!(service_callback.removed.lock().clone(), vec![descriptor.id]);
    }
}
