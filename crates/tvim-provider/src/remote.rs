//! The contract between the broker and a provider.
//!
//! Every call is one-way: it either enqueues work on the remote side or
//! fails immediately with a [`RemoteError`]. Results come back through
//! the callback traits.

use std::sync::Arc;

use tvim_core::{HardwareInfo, HdmiDeviceInfo, InputDescriptor, InputId, SessionEvent, SessionToken};

use crate::error::RemoteError;
use crate::input::InputChannelServer;
use crate::op::SessionOp;
use crate::peer::Peer;

/// A live session inside a provider.
pub trait RemoteSession: Send + Sync {
    /// Liveness of the session object.
    fn peer(&self) -> &Peer;

    /// Enqueues an operation.
    fn send(&self, op: SessionOp) -> Result<(), RemoteError>;
}

/// A bound provider service.
pub trait ProviderService: Send + Sync {
    /// Liveness of the provider process.
    fn peer(&self) -> &Peer;

    /// Hardware providers report their inputs through this callback.
    fn register_callback(&self, callback: Arc<dyn ServiceCallback>) -> Result<(), RemoteError>;

    fn unregister_callback(&self) -> Result<(), RemoteError>;

    /// Asks the provider to create a session for `input_id`.
    ///
    /// The outcome arrives exactly once through
    /// [`SessionCallback::on_session_created`].
    fn create_session(
        &self,
        channel: InputChannelServer,
        callback: Arc<dyn SessionCallback>,
        input_id: &InputId,
    ) -> Result<(), RemoteError>;

    fn notify_hardware_added(&self, hardware: &HardwareInfo) -> Result<(), RemoteError>;

    fn notify_hardware_removed(&self, hardware: &HardwareInfo) -> Result<(), RemoteError>;

    fn notify_hdmi_device_added(&self, device: &HdmiDeviceInfo) -> Result<(), RemoteError>;

    fn notify_hdmi_device_removed(&self, device: &HdmiDeviceInfo) -> Result<(), RemoteError>;
}

/// Provider → broker, scoped to one session.
pub trait SessionCallback: Send + Sync {
    /// Creation finished. `None` means the provider failed to create it.
    ///
    /// `hardware_session` is set when the new session wraps a hardware
    /// pass-through session the provider opened itself.
    fn on_session_created(
        &self,
        session: Option<Arc<dyn RemoteSession>>,
        hardware_session: Option<SessionToken>,
    );

    fn on_event(&self, event: SessionEvent);
}

/// Provider → broker, for hardware providers.
pub trait ServiceCallback: Send + Sync {
    fn add_hardware_input(&self, device_id: u32, input: InputDescriptor);

    fn add_hdmi_input(&self, hdmi_device_id: u32, input: InputDescriptor);

    fn remove_input(&self, input_id: InputId);
}
