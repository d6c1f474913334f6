//! Callback fan-out.
//!
//! Outbound: every client owns one ordered [`ClientEvent`] channel and
//! every registry callback one [`InputNotification`] channel. Inbound:
//! the proxies below turn provider and hardware-manager callbacks into
//! [`BrokerCommand`]s, so all state changes happen on the actor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use tvim_core::{
    ClientId, ComponentName, HardwareInfo, HdmiDeviceInfo, InputDescriptor, InputId, InputState,
    SessionEvent, SessionToken, UserId,
};
use tvim_provider::{Peer, RemoteSession, ServiceCallback, SessionCallback};

use super::commands::{BrokerCommand, ClientEvent, HardwareEvent, InputNotification};
use crate::hardware::HardwareListener;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Outbound
// ============================================================================

/// A client process as seen by the broker.
///
/// Cheap to clone; all clones feed the same ordered event channel.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    peer: Peer,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientHandle {
    /// Creates a client whose liveness is `peer`.
    pub fn new(peer: Peer) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let id = ClientId::new(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
        (Self { id, peer, events }, rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Returns false once the client stopped listening.
    pub fn send(&self, event: ClientEvent) -> bool {
        let sent = self.events.send(event).is_ok();
        if !sent {
            debug!(client = %self.id, "Client event channel closed");
        }
        sent
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// A registered input-registry callback.
#[derive(Clone)]
pub struct RegistryCallback {
    peer: Peer,
    events: mpsc::UnboundedSender<InputNotification>,
}

impl RegistryCallback {
    pub fn new(peer: Peer) -> (Self, mpsc::UnboundedReceiver<InputNotification>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { peer, events }, rx)
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn notify(&self, notification: InputNotification) {
        if self.events.send(notification).is_err() {
            debug!(peer = %self.peer.id(), "Registry callback channel closed");
        }
    }
}

// ============================================================================
// Inbound proxies
// ============================================================================

type CommandSender = mpsc::UnboundedSender<BrokerCommand>;

fn forward(commands: &CommandSender, command: BrokerCommand) {
    let name = command.name();
    if commands.send(command).is_err() {
        // Broker is shutting down
        trace!(command = name, "Dropped report for stopped broker");
    }
}

/// Session callback handed to a provider for one session token.
pub(crate) struct SessionCallbackProxy {
    pub(crate) user: UserId,
    pub(crate) token: SessionToken,
    pub(crate) commands: CommandSender,
}

impl SessionCallback for SessionCallbackProxy {
    fn on_session_created(
        &self,
        session: Option<Arc<dyn RemoteSession>>,
        hardware_session: Option<SessionToken>,
    ) {
        forward(
            &self.commands,
            BrokerCommand::SessionCreated {
                user: self.user,
                token: self.token,
                session,
                hardware_session,
            },
        );
    }

    fn on_event(&self, event: SessionEvent) {
        forward(
            &self.commands,
            BrokerCommand::SessionEvent {
                user: self.user,
                token: self.token,
                event,
            },
        );
    }
}

/// Service callback registered with hardware providers.
pub(crate) struct ServiceCallbackProxy {
    pub(crate) user: UserId,
    pub(crate) component: ComponentName,
    pub(crate) commands: CommandSender,
}

impl ServiceCallback for ServiceCallbackProxy {
    fn add_hardware_input(&self, device_id: u32, input: InputDescriptor) {
        forward(
            &self.commands,
            BrokerCommand::HardwareInputAdded {
                user: self.user,
                component: self.component.clone(),
                device_id,
                input,
            },
        );
    }

    fn add_hdmi_input(&self, hdmi_device_id: u32, input: InputDescriptor) {
        forward(
            &self.commands,
            BrokerCommand::HdmiInputAdded {
                user: self.user,
                component: self.component.clone(),
                hdmi_device_id,
                input,
            },
        );
    }

    fn remove_input(&self, input_id: InputId) {
        forward(
            &self.commands,
            BrokerCommand::ProviderInputRemoved {
                user: self.user,
                component: self.component.clone(),
                input_id,
            },
        );
    }
}

/// Listener installed on the hardware manager.
pub(crate) struct HardwareListenerProxy {
    pub(crate) commands: CommandSender,
}

impl HardwareListenerProxy {
    fn report(&self, event: HardwareEvent) {
        forward(&self.commands, BrokerCommand::Hardware(event));
    }
}

impl HardwareListener for HardwareListenerProxy {
    fn on_state_changed(&self, input_id: &InputId, state: InputState) {
        self.report(HardwareEvent::StateChanged {
            input_id: input_id.clone(),
            state,
        });
    }

    fn on_hardware_device_added(&self, hardware: &HardwareInfo) {
        self.report(HardwareEvent::DeviceAdded(hardware.clone()));
    }

    fn on_hardware_device_removed(&self, hardware: &HardwareInfo) {
        self.report(HardwareEvent::DeviceRemoved(hardware.clone()));
    }

    fn on_hdmi_device_added(&self, device: &HdmiDeviceInfo) {
        self.report(HardwareEvent::HdmiDeviceAdded(device.clone()));
    }

    fn on_hdmi_device_removed(&self, device: &HdmiDeviceInfo) {
        self.report(HardwareEvent::HdmiDeviceRemoved(device.clone()));
    }

    fn on_hdmi_device_updated(&self, input_id: &InputId, device: &HdmiDeviceInfo) {
        self.report(HardwareEvent::HdmiDeviceUpdated {
            input_id: input_id.clone(),
            device: device.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids_are_unique() {
        let (a, _rx_a) = ClientHandle::new(Peer::new("a"));
        let (b, _rx_b) = ClientHandle::new(Peer::new("b"));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_client_send_after_receiver_dropped() {
        let (client, rx) = ClientHandle::new(Peer::new("c"));
        drop(rx);
        assert!(!client.send(ClientEvent::SessionReleased {
            token: SessionToken::new(1),
            seq: 0,
        }));
    }

    #[tokio::test]
    async fn test_session_proxy_forwards_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let proxy = SessionCallbackProxy {
            user: UserId::SYSTEM,
            token: SessionToken::new(3),
            commands: tx,
        };
        proxy.on_event(SessionEvent::VideoAvailable);

        match rx.recv().await {
            Some(BrokerCommand::SessionEvent { token, event, .. }) => {
                assert_eq!(token, SessionToken::new(3));
                assert_eq!(event, SessionEvent::VideoAvailable);
            }
            _ => panic!("expected a session event"),
        }
    }
}
