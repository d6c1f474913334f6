//! Provider connection state machine.
//!
//! One [`ServiceState`](super::state::ServiceState) per (user, component):
//!
//! ```text
//! UNBOUND --bind--> BINDING --connected--> BOUND
//!    ^                 |                     |
//!    |            bind failed            peer died
//!    |                 v                     v
//!    +------------- (null results)     RECONNECTING --sessions drained--> UNBOUND
//! ```
//!
//! A provider stays bound while it has sessions, or while it is a
//! hardware provider of the active user.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tvim_core::{ComponentName, InputId, InputState, SessionToken, UserId};
use tvim_provider::{input_channel_pair, watch, PeerId, ProviderService};

use super::actor::BrokerActor;
use super::commands::BrokerCommand;
use super::fanout::{ServiceCallbackProxy, SessionCallbackProxy};

// ============================================================================
// Connector seam
// ============================================================================

/// Starts and stops provider processes.
pub trait ProviderConnector: Send + Sync {
    /// Starts binding `component` for `user`.
    ///
    /// Returns whether binding started. The outcome arrives later through
    /// `reporter`.
    fn bind(&self, component: &ComponentName, user: UserId, reporter: ConnectionReporter) -> bool;

    fn unbind(&self, component: &ComponentName, user: UserId);
}

/// Reports the outcome of one bind back to the broker.
#[derive(Clone)]
pub struct ConnectionReporter {
    user: UserId,
    component: ComponentName,
    commands: mpsc::UnboundedSender<BrokerCommand>,
}

impl ConnectionReporter {
    pub(crate) fn new(
        user: UserId,
        component: ComponentName,
        commands: mpsc::UnboundedSender<BrokerCommand>,
    ) -> Self {
        Self {
            user,
            component,
            commands,
        }
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn component(&self) -> &ComponentName {
        &self.component
    }

    pub fn connected(&self, service: Arc<dyn ProviderService>) {
        self.report(BrokerCommand::ServiceConnected {
            user: self.user,
            component: self.component.clone(),
            service,
        });
    }

    pub fn disconnected(&self) {
        self.report(BrokerCommand::ServiceDisconnected {
            user: self.user,
            component: self.component.clone(),
        });
    }

    fn report(&self, command: BrokerCommand) {
        if self.commands.send(command).is_err() {
            debug!(component = %self.component, "Broker stopped, connection report dropped");
        }
    }
}

// ============================================================================
// Connection handling
// ============================================================================

impl BrokerActor {
    /// Binds or unbinds a provider to match its current need.
    pub(super) fn update_service_connection(&mut self, user: UserId, component: &ComponentName) {
        let is_current = user == self.current_user;
        let Some(service) = self
            .users
            .get_mut(&user)
            .and_then(|s| s.services.get_mut(component))
        else {
            return;
        };

        if service.reconnecting {
            if !service.session_tokens.is_empty() {
                // Wait until the dead sessions are drained
                return;
            }
            service.reconnecting = false;
        }

        let has_sessions = !service.session_tokens.is_empty();
        let maintain = if is_current {
            has_sessions || service.is_hardware
        } else {
            // Background users keep providers only for their sessions
            has_sessions
        };

        if service.service.is_none() && maintain {
            if service.bound {
                return;
            }
            let Some(commands) = self.commands.upgrade() else {
                return;
            };
            let reporter = ConnectionReporter::new(user, component.clone(), commands);
            let bound = self.connector.bind(component, user, reporter);
            service.bound = bound;
            if bound {
                info!(component = %component, user = %user, "Binding provider");
            } else {
                error!(component = %component, user = %user, "Failed to bind provider");
                self.abort_pending_inner(user, component, None);
            }
        } else if service.service.is_some() && !maintain {
            info!(component = %component, user = %user, "Unbinding idle provider");
            self.connector.unbind(component, user);
            if let Some(state) = self.users.get_mut(&user) {
                state.services.remove(component);
            }
        }
    }

    pub(super) fn handle_service_connected(
        &mut self,
        user: UserId,
        component: ComponentName,
        service: Arc<dyn ProviderService>,
    ) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let Some(state) = self
            .users
            .get_mut(&user)
            .and_then(|s| s.services.get_mut(&component))
        else {
            info!(component = %component, user = %user, "Connected to a provider no longer needed");
            self.connector.unbind(&component, user);
            return;
        };

        let peer = service.peer().id();
        let died = commands.clone();
        let died_component = component.clone();
        let death_watch = watch(service.peer(), move || {
            let _ = died.send(BrokerCommand::ServiceDied {
                user,
                component: died_component,
                peer,
            });
        });
        let Ok(death_watch) = death_watch else {
            warn!(component = %component, "Provider died before its connection was handled");
            state.bound = false;
            self.handle_lost_connection(user, &component);
            return;
        };

        info!(component = %component, user = %user, peer = %peer, "Provider connected");
        state.service = Some(service.clone());
        state.bound = true;
        state.death_watch = Some(death_watch);

        if state.is_hardware && !state.callback_registered {
            let callback = Arc::new(ServiceCallbackProxy {
                user,
                component: component.clone(),
                commands,
            });
            match service.register_callback(callback) {
                Ok(()) => state.callback_registered = true,
                Err(e) => error!(component = %component, error = %e, "Error in register_callback"),
            }
        }
        let is_hardware = state.is_hardware;
        if is_hardware {
            // The provider re-reports its inputs for the devices below
            state.hardware_inputs.clear();
        }
        let pending = state.session_tokens.clone();

        // Sessions requested while binding
        for token in pending {
            let waiting = self
                .users
                .get(&user)
                .and_then(|s| s.sessions.get(&token))
                .is_some_and(|s| s.session.is_none());
            if waiting {
                self.create_session_internal(user, token, service.clone());
            }
        }

        // Re-announce states the broker stored while the provider was away
        let not_connected: Vec<(InputId, InputState)> = self
            .users
            .get(&user)
            .map(|s| {
                s.inputs
                    .values()
                    .filter(|r| r.descriptor.component == component)
                    .filter(|r| r.state != InputState::Connected)
                    .map(|r| (r.descriptor.id.clone(), r.state))
                    .collect()
            })
            .unwrap_or_default();
        for (input_id, state) in not_connected {
            self.notify_input_state_changed(user, &input_id, state);
        }

        if is_hardware {
            for hardware in self.hardware.hardware_list() {
                if let Err(e) = service.notify_hardware_added(&hardware) {
                    error!(component = %component, error = %e, "Error in notify_hardware_added");
                }
            }
            for device in self.hardware.hdmi_device_list() {
                if let Err(e) = service.notify_hdmi_device_added(&device) {
                    error!(component = %component, error = %e, "Error in notify_hdmi_device_added");
                }
            }
        }

        self.update_service_connection(user, &component);
    }

    /// Handles a provider going away.
    ///
    /// `peer` filters out reports about a provider instance that was
    /// already replaced.
    pub(super) fn handle_service_lost(
        &mut self,
        user: UserId,
        component: &ComponentName,
        peer: Option<PeerId>,
    ) {
        let Some(state) = self
            .users
            .get_mut(&user)
            .and_then(|s| s.services.get_mut(component))
        else {
            return;
        };
        if let Some(peer) = peer {
            if state.service_peer() != Some(peer) {
                debug!(component = %component, peer = %peer, "Stale provider death ignored");
                return;
            }
        }
        if state.service.is_none() && !state.bound {
            return;
        }
        self.handle_lost_connection(user, component);
    }

    fn handle_lost_connection(&mut self, user: UserId, component: &ComponentName) {
        let Some(user_state) = self.users.get_mut(&user) else {
            return;
        };
        let Some(state) = user_state.services.get_mut(component) else {
            return;
        };
        warn!(component = %component, user = %user, sessions = state.session_tokens.len(), "Provider disconnected");

        state.reconnecting = true;
        state.bound = false;
        state.service = None;
        state.callback_registered = false;
        state.death_watch = None;

        // Sessions that died with the provider
        let dead: Vec<SessionToken> = state
            .session_tokens
            .iter()
            .filter(|token| {
                user_state
                    .sessions
                    .get(token)
                    .and_then(|s| s.session.as_ref())
                    .is_some_and(|s| !s.peer().is_alive())
            })
            .copied()
            .collect();

        self.abort_pending_create_session_requests(user, component, None);
        for token in dead {
            self.clear_session_and_notify_client(user, token);
        }
        // Input states are kept; changes meanwhile replay on reconnection
    }

    /// Asks a connected provider to create the session for `token`.
    pub(super) fn create_session_internal(
        &mut self,
        user: UserId,
        token: SessionToken,
        service: Arc<dyn ProviderService>,
    ) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let Some(session) = self
            .users
            .get_mut(&user)
            .and_then(|s| s.sessions.get_mut(&token))
        else {
            return;
        };

        let (client_end, server_end) = input_channel_pair(token.to_string());
        session.pending_channel = Some(client_end);
        let input_id = session.input.id.clone();
        let callback = Arc::new(SessionCallbackProxy {
            user,
            token,
            commands,
        });

        debug!(token = %token, input_id = %input_id, "Creating session on provider");
        if let Err(e) = service.create_session(server_end, callback, &input_id) {
            error!(token = %token, error = %e, "Error in create_session");
            self.fail_creation(user, token);
        }
    }

    /// Answers every not-yet-created session of `component` (optionally
    /// only for `input`) with a null result, then re-evaluates the
    /// connection.
    pub(super) fn abort_pending_create_session_requests(
        &mut self,
        user: UserId,
        component: &ComponentName,
        input: Option<&InputId>,
    ) {
        self.abort_pending_inner(user, component, input);
        self.update_service_connection(user, component);
    }

    fn abort_pending_inner(
        &mut self,
        user: UserId,
        component: &ComponentName,
        input: Option<&InputId>,
    ) {
        let Some(state) = self.users.get(&user) else {
            return;
        };
        let Some(service) = state.services.get(component) else {
            return;
        };
        let pending: Vec<SessionToken> = service
            .session_tokens
            .iter()
            .filter(|token| {
                state.sessions.get(token).is_some_and(|s| {
                    s.session.is_none() && input.map_or(true, |id| &s.input.id == id)
                })
            })
            .copied()
            .collect();
        if !pending.is_empty() {
            debug!(component = %component, count = pending.len(), "Aborting pending session requests");
        }
        for token in pending {
            self.fail_creation(user, token);
        }
    }
}
