//! Broker actor - owns all broker state and processes commands.
//!
//! The BrokerActor is the single owner of users, inputs, provider
//! connections, sessions, clients and callbacks. Commands are handled one
//! at a time, to completion; remote calls are one-way and never awaited.
//!
//! Input-registry handlers live in `inputs.rs` and the connection state
//! machine in `connection.rs`; both extend this type.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Remote call failures are logged and treated as a no-op for that call
//! - Channel send failures are logged but don't panic

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tvim_core::{
    CallerIdentity, ClientId, ContentRating, HardwareInfo, InputId, Permission, SessionToken,
    StreamConfig, SurfaceHandle, Uid, UserId,
};
use tvim_provider::{watch, RemoteSession, SessionOp};

use super::commands::{BrokerCommand, BrokerError, ClientEvent};
use super::connection::ProviderConnector;
use super::fanout::{ClientHandle, RegistryCallback};
use super::state::{
    BrokerSnapshot, CallbackState, ClientState, ServiceState, SessionState, UserState,
};
use crate::directory::Directory;
use crate::hardware::{HardwareCallback, HardwareLease, HardwareManager};
use crate::settings::SettingsStore;
use crate::watch_log::{WatchLogHandle, WatchRecord};

/// Collaborators the broker is built from.
pub struct BrokerDeps {
    pub directory: Arc<dyn Directory>,
    pub connector: Arc<dyn ProviderConnector>,
    pub hardware: Arc<dyn HardwareManager>,
    pub settings: Arc<dyn SettingsStore>,
    pub watch_log: WatchLogHandle,
    /// The active user at startup.
    pub current_user: UserId,
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Broker Actor
// ============================================================================

/// The broker actor - owns all broker state.
///
/// # Ownership
///
/// - `users`: every piece of state, keyed by user first
/// - `next_token`: session tokens are minted from this counter and never reused
///
/// The actor keeps only a weak reference to its own command channel.
pub struct BrokerActor {
    receiver: mpsc::UnboundedReceiver<BrokerCommand>,
    pub(super) commands: mpsc::WeakUnboundedSender<BrokerCommand>,
    pub(super) users: HashMap<UserId, UserState>,
    pub(super) current_user: UserId,
    next_token: u64,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) connector: Arc<dyn ProviderConnector>,
    pub(super) hardware: Arc<dyn HardwareManager>,
    pub(super) settings: Arc<dyn SettingsStore>,
    pub(super) watch_log: WatchLogHandle,
}

impl BrokerActor {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<BrokerCommand>,
        commands: mpsc::WeakUnboundedSender<BrokerCommand>,
        deps: BrokerDeps,
    ) -> Self {
        Self {
            receiver,
            commands,
            users: HashMap::new(),
            current_user: deps.current_user,
            next_token: 0,
            directory: deps.directory,
            connector: deps.connector,
            hardware: deps.hardware,
            settings: deps.settings,
            watch_log: deps.watch_log,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Builds the active user's input list, then processes commands until
    /// the channel closes.
    pub async fn run(mut self) {
        info!(user = %self.current_user, "Broker actor starting");
        self.rebuild_input_list(self.current_user, None);

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            users = self.users.len(),
            sessions = self.users.values().map(|u| u.sessions.len()).sum::<usize>(),
            "Broker actor stopped"
        );
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: BrokerCommand) {
        debug!(command = cmd.name(), "Broker command");
        match cmd {
            BrokerCommand::GetInputList {
                caller,
                user,
                respond_to,
            } => {
                let result = self.handle_get_input_list(&caller, user);
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            BrokerCommand::GetInputInfo {
                caller,
                user,
                input_id,
                respond_to,
            } => {
                let result = self.handle_get_input_info(&caller, user, &input_id);
                let _ = respond_to.send(result);
            }
            BrokerCommand::GetInputState {
                caller,
                user,
                input_id,
                respond_to,
            } => {
                let result = self.handle_get_input_state(&caller, user, &input_id);
                let _ = respond_to.send(result);
            }
            BrokerCommand::RegisterCallback {
                caller,
                user,
                callback,
                respond_to,
            } => {
                let result = self.handle_register_callback(&caller, user, callback);
                let _ = respond_to.send(result);
            }
            BrokerCommand::UnregisterCallback {
                caller,
                user,
                callback,
                respond_to,
            } => {
                let result = self.resolve_calling_user(&caller, user).map(|user| {
                    if let Some(state) = self.users.get_mut(&user) {
                        state.callbacks.remove(&callback);
                    }
                });
                let _ = respond_to.send(result);
            }
            BrokerCommand::RebuildInputs {
                user,
                changed_packages,
                respond_to,
            } => {
                let user = if user.is_current_sentinel() {
                    self.current_user
                } else {
                    user
                };
                self.rebuild_input_list(user, Some(&changed_packages));
                let _ = respond_to.send(());
            }
            BrokerCommand::IsParentalControlsEnabled {
                caller,
                user,
                respond_to,
            } => {
                let result = self
                    .resolve_calling_user(&caller, user)
                    .map(|user| self.settings.is_parental_controls_enabled(user));
                let _ = respond_to.send(result);
            }
            BrokerCommand::SetParentalControlsEnabled {
                caller,
                user,
                enabled,
                respond_to,
            } => {
                let result = self.with_parental_permission(&caller, user, |settings, user| {
                    settings.set_parental_controls_enabled(user, enabled)
                });
                let _ = respond_to.send(result);
            }
            BrokerCommand::IsRatingBlocked {
                caller,
                user,
                rating,
                respond_to,
            } => {
                let result = self
                    .resolve_calling_user(&caller, user)
                    .map(|user| self.settings.is_rating_blocked(user, &rating));
                let _ = respond_to.send(result);
            }
            BrokerCommand::GetBlockedRatings {
                caller,
                user,
                respond_to,
            } => {
                let result = self
                    .resolve_calling_user(&caller, user)
                    .map(|user| self.settings.blocked_ratings(user));
                let _ = respond_to.send(result);
            }
            BrokerCommand::AddBlockedRating {
                caller,
                user,
                rating,
                respond_to,
            } => {
                let result = self.with_parental_permission(&caller, user, |settings, user| {
                    settings.add_blocked_rating(user, rating)
                });
                let _ = respond_to.send(result);
            }
            BrokerCommand::RemoveBlockedRating {
                caller,
                user,
                rating,
                respond_to,
            } => {
                let result = self.handle_remove_blocked_rating(&caller, user, &rating);
                let _ = respond_to.send(result);
            }
            BrokerCommand::CreateSession {
                caller,
                user,
                client,
                input_id,
                seq,
                respond_to,
            } => {
                let result = self.handle_create_session(&caller, user, client, input_id, seq);
                let _ = respond_to.send(result);
            }
            BrokerCommand::ReleaseSession {
                caller,
                user,
                token,
                respond_to,
            } => {
                let result = self
                    .resolve_calling_user(&caller, user)
                    .and_then(|user| self.release_session_locked(user, token, caller.uid));
                let _ = respond_to.send(result);
            }
            BrokerCommand::SetMainSession {
                caller,
                user,
                token,
                respond_to,
            } => {
                let result = self.handle_set_main_session(&caller, user, token);
                let _ = respond_to.send(result);
            }
            BrokerCommand::Session {
                caller,
                user,
                token,
                op,
                respond_to,
            } => {
                let result = self.handle_session_op(&caller, user, token, op);
                if let Err(e) = &result {
                    debug!(token = %token, error = %e, "Session operation failed");
                }
                let _ = respond_to.send(result);
            }
            BrokerCommand::IsSingleSessionActive {
                caller,
                user,
                respond_to,
            } => {
                let result = self
                    .resolve_calling_user(&caller, user)
                    .map(|user| self.is_single_session_active(user));
                let _ = respond_to.send(result);
            }
            BrokerCommand::GetHardwareList { caller, respond_to } => {
                let result = self.handle_get_hardware_list(&caller);
                let _ = respond_to.send(result);
            }
            BrokerCommand::AcquireHardware {
                caller,
                user,
                device_id,
                input,
                callback,
                respond_to,
            } => {
                let result =
                    self.handle_acquire_hardware(&caller, user, device_id, &input, callback);
                let _ = respond_to.send(result);
            }
            BrokerCommand::ReleaseHardware {
                caller,
                user,
                lease,
                respond_to,
            } => {
                let result = self.handle_release_hardware(&caller, user, lease);
                let _ = respond_to.send(result);
            }
            BrokerCommand::GetAvailableStreamConfigs {
                caller,
                user,
                input_id,
                respond_to,
            } => {
                let result = self.handle_get_available_stream_configs(&caller, user, &input_id);
                let _ = respond_to.send(result);
            }
            BrokerCommand::CaptureFrame {
                caller,
                user,
                input_id,
                surface,
                config,
                respond_to,
            } => {
                let result = self.handle_capture_frame(&caller, user, &input_id, surface, &config);
                let _ = respond_to.send(result);
            }
            BrokerCommand::SwitchUser { user, respond_to } => {
                self.handle_switch_user(user);
                let _ = respond_to.send(());
            }
            BrokerCommand::RemoveUser { user, respond_to } => {
                self.handle_remove_user(user);
                let _ = respond_to.send(());
            }
            BrokerCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            BrokerCommand::ServiceConnected {
                user,
                component,
                service,
            } => {
                self.handle_service_connected(user, component, service);
            }
            BrokerCommand::ServiceDisconnected { user, component } => {
                self.handle_service_lost(user, &component, None);
            }
            BrokerCommand::ServiceDied {
                user,
                component,
                peer,
            } => {
                self.handle_service_lost(user, &component, Some(peer));
            }
            BrokerCommand::SessionCreated {
                user,
                token,
                session,
                hardware_session,
            } => {
                self.handle_session_created(user, token, session, hardware_session);
            }
            BrokerCommand::SessionEvent { user, token, event } => {
                let Some(session) = self.users.get(&user).and_then(|s| s.sessions.get(&token))
                else {
                    debug!(token = %token, event = event.name(), "Event for unknown session dropped");
                    return;
                };
                if session.session.is_none() {
                    debug!(token = %token, event = event.name(), "Event for dead session dropped");
                    return;
                }
                session.client.send(ClientEvent::Session {
                    token,
                    seq: session.seq,
                    event,
                });
            }
            BrokerCommand::SessionDied { user, token, peer } => {
                let current_peer = self
                    .users
                    .get(&user)
                    .and_then(|s| s.sessions.get(&token))
                    .and_then(|s| s.session.as_ref())
                    .map(|s| s.peer().id());
                if current_peer == Some(peer) {
                    info!(token = %token, user = %user, "Session died");
                    self.clear_session_and_notify_client(user, token);
                }
            }
            BrokerCommand::ClientDied { user, client } => {
                self.handle_client_died(user, client);
            }
            BrokerCommand::CallbackDied { user, callback } => {
                if let Some(state) = self.users.get_mut(&user) {
                    if state.callbacks.remove(&callback).is_some() {
                        debug!(user = %user, callback = %callback, "Registry callback died");
                    }
                }
            }
            BrokerCommand::HardwareInputAdded {
                user,
                component,
                device_id,
                input,
            } => {
                self.handle_hardware_input_added(user, &component, Some(device_id), None, input);
            }
            BrokerCommand::HdmiInputAdded {
                user,
                component,
                hdmi_device_id,
                input,
            } => {
                self.handle_hardware_input_added(
                    user,
                    &component,
                    None,
                    Some(hdmi_device_id),
                    input,
                );
            }
            BrokerCommand::ProviderInputRemoved {
                user,
                component,
                input_id,
            } => {
                self.handle_provider_input_removed(user, &component, &input_id);
            }
            BrokerCommand::Hardware(event) => {
                self.handle_hardware_event(event);
            }
        }
    }

    // ========================================================================
    // Identity & lookup
    // ========================================================================

    /// Resolves the user a call targets.
    ///
    /// `UserId::CURRENT` means the active user. Only the system uid may
    /// act on a user other than its own.
    pub(super) fn resolve_calling_user(
        &self,
        caller: &CallerIdentity,
        requested: UserId,
    ) -> Result<UserId, BrokerError> {
        let resolved = if requested.is_current_sentinel() {
            self.current_user
        } else {
            requested
        };
        if resolved == caller.user_id || caller.is_system() {
            Ok(resolved)
        } else {
            warn!(
                uid = %caller.uid,
                caller_user = %caller.user_id,
                requested = %resolved,
                "Cross-user call rejected"
            );
            Err(BrokerError::permission(format!(
                "uid {} cannot act on user {}",
                caller.uid, resolved
            )))
        }
    }

    pub(super) fn user_state_mut(&mut self, user: UserId) -> &mut UserState {
        self.users
            .entry(user)
            .or_insert_with(|| UserState::new(user))
    }

    /// Looks up a session owned by `uid` (or any session, for the system uid).
    fn session_state(
        &self,
        user: UserId,
        token: SessionToken,
        uid: Uid,
    ) -> Result<&SessionState, BrokerError> {
        let session = self
            .users
            .get(&user)
            .and_then(|s| s.sessions.get(&token))
            .ok_or(BrokerError::SessionNotFound(token))?;
        if !uid.is_system() && uid != session.calling_uid {
            return Err(BrokerError::permission(format!(
                "uid {uid} does not own {token}"
            )));
        }
        Ok(session)
    }

    /// The live remote handle of a session.
    fn live_session(
        &self,
        user: UserId,
        token: SessionToken,
        uid: Uid,
    ) -> Result<Arc<dyn RemoteSession>, BrokerError> {
        self.session_state(user, token, uid)?
            .session
            .clone()
            .ok_or(BrokerError::SessionNotFound(token))
    }

    fn mint_token(&mut self) -> SessionToken {
        self.next_token += 1;
        SessionToken::new(self.next_token)
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    fn handle_create_session(
        &mut self,
        caller: &CallerIdentity,
        user: UserId,
        client: ClientHandle,
        input_id: InputId,
        seq: u64,
    ) -> Result<Option<SessionToken>, BrokerError> {
        let user = self.resolve_calling_user(caller, user)?;
        let null_result = |client: &ClientHandle, input_id: InputId| {
            client.send(ClientEvent::SessionCreated {
                input_id,
                token: None,
                channel: None,
                seq,
            });
            Ok(None)
        };

        let state = self.user_state_mut(user);
        let Some(input) = state.inputs.get(&input_id).map(|r| r.descriptor.clone()) else {
            warn!(input_id = %input_id, user = %user, "Failed to find input state");
            return null_result(&client, input_id);
        };
        let component = input.component.clone();
        let is_hardware = state.hardware_components.contains(&component);
        let service = state
            .services
            .entry(component.clone())
            .or_insert_with(|| ServiceState::new(component.clone(), is_hardware));

        if service.reconnecting {
            debug!(input_id = %input_id, "Provider reconnecting, refusing session");
            return null_result(&client, input_id);
        }
        if !self.ensure_client(user, &client) {
            debug!(client = %client.id(), "Client died before session creation");
            return null_result(&client, input_id);
        }

        let token = self.mint_token();
        let state = self.user_state_mut(user);
        state.sessions.insert(
            token,
            SessionState {
                token,
                client: client.clone(),
                seq,
                calling_uid: caller.uid,
                user,
                input,
                session: None,
                hardware_session: None,
                pending_channel: None,
                death_watch: None,
            },
        );
        if let Some(client_state) = state.clients.get_mut(&client.id()) {
            client_state.tokens.push(token);
        }
        let live_service = state.services.get_mut(&component).and_then(|service| {
            service.session_tokens.push(token);
            service.service.clone()
        });

        info!(
            token = %token,
            input_id = %input_id,
            user = %user,
            uid = %caller.uid,
            seq,
            "Session requested"
        );

        match live_service {
            Some(service) => self.create_session_internal(user, token, service),
            None => self.update_service_connection(user, &component),
        }

        // Creation may have failed synchronously
        let exists = self
            .users
            .get(&user)
            .is_some_and(|s| s.sessions.contains_key(&token));
        Ok(exists.then_some(token))
    }

    /// Registers `client` with the user, watching its peer. False if it is dead.
    fn ensure_client(&mut self, user: UserId, client: &ClientHandle) -> bool {
        if self
            .users
            .get(&user)
            .is_some_and(|s| s.clients.contains_key(&client.id()))
        {
            return true;
        }
        let Some(commands) = self.commands.upgrade() else {
            return false;
        };
        let client_id = client.id();
        let death_watch = watch(client.peer(), move || {
            let _ = commands.send(BrokerCommand::ClientDied {
                user,
                client: client_id,
            });
        });
        let Ok(death_watch) = death_watch else {
            return false;
        };
        self.user_state_mut(user).clients.insert(
            client_id,
            ClientState {
                tokens: Vec::new(),
                _death_watch: Some(death_watch),
            },
        );
        true
    }

    fn handle_session_created(
        &mut self,
        user: UserId,
        token: SessionToken,
        session: Option<Arc<dyn RemoteSession>>,
        hardware_session: Option<SessionToken>,
    ) {
        let Some(component) = self
            .users
            .get(&user)
            .and_then(|s| s.sessions.get(&token))
            .map(|s| s.input.component.clone())
        else {
            // Released or aborted while the provider was creating it
            if let Some(session) = session {
                debug!(token = %token, "Releasing orphaned session");
                if let Err(e) = session.send(SessionOp::Release) {
                    debug!(token = %token, error = %e, "Orphan already gone");
                }
            }
            return;
        };

        let Some(session) = session else {
            warn!(token = %token, component = %component, "Provider failed to create session");
            self.fail_creation(user, token);
            self.update_service_connection(user, &component);
            return;
        };

        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let peer = session.peer().id();
        let death_watch = watch(session.peer(), move || {
            let _ = commands.send(BrokerCommand::SessionDied { user, token, peer });
        });
        let Ok(death_watch) = death_watch else {
            warn!(token = %token, "Session died before creation was reported");
            self.fail_creation(user, token);
            self.update_service_connection(user, &component);
            return;
        };

        let Some(state) = self
            .users
            .get_mut(&user)
            .and_then(|s| s.sessions.get_mut(&token))
        else {
            return;
        };
        state.session = Some(session);
        state.hardware_session = hardware_session;
        state.death_watch = Some(death_watch);
        let channel = state.pending_channel.take();
        info!(token = %token, input_id = %state.input.id, hardware_session = ?hardware_session, "Session created");
        state.client.send(ClientEvent::SessionCreated {
            input_id: state.input.id.clone(),
            token: Some(token),
            channel,
            seq: state.seq,
        });
    }

    /// Removes a session that never became live and reports a null result.
    ///
    /// Does not re-evaluate the provider connection.
    pub(super) fn fail_creation(&mut self, user: UserId, token: SessionToken) {
        if let Some(session) = self.remove_session_state(user, token) {
            session.client.send(ClientEvent::SessionCreated {
                input_id: session.input.id.clone(),
                token: None,
                channel: None,
                seq: session.seq,
            });
        }
    }

    /// Drops a session from every index and logs the end of its watch.
    ///
    /// Does not re-evaluate the provider connection.
    pub(super) fn remove_session_state(
        &mut self,
        user: UserId,
        token: SessionToken,
    ) -> Option<SessionState> {
        let state = self.users.get_mut(&user)?;
        let session = state.sessions.remove(&token)?;

        let client_id = session.client.id();
        if let Some(client) = state.clients.get_mut(&client_id) {
            client.tokens.retain(|t| *t != token);
            if client.tokens.is_empty() {
                state.clients.remove(&client_id);
            }
        }
        if let Some(service) = state.services.get_mut(&session.input.component) {
            service.session_tokens.retain(|t| *t != token);
        }
        if state.main_session == Some(token) {
            state.main_session = None;
        }

        self.watch_log.log_end(WatchRecord::end(token, now_ms()));
        debug!(token = %token, user = %user, "Session state removed");
        Some(session)
    }

    /// Releases a session on behalf of `uid`.
    ///
    /// Unknown tokens are a no-op; a token owned by another uid is
    /// rejected without touching any state.
    pub(super) fn release_session_locked(
        &mut self,
        user: UserId,
        token: SessionToken,
        uid: Uid,
    ) -> Result<(), BrokerError> {
        let (component, session) = match self.session_state(user, token, uid) {
            Ok(state) => (state.input.component.clone(), state.session.clone()),
            Err(BrokerError::SessionNotFound(_)) => {
                debug!(token = %token, "Release of unknown session ignored");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(session) = session {
            let is_main = self
                .users
                .get(&user)
                .is_some_and(|s| s.main_session == Some(token));
            if is_main {
                self.set_main_locked(user, token, false, uid);
                if let Some(state) = self.users.get_mut(&user) {
                    state.main_session = None;
                }
            }
            if let Err(e) = session.send(SessionOp::Release) {
                error!(token = %token, error = %e, "Error in release");
            }
        }

        self.remove_session_state(user, token);
        self.update_service_connection(user, &component);
        info!(token = %token, user = %user, "Session released");
        Ok(())
    }

    /// Tears down a session whose live handle died, and every session
    /// wrapping it.
    pub(super) fn clear_session_and_notify_client(&mut self, user: UserId, token: SessionToken) {
        let Some(state) = self.users.get_mut(&user) else {
            return;
        };
        let Some(session) = state.sessions.get_mut(&token) else {
            return;
        };
        session.session = None;
        session.death_watch = None;
        session.client.send(ClientEvent::SessionReleased {
            token,
            seq: session.seq,
        });
        let component = session.input.component.clone();

        let dependents: Vec<(SessionToken, ClientHandle, u64)> = state
            .sessions
            .values()
            .filter(|s| s.hardware_session == Some(token))
            .map(|s| (s.token, s.client.clone(), s.seq))
            .collect();
        for (dependent, client, seq) in dependents {
            if let Err(e) = self.release_session_locked(user, dependent, Uid::SYSTEM) {
                error!(token = %dependent, error = %e, "Failed to release wrapping session");
            }
            client.send(ClientEvent::SessionReleased {
                token: dependent,
                seq,
            });
        }

        self.remove_session_state(user, token);
        self.update_service_connection(user, &component);
    }

    fn handle_client_died(&mut self, user: UserId, client: ClientId) {
        let Some(tokens) = self
            .users
            .get(&user)
            .and_then(|s| s.clients.get(&client))
            .map(|c| c.tokens.clone())
        else {
            return;
        };
        info!(client = %client, user = %user, sessions = tokens.len(), "Client died, releasing sessions");
        for token in tokens {
            if let Err(e) = self.release_session_locked(user, token, Uid::SYSTEM) {
                error!(token = %token, error = %e, "Failed to release session of dead client");
            }
        }
        if let Some(state) = self.users.get_mut(&user) {
            state.clients.remove(&client);
        }
    }

    // ========================================================================
    // Main session
    // ========================================================================

    fn handle_set_main_session(
        &mut self,
        caller: &CallerIdentity,
        user: UserId,
        token: Option<SessionToken>,
    ) -> Result<(), BrokerError> {
        let user = self.resolve_calling_user(caller, user)?;
        if let Some(token) = token {
            self.session_state(user, token, caller.uid)?;
        }

        let state = self.user_state_mut(user);
        if state.main_session == token {
            return Ok(());
        }
        let previous = std::mem::replace(&mut state.main_session, token);
        debug!(user = %user, new = ?token, previous = ?previous, "Main session changed");

        // The new main seizes shared hardware before the old one lets go
        if let Some(token) = token {
            self.set_main_locked(user, token, true, caller.uid);
        }
        if let Some(previous) = previous {
            self.set_main_locked(user, previous, false, Uid::SYSTEM);
        }
        Ok(())
    }

    /// Tells the session (or the hardware session it wraps) whether it is
    /// main. Only hardware providers are told.
    fn set_main_locked(&self, user: UserId, token: SessionToken, is_main: bool, uid: Uid) {
        let target = match self.session_state(user, token, uid) {
            Ok(state) => state.hardware_session.unwrap_or(token),
            Err(e) => {
                error!(token = %token, error = %e, "Error in set_main");
                return;
            }
        };
        let Ok(state) = self.session_state(user, target, Uid::SYSTEM) else {
            error!(token = %target, "Hardware session not found in set_main");
            return;
        };
        let is_hardware = self
            .users
            .get(&user)
            .and_then(|s| s.services.get(&state.input.component))
            .is_some_and(|s| s.is_hardware);
        if !is_hardware {
            return;
        }
        match &state.session {
            Some(session) => {
                if let Err(e) = session.send(SessionOp::SetMain(is_main)) {
                    error!(token = %target, error = %e, "Error in set_main");
                }
            }
            None => error!(token = %target, "Session not yet created in set_main"),
        }
    }

    // ========================================================================
    // Per-session operations
    // ========================================================================

    fn handle_session_op(
        &mut self,
        caller: &CallerIdentity,
        user: UserId,
        token: SessionToken,
        op: SessionOp,
    ) -> Result<(), BrokerError> {
        let user = self.resolve_calling_user(caller, user)?;
        let uid = caller.uid;

        match op {
            SessionOp::Release | SessionOp::SetMain(_) => Err(BrokerError::InvalidInput(format!(
                "{} has a dedicated broker call",
                op.name()
            ))),
            SessionOp::UnblockContent(_)
                if !caller.has_permission(Permission::ModifyParentalControls) =>
            {
                Err(BrokerError::permission(
                    "unblock_content requires the modify-parental-controls permission",
                ))
            }
            SessionOp::SetSurface(surface) => {
                let target = match self.session_state(user, token, uid)?.hardware_session {
                    Some(hardware) => self.live_session(user, hardware, Uid::SYSTEM)?,
                    None => self.live_session(user, token, uid)?,
                };
                forward(&target, token, SessionOp::SetSurface(surface));
                Ok(())
            }
            SessionOp::SetVolume(volume) => {
                let session = self.live_session(user, token, uid)?;
                forward(&session, token, SessionOp::SetVolume(volume));
                // The hardware session only gets on/off to avoid double attenuation
                let on_off = if volume > 0.0 { 1.0 } else { 0.0 };
                self.forward_to_hardware_session(user, token, SessionOp::SetVolume(on_off));
                Ok(())
            }
            SessionOp::DispatchSurfaceChanged { .. } => {
                let session = self.live_session(user, token, uid)?;
                forward(&session, token, op.clone());
                self.forward_to_hardware_session(user, token, op);
                Ok(())
            }
            SessionOp::Tune { uri, params } => {
                let session = self.live_session(user, token, uid)?;
                let sent = forward(
                    &session,
                    token,
                    SessionOp::Tune {
                        uri: uri.clone(),
                        params: params.clone(),
                    },
                );
                // Pass-through and program URIs are not channel watches
                if let (true, Some(channel_id)) = (sent, uri.channel_id()) {
                    let package = self
                        .session_state(user, token, uid)?
                        .input
                        .component
                        .package
                        .clone();
                    self.watch_log.log_start(WatchRecord::start(
                        token,
                        package,
                        now_ms(),
                        channel_id,
                        &params,
                    ));
                }
                Ok(())
            }
            other => {
                let session = self.live_session(user, token, uid)?;
                forward(&session, token, other);
                Ok(())
            }
        }
    }

    fn forward_to_hardware_session(&self, user: UserId, token: SessionToken, op: SessionOp) {
        let Some(hardware) = self
            .users
            .get(&user)
            .and_then(|s| s.sessions.get(&token))
            .and_then(|s| s.hardware_session)
        else {
            return;
        };
        match self.live_session(user, hardware, Uid::SYSTEM) {
            Ok(session) => {
                forward(&session, hardware, op);
            }
            Err(e) => error!(token = %hardware, error = %e, "Hardware session unavailable"),
        }
    }

    pub(super) fn is_single_session_active(&self, user: UserId) -> bool {
        let Some(state) = self.users.get(&user) else {
            return false;
        };
        match state.sessions.len() {
            1 => true,
            // A wrapper input and the hardware session behind it
            2 => state.sessions.values().any(|s| s.hardware_session.is_some()),
            _ => false,
        }
    }

    // ========================================================================
    // Callbacks & settings
    // ========================================================================

    fn handle_register_callback(
        &mut self,
        caller: &CallerIdentity,
        user: UserId,
        callback: RegistryCallback,
    ) -> Result<(), BrokerError> {
        let user = self.resolve_calling_user(caller, user)?;
        let Some(commands) = self.commands.upgrade() else {
            return Err(BrokerError::ChannelClosed);
        };
        let peer = callback.peer().id();
        let death_watch = watch(callback.peer(), move || {
            let _ = commands.send(BrokerCommand::CallbackDied {
                user,
                callback: peer,
            });
        });
        match death_watch {
            Ok(death_watch) => {
                self.user_state_mut(user).callbacks.insert(
                    peer,
                    CallbackState {
                        callback,
                        _death_watch: Some(death_watch),
                    },
                );
                debug!(user = %user, callback = %peer, "Registry callback registered");
            }
            Err(_) => debug!(user = %user, "Registry callback already dead"),
        }
        Ok(())
    }

    fn with_parental_permission(
        &self,
        caller: &CallerIdentity,
        user: UserId,
        f: impl FnOnce(&dyn SettingsStore, UserId) -> Result<(), crate::settings::SettingsError>,
    ) -> Result<(), BrokerError> {
        let user = self.resolve_calling_user(caller, user)?;
        if !caller.has_permission(Permission::ModifyParentalControls) {
            return Err(BrokerError::permission(
                "requires the modify-parental-controls permission",
            ));
        }
        f(self.settings.as_ref(), user).map_err(|e| BrokerError::Settings(e.to_string()))
    }

    fn handle_remove_blocked_rating(
        &self,
        caller: &CallerIdentity,
        user: UserId,
        rating: &ContentRating,
    ) -> Result<(), BrokerError> {
        self.with_parental_permission(caller, user, |settings, user| {
            settings.remove_blocked_rating(user, rating)
        })
    }

    // ========================================================================
    // Hardware pass-through
    // ========================================================================

    fn handle_get_hardware_list(&self, caller: &CallerIdentity) -> Vec<HardwareInfo> {
        if !caller.has_permission(Permission::TvInputHardware) {
            return Vec::new();
        }
        self.hardware.hardware_list()
    }

    fn handle_acquire_hardware(
        &self,
        caller: &CallerIdentity,
        user: UserId,
        device_id: u32,
        input: &tvim_core::InputDescriptor,
        callback: Arc<dyn HardwareCallback>,
    ) -> Result<Option<HardwareLease>, BrokerError> {
        if !caller.has_permission(Permission::TvInputHardware) {
            return Ok(None);
        }
        let user = self.resolve_calling_user(caller, user)?;
        Ok(self
            .hardware
            .acquire_hardware(device_id, callback, input, caller.uid, user))
    }

    fn handle_release_hardware(
        &self,
        caller: &CallerIdentity,
        user: UserId,
        lease: HardwareLease,
    ) -> Result<(), BrokerError> {
        if !caller.has_permission(Permission::TvInputHardware) {
            return Ok(());
        }
        let user = self.resolve_calling_user(caller, user)?;
        self.hardware.release_hardware(lease, caller.uid, user);
        Ok(())
    }

    fn handle_get_available_stream_configs(
        &self,
        caller: &CallerIdentity,
        user: UserId,
        input_id: &InputId,
    ) -> Result<Vec<StreamConfig>, BrokerError> {
        if !caller.has_permission(Permission::CaptureTvInput) {
            return Err(BrokerError::permission("requires the capture permission"));
        }
        let user = self.resolve_calling_user(caller, user)?;
        let known = self
            .users
            .get(&user)
            .is_some_and(|s| s.inputs.contains_key(input_id));
        if !known {
            return Err(BrokerError::InputNotFound(input_id.clone()));
        }
        Ok(self
            .hardware
            .available_stream_configs(input_id, caller.uid, user))
    }

    fn handle_capture_frame(
        &self,
        caller: &CallerIdentity,
        user: UserId,
        input_id: &InputId,
        surface: SurfaceHandle,
        config: &StreamConfig,
    ) -> Result<bool, BrokerError> {
        if !caller.has_permission(Permission::CaptureTvInput) {
            return Err(BrokerError::permission("requires the capture permission"));
        }
        let user = self.resolve_calling_user(caller, user)?;
        let Some(state) = self.users.get(&user) else {
            return Ok(false);
        };
        if !state.inputs.contains_key(input_id) {
            error!(input_id = %input_id, "Input not found for capture");
            return Ok(false);
        }

        // A wrapper input captures from the hardware input behind it
        let hardware_input = state
            .sessions
            .values()
            .find(|s| &s.input.id == input_id && s.hardware_session.is_some())
            .and_then(|s| s.hardware_session)
            .and_then(|hw| state.sessions.get(&hw))
            .map(|s| s.input.id.clone());
        let target = hardware_input.as_ref().unwrap_or(input_id);
        Ok(self
            .hardware
            .capture_frame(target, surface, config, caller.uid, user))
    }

    // ========================================================================
    // Users
    // ========================================================================

    fn handle_switch_user(&mut self, user: UserId) {
        if self.current_user == user {
            return;
        }
        let previous = self.current_user;
        info!(from = %previous, to = %user, "Switching user");
        self.clear_session_and_service_states(previous);
        self.current_user = user;
        self.rebuild_input_list(user, None);
        self.watch_log.switch_user(user);
    }

    fn handle_remove_user(&mut self, user: UserId) {
        info!(user = %user, "Removing user");
        self.clear_session_and_service_states(user);
        self.users.remove(&user);
    }

    /// Releases every session and drops every provider connection of `user`.
    ///
    /// Owners of live sessions get `SessionReleased`; pending creations
    /// resolve to a null result. Inputs, clients and registry callbacks of
    /// the user are kept.
    fn clear_session_and_service_states(&mut self, user: UserId) {
        let Some(state) = self.users.get_mut(&user) else {
            return;
        };
        let sessions = std::mem::take(&mut state.sessions);
        let services = std::mem::take(&mut state.services);
        state.main_session = None;
        state.clients.retain(|_, client| {
            client.tokens.retain(|t| !sessions.contains_key(t));
            !client.tokens.is_empty()
        });

        for session in sessions.values() {
            match &session.session {
                Some(live) => {
                    if let Err(e) = live.send(SessionOp::Release) {
                        error!(token = %session.token, error = %e, "Error in release");
                    }
                    session.client.send(ClientEvent::SessionReleased {
                        token: session.token,
                        seq: session.seq,
                    });
                }
                None => {
                    session.client.send(ClientEvent::SessionCreated {
                        input_id: session.input.id.clone(),
                        token: None,
                        channel: None,
                        seq: session.seq,
                    });
                }
            }
            self.watch_log.log_end(WatchRecord::end(session.token, now_ms()));
        }

        for service in services.values() {
            if let Some(remote) = &service.service {
                if service.callback_registered {
                    if let Err(e) = remote.unregister_callback() {
                        debug!(component = %service.component, error = %e, "Error in unregister_callback");
                    }
                }
            }
            if service.bound || service.service.is_some() {
                self.connector.unbind(&service.component, user);
            }
        }
        debug!(
            user = %user,
            sessions = sessions.len(),
            services = services.len(),
            "User state cleared"
        );
    }

    pub(super) fn snapshot(&self) -> BrokerSnapshot {
        let mut users: Vec<_> = self.users.values().map(UserState::snapshot).collect();
        users.sort_by_key(|u| u.user);
        BrokerSnapshot {
            current_user: self.current_user,
            users,
        }
    }
}

/// Sends `op` to a live session. Failures are logged and swallowed.
fn forward(session: &Arc<dyn RemoteSession>, token: SessionToken, op: SessionOp) -> bool {
    let name = op.name();
    match session.send(op) {
        Ok(()) => true,
        Err(e) => {
            error!(token = %token, op = name, error = %e, "Error forwarding to session");
            false
        }
    }
}
