//! Per-user broker state and its diagnostic snapshot.
//!
//! Everything here is owned by the actor task. Remote handles are held
//! as trait objects; peer watches unsubscribe when their state is dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tvim_core::{
    ClientId, ComponentName, InputDescriptor, InputId, InputState, SessionToken, Uid, UserId,
};
use tvim_provider::{InputChannelClient, PeerId, PeerWatch, ProviderService, RemoteSession};

use super::fanout::{ClientHandle, RegistryCallback};

/// An input in the registry with its connectivity.
pub(crate) struct InputRecord {
    pub(crate) descriptor: InputDescriptor,
    pub(crate) state: InputState,
}

/// Connection to one provider component for one user.
///
/// `bound && service.is_none()` is the binding phase.
pub(crate) struct ServiceState {
    pub(crate) component: ComponentName,
    pub(crate) is_hardware: bool,
    pub(crate) bound: bool,
    pub(crate) reconnecting: bool,
    pub(crate) service: Option<Arc<dyn ProviderService>>,
    pub(crate) callback_registered: bool,
    /// Sessions created (or being created) on this provider, oldest first.
    pub(crate) session_tokens: Vec<SessionToken>,
    /// Inputs the provider reported for its hardware, oldest first.
    pub(crate) hardware_inputs: Vec<InputDescriptor>,
    pub(crate) death_watch: Option<PeerWatch>,
}

impl ServiceState {
    pub(crate) fn new(component: ComponentName, is_hardware: bool) -> Self {
        Self {
            component,
            is_hardware,
            bound: false,
            reconnecting: false,
            service: None,
            callback_registered: false,
            session_tokens: Vec::new(),
            hardware_inputs: Vec::new(),
            death_watch: None,
        }
    }

    pub(crate) fn service_peer(&self) -> Option<PeerId> {
        self.service.as_ref().map(|s| s.peer().id())
    }
}

pub(crate) struct SessionState {
    pub(crate) token: SessionToken,
    pub(crate) client: ClientHandle,
    pub(crate) seq: u64,
    pub(crate) calling_uid: Uid,
    pub(crate) user: UserId,
    pub(crate) input: InputDescriptor,
    /// Set once the provider created the session.
    pub(crate) session: Option<Arc<dyn RemoteSession>>,
    /// The hardware session this session wraps, if any.
    pub(crate) hardware_session: Option<SessionToken>,
    /// Client end of the input channel until creation is reported.
    pub(crate) pending_channel: Option<InputChannelClient>,
    pub(crate) death_watch: Option<PeerWatch>,
}

pub(crate) struct ClientState {
    pub(crate) tokens: Vec<SessionToken>,
    pub(crate) _death_watch: Option<PeerWatch>,
}

pub(crate) struct CallbackState {
    pub(crate) callback: RegistryCallback,
    pub(crate) _death_watch: Option<PeerWatch>,
}

/// All broker state of one user.
pub(crate) struct UserState {
    pub(crate) user: UserId,
    pub(crate) inputs: BTreeMap<InputId, InputRecord>,
    pub(crate) packages: BTreeSet<String>,
    /// Components allowed to manage hardware inputs.
    pub(crate) hardware_components: BTreeSet<ComponentName>,
    pub(crate) clients: HashMap<ClientId, ClientState>,
    pub(crate) services: BTreeMap<ComponentName, ServiceState>,
    pub(crate) sessions: BTreeMap<SessionToken, SessionState>,
    pub(crate) callbacks: BTreeMap<PeerId, CallbackState>,
    pub(crate) main_session: Option<SessionToken>,
}

impl UserState {
    pub(crate) fn new(user: UserId) -> Self {
        Self {
            user,
            inputs: BTreeMap::new(),
            packages: BTreeSet::new(),
            hardware_components: BTreeSet::new(),
            clients: HashMap::new(),
            services: BTreeMap::new(),
            sessions: BTreeMap::new(),
            callbacks: BTreeMap::new(),
            main_session: None,
        }
    }

    pub(crate) fn snapshot(&self) -> UserSnapshot {
        let mut clients: Vec<ClientSnapshot> = self
            .clients
            .iter()
            .map(|(id, client)| ClientSnapshot {
                client: *id,
                tokens: client.tokens.clone(),
            })
            .collect();
        clients.sort_by_key(|c| c.client);

        UserSnapshot {
            user: self.user,
            inputs: self
                .inputs
                .values()
                .map(|record| InputSnapshot {
                    input_id: record.descriptor.id.clone(),
                    component: record.descriptor.component.clone(),
                    state: record.state,
                })
                .collect(),
            services: self
                .services
                .values()
                .map(|service| ServiceSnapshot {
                    component: service.component.clone(),
                    is_hardware: service.is_hardware,
                    bound: service.bound,
                    connected: service.service.is_some(),
                    reconnecting: service.reconnecting,
                    session_tokens: service.session_tokens.clone(),
                    hardware_inputs: service
                        .hardware_inputs
                        .iter()
                        .map(|d| d.id.clone())
                        .collect(),
                })
                .collect(),
            sessions: self
                .sessions
                .values()
                .map(|session| SessionSnapshot {
                    token: session.token,
                    client: session.client.id(),
                    seq: session.seq,
                    calling_uid: session.calling_uid,
                    input_id: session.input.id.clone(),
                    live: session.session.is_some(),
                    hardware_session: session.hardware_session,
                })
                .collect(),
            clients,
            main_session: self.main_session,
            callbacks: self.callbacks.len(),
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Diagnostic dump of the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub current_user: UserId,
    pub users: Vec<UserSnapshot>,
}

impl BrokerSnapshot {
    pub fn user(&self, user: UserId) -> Option<&UserSnapshot> {
        self.users.iter().find(|u| u.user == user)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub user: UserId,
    pub inputs: Vec<InputSnapshot>,
    pub services: Vec<ServiceSnapshot>,
    pub sessions: Vec<SessionSnapshot>,
    pub clients: Vec<ClientSnapshot>,
    pub main_session: Option<SessionToken>,
    pub callbacks: usize,
}

impl UserSnapshot {
    pub fn service(&self, component: &ComponentName) -> Option<&ServiceSnapshot> {
        self.services.iter().find(|s| &s.component == component)
    }

    pub fn session(&self, token: SessionToken) -> Option<&SessionSnapshot> {
        self.sessions.iter().find(|s| s.token == token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSnapshot {
    pub input_id: InputId,
    pub component: ComponentName,
    pub state: InputState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub component: ComponentName,
    pub is_hardware: bool,
    pub bound: bool,
    pub connected: bool,
    pub reconnecting: bool,
    pub session_tokens: Vec<SessionToken>,
    pub hardware_inputs: Vec<InputId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub token: SessionToken,
    pub client: ClientId,
    pub seq: u64,
    pub calling_uid: Uid,
    pub input_id: InputId,
    pub live: bool,
    pub hardware_session: Option<SessionToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub client: ClientId,
    pub tokens: Vec<SessionToken>,
}
