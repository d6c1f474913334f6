//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Derives the caller identity from the socket's peer credentials
//! - Routes requests to the broker
//! - Forwards session and registry events as they happen
//!
//! The connection is one client peer. When it closes, the peer is
//! killed and the broker releases every session and callback it owned.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use tvim_core::{CallerIdentity, Permission, SessionToken, Uid, UserId};
use tvim_protocol::{ClientMessage, DaemonMessage, ErrorCode, MessageType, ProtocolVersion};
use tvim_provider::{Peer, SessionOp};

use crate::broker::{
    BrokerError, BrokerHandle, ClientEvent, ClientHandle, InputNotification, RegistryCallback,
};

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Time allowed between accepting a connection and its `connect`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Read timeout for connections that own nothing (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Uids per user profile. A uid's user is `uid / PER_USER_RANGE`.
const PER_USER_RANGE: u32 = 100_000;

type SharedWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// A registry callback held on behalf of the connection.
struct Registration {
    peer: Peer,
    user: UserId,
    forwarder: JoinHandle<()>,
}

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,

    /// Shared with the event forwarders
    writer: SharedWriter,

    broker: BrokerHandle,

    /// Peer uid from `SO_PEERCRED`
    uid: u32,

    /// Peer pid from `SO_PEERCRED`, 0 when unknown
    pid: u32,

    connection_number: u64,

    /// Assigned after handshake
    client_id: Option<String>,

    /// Assigned after handshake
    caller: Option<CallerIdentity>,

    /// Liveness of this connection as seen by the broker
    peer: Peer,

    client: Option<ClientHandle>,
    session_forwarder: Option<JoinHandle<()>>,
    registration: Option<Registration>,

    /// Set once the client asked for a session
    owns_sessions: bool,
}

impl ConnectionHandler {
    /// Creates a handler, reading the peer credentials off `stream`.
    pub fn new(
        stream: UnixStream,
        broker: BrokerHandle,
        connection_number: u64,
    ) -> Result<Self, ConnectionError> {
        let cred = stream
            .peer_cred()
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        let pid = cred
            .pid()
            .and_then(|pid| u32::try_from(pid).ok())
            .unwrap_or(0);
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            broker,
            uid: cred.uid(),
            pid,
            connection_number,
            client_id: None,
            caller: None,
            peer: Peer::new(format!("socket:{connection_number}")),
            client: None,
            session_forwarder: None,
            registration: None,
            owns_sessions: false,
        })
    }

    /// Runs the connection handler.
    ///
    /// Performs the handshake, then processes messages until the
    /// connection closes. Returns the client id when the handshake
    /// succeeded.
    pub async fn run(mut self) -> Option<String> {
        debug!(
            connection = self.connection_number,
            uid = self.uid,
            pid = self.pid,
            "New client connected"
        );

        let handshake = match timeout(HANDSHAKE_TIMEOUT, self.handle_handshake()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        };
        if let Err(e) = handshake {
            warn!(
                connection = self.connection_number,
                error = %e,
                "Handshake failed"
            );
            return None;
        }
        info!(client_id = ?self.client_id, uid = self.uid, "Client handshake completed");

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        info!(client_id = ?self.client_id, "Client disconnected");
        self.client_id.clone()
    }

    /// Expects a `Connect` message, validates the protocol version and
    /// answers with `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = self.read_message().await?;

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect {
                client_id,
                permissions,
            } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                let caller = caller_identity(self.uid, self.pid, permissions);

                let current_user = match self.broker.snapshot().await {
                    Ok(snapshot) => snapshot.current_user,
                    Err(_) => caller.user_id,
                };

                let (client, events) = ClientHandle::new(self.peer.clone());
                self.session_forwarder = Some(spawn_forwarder(
                    events,
                    Arc::clone(&self.writer),
                    client_event_message,
                ));
                self.client = Some(client);
                self.caller = Some(caller);
                self.client_id = Some(assigned_id.clone());

                self.send_message(DaemonMessage::connected(assigned_id, current_user))
                    .await
            }
            other => {
                self.send_message(DaemonMessage::error(
                    "Expected Connect message for handshake",
                    ErrorCode::NotConnected,
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Main message processing loop.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            // A connection holding sessions or a callback may sit idle
            let read = if self.owns_sessions || self.registration.is_some() {
                Ok(self.read_message().await)
            } else {
                timeout(READ_TIMEOUT, self.read_message()).await
            };

            let msg = match read {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(reason))) => {
                    debug!(client_id = ?self.client_id, reason = %reason, "Malformed message");
                    self.send_message(DaemonMessage::error(
                        format!("Malformed message: {reason}"),
                        ErrorCode::InvalidRequest,
                    ))
                    .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            let reply = self.handle_message(msg).await?;
            self.send_message(reply).await?;
        }
    }

    /// Handles one request and returns its reply.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<DaemonMessage, ConnectionError> {
        let (Some(caller), Some(client)) = (self.caller.clone(), self.client.clone()) else {
            return Err(ConnectionError::UnexpectedMessage(
                "request before handshake".to_string(),
            ));
        };
        let user = msg.user_id.unwrap_or(UserId::CURRENT);
        let broker = &self.broker;

        let response = match msg.message {
            MessageType::Connect { .. } => {
                DaemonMessage::error("Already connected", ErrorCode::InvalidRequest)
            }
            MessageType::Ping { seq } => DaemonMessage::Pong { seq },
            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }

            // Input registry
            MessageType::GetInputList => reply(
                broker.get_input_list(caller, user).await,
                |inputs| DaemonMessage::InputList { inputs },
            ),
            MessageType::GetInputInfo { input_id } => reply(
                broker.get_input_info(caller, user, input_id).await,
                |input| DaemonMessage::InputInfo { input },
            ),
            MessageType::GetInputState { input_id } => reply(
                broker.get_input_state(caller, user, input_id.clone()).await,
                |state| DaemonMessage::InputState { input_id, state },
            ),
            MessageType::RegisterCallback => self.register_callback(caller, user).await,
            MessageType::UnregisterCallback => self.unregister_callback(caller).await,

            // Parental controls
            MessageType::IsParentalControlsEnabled => reply(
                broker.is_parental_controls_enabled(caller, user).await,
                |enabled| DaemonMessage::ParentalControls { enabled },
            ),
            MessageType::SetParentalControlsEnabled { enabled } => ack(
                broker
                    .set_parental_controls_enabled(caller, user, enabled)
                    .await,
            ),
            MessageType::IsRatingBlocked { rating } => reply(
                broker.is_rating_blocked(caller, user, rating.clone()).await,
                |blocked| DaemonMessage::RatingBlocked { rating, blocked },
            ),
            MessageType::AddBlockedRating { rating } => {
                ack(broker.add_blocked_rating(caller, user, rating).await)
            }
            MessageType::RemoveBlockedRating { rating } => {
                ack(broker.remove_blocked_rating(caller, user, rating).await)
            }
            MessageType::GetBlockedRatings => reply(
                broker.get_blocked_ratings(caller, user).await,
                |ratings| DaemonMessage::BlockedRatings { ratings },
            ),

            // Sessions
            MessageType::CreateSession { input_id, seq } => {
                self.owns_sessions = true;
                ack(broker
                    .create_session(caller, user, client, input_id, seq)
                    .await
                    .map(|_| ()))
            }
            MessageType::ReleaseSession { token } => {
                ack(broker.release_session(caller, user, token).await)
            }
            MessageType::SetMainSession { token } => {
                ack(broker.set_main_session(caller, user, token).await)
            }
            MessageType::Tune { token, uri, params } => {
                self.session_op(caller, user, token, SessionOp::Tune { uri, params })
                    .await
            }
            MessageType::SetVolume { token, volume } => {
                self.session_op(caller, user, token, SessionOp::SetVolume(volume))
                    .await
            }
            MessageType::SetCaptionEnabled { token, enabled } => {
                self.session_op(caller, user, token, SessionOp::SetCaptionEnabled(enabled))
                    .await
            }
            MessageType::SelectTrack {
                token,
                track_type,
                track_id,
            } => {
                let op = SessionOp::SelectTrack {
                    track_type,
                    track_id,
                };
                self.session_op(caller, user, token, op).await
            }
            MessageType::SendAppPrivateCommand {
                token,
                action,
                data,
            } => {
                let op = SessionOp::AppPrivateCommand { action, data };
                self.session_op(caller, user, token, op).await
            }
            MessageType::UnblockContent { token, rating } => {
                self.session_op(caller, user, token, SessionOp::UnblockContent(rating))
                    .await
            }
            MessageType::TimeShiftPause { token } => {
                self.session_op(caller, user, token, SessionOp::TimeShiftPause)
                    .await
            }
            MessageType::TimeShiftResume { token } => {
                self.session_op(caller, user, token, SessionOp::TimeShiftResume)
                    .await
            }
            MessageType::TimeShiftSeekTo { token, time_ms } => {
                self.session_op(caller, user, token, SessionOp::TimeShiftSeekTo(time_ms))
                    .await
            }
            MessageType::TimeShiftSetPlaybackParams { token, params } => {
                let op = SessionOp::TimeShiftSetPlaybackParams(params);
                self.session_op(caller, user, token, op).await
            }
            MessageType::TimeShiftEnablePositionTracking { token, enabled } => {
                let op = SessionOp::TimeShiftEnablePositionTracking(enabled);
                self.session_op(caller, user, token, op).await
            }

            MessageType::Dump => match broker.snapshot().await {
                Ok(snapshot) => match serde_json::to_value(&snapshot) {
                    Ok(snapshot) => DaemonMessage::Dump { snapshot },
                    Err(e) => DaemonMessage::error(e.to_string(), ErrorCode::Internal),
                },
                Err(e) => broker_error(e),
            },
        };

        Ok(response)
    }

    async fn session_op(
        &self,
        caller: CallerIdentity,
        user: UserId,
        token: SessionToken,
        op: SessionOp,
    ) -> DaemonMessage {
        ack(self.broker.session_op(caller, user, token, op).await)
    }

    async fn register_callback(&mut self, caller: CallerIdentity, user: UserId) -> DaemonMessage {
        if self.registration.is_some() {
            return DaemonMessage::Ack;
        }

        let peer = self.peer.child(format!("callback:{}", self.connection_number));
        let (callback, events) = RegistryCallback::new(peer.clone());
        if let Err(e) = self.broker.register_callback(caller, user, callback).await {
            peer.kill();
            return broker_error(e);
        }

        let forwarder = spawn_forwarder(events, Arc::clone(&self.writer), notification_message);
        self.registration = Some(Registration {
            peer,
            user,
            forwarder,
        });
        DaemonMessage::Ack
    }

    async fn unregister_callback(&mut self, caller: CallerIdentity) -> DaemonMessage {
        let Some(registration) = self.registration.take() else {
            return DaemonMessage::Ack;
        };
        let result = self
            .broker
            .unregister_callback(caller, registration.user, registration.peer.id())
            .await;
        registration.peer.kill();
        registration.forwarder.abort();
        ack(result)
    }

    /// Reads a single message from the client.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();
        let mut limited = (&mut self.reader).take(MAX_MESSAGE_SIZE as u64 + 1);

        let bytes_read = limited
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        write_message(&self.writer, &msg).await
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        // Cascades release of every session and callback of this client
        self.peer.kill();
        if let Some(forwarder) = self.session_forwarder.take() {
            forwarder.abort();
        }
        if let Some(registration) = self.registration.take() {
            registration.forwarder.abort();
        }
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

// ============================================================================
// Helpers
// ============================================================================

/// Identity of a socket peer.
///
/// Root and the daemon's own uid act as the system caller and receive the
/// permissions they ask for. Everyone else runs as the user their uid
/// belongs to, without capability permissions.
fn caller_identity(uid: u32, pid: u32, requested: Vec<Permission>) -> CallerIdentity {
    // SAFETY: geteuid has no preconditions and cannot fail
    let daemon_uid = unsafe { libc::geteuid() };

    if uid == 0 || uid == daemon_uid {
        let mut caller = CallerIdentity::new(pid, Uid::SYSTEM, UserId::SYSTEM);
        caller.permissions.extend(requested);
        return caller;
    }

    if !requested.is_empty() {
        warn!(uid, ?requested, "Ignoring permissions requested by untrusted client");
    }
    let user = i32::try_from(uid / PER_USER_RANGE).unwrap_or(0);
    CallerIdentity::new(pid, Uid::new(uid), UserId::new(user))
}

fn reply<T>(result: Result<T, BrokerError>, ok: impl FnOnce(T) -> DaemonMessage) -> DaemonMessage {
    match result {
        Ok(value) => ok(value),
        Err(e) => broker_error(e),
    }
}

fn ack(result: Result<(), BrokerError>) -> DaemonMessage {
    reply(result, |()| DaemonMessage::Ack)
}

pub(crate) fn broker_error(err: BrokerError) -> DaemonMessage {
    let code = match &err {
        BrokerError::SessionNotFound(_) => ErrorCode::SessionNotFound,
        BrokerError::InputNotFound(_) => ErrorCode::InputNotFound,
        BrokerError::PermissionDenied(_) => ErrorCode::PermissionDenied,
        BrokerError::InvalidInput(_) => ErrorCode::InvalidRequest,
        BrokerError::ChannelClosed | BrokerError::Settings(_) => ErrorCode::Internal,
    };
    DaemonMessage::error(err.to_string(), code)
}

pub(crate) fn client_event_message(event: ClientEvent) -> DaemonMessage {
    match event {
        // The input channel is in-process only; dropping it closes it
        ClientEvent::SessionCreated {
            input_id,
            token,
            seq,
            ..
        } => DaemonMessage::SessionCreated {
            input_id,
            token,
            seq,
        },
        ClientEvent::SessionReleased { token, seq } => {
            DaemonMessage::SessionReleased { token, seq }
        }
        ClientEvent::Session { token, seq, event } => {
            DaemonMessage::SessionEvent { token, seq, event }
        }
    }
}

pub(crate) fn notification_message(notification: InputNotification) -> DaemonMessage {
    match notification {
        InputNotification::Added(input_id) => DaemonMessage::InputAdded { input_id },
        InputNotification::Removed(input_id) => DaemonMessage::InputRemoved { input_id },
        InputNotification::Updated(input_id) => DaemonMessage::InputUpdated { input_id },
        InputNotification::StateChanged { input_id, state } => {
            DaemonMessage::InputStateChanged { input_id, state }
        }
    }
}

/// Writes everything arriving on `events` to the client, in order.
fn spawn_forwarder<E: Send + 'static>(
    mut events: mpsc::UnboundedReceiver<E>,
    writer: SharedWriter,
    convert: fn(E) -> DaemonMessage,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Err(e) = write_message(&writer, &convert(event)).await {
                error!(error = %e, "Failed to forward event to client");
                break;
            }
        }
    })
}

async fn write_message(writer: &SharedWriter, msg: &DaemonMessage) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    let mut writer = writer.lock().await;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}
