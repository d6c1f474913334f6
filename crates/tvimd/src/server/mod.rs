//! Unix socket server for the tvim daemon.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler for each client
//! - Supports graceful shutdown via CancellationToken
//!
//! Every connection is one client process to the broker. Its sessions and
//! registry callbacks live as long as the connection does.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  requests   ┌─────────────────┐
//! │ConnectionHandler│────────────▶│  BrokerHandle   │
//! │   (per client)  │◀────────────│                 │
//! └─────────────────┘  events     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, MAX_MESSAGE_SIZE};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tvim_protocol::DaemonMessage;

use crate::broker::BrokerHandle;
pub use crate::config::DEFAULT_SOCKET_PATH;

/// Maximum number of concurrent socket clients.
pub const MAX_CLIENTS: usize = 64;

/// Unix socket server for the tvim daemon.
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,

    broker: BrokerHandle,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Connection counter for generating client IDs
    connection_counter: AtomicU64,

    /// Connections currently being served
    active: Arc<AtomicUsize>,
}

impl DaemonServer {
    /// Creates a new daemon server.
    ///
    /// # Arguments
    ///
    /// * `socket_path` - Path where the Unix socket will be created
    /// * `broker` - Handle to the session broker
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        socket_path: impl Into<PathBuf>,
        broker: BrokerHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            broker,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Runs the server.
    ///
    /// Listens for connections until the cancellation token is triggered.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;

        info!(
            socket = %self.socket_path.display(),
            "Daemon server listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    /// Removes a stale socket file and binds a fresh listener.
    fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_error)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }

        UnixListener::bind(&self.socket_path).map_err(setup_error)
    }

    /// Handles a new client connection by spawning a handler task.
    fn handle_connection(&self, stream: UnixStream, connection_number: u64) {
        if self.active.load(Ordering::Acquire) >= MAX_CLIENTS {
            let err = ServerError::TooManyClients { max: MAX_CLIENTS };
            warn!(connection = connection_number, error = %err, "Rejecting client");
            tokio::spawn(reject(stream, err.to_string()));
            return;
        }

        let broker = self.broker.clone();
        let active = Arc::clone(&self.active);
        active.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            match ConnectionHandler::new(stream, broker, connection_number) {
                Ok(handler) => {
                    let client_id = handler.run().await;
                    debug!(client_id = ?client_id, "Connection handler finished");
                }
                Err(e) => {
                    warn!(connection = connection_number, error = %e, "Dropping connection");
                }
            }
            active.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Performs cleanup on shutdown.
    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Server cleanup complete");
    }
}

/// Tells an over-limit client why it is being dropped.
async fn reject(mut stream: UnixStream, reason: String) {
    let Ok(mut line) = serde_json::to_vec(&DaemonMessage::rejected(&reason)) else {
        return;
    };
    line.push(b'\n');
    let _ = stream.write_all(&line).await;
    let _ = stream.shutdown().await;
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Too many clients (max: {max})")]
    TooManyClients { max: usize },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
