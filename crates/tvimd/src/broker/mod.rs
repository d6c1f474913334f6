//! Session broker using the Actor pattern.
//!
//! The broker is the single owner of every user's inputs, provider
//! connections, sessions and callbacks. Public calls and internal reports
//! (provider callbacks, peer deaths, hardware hot-plug) all arrive as
//! [`BrokerCommand`]s on one unbounded channel and are handled in order.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  BrokerCommand  ┌──────────────┐  one-way ops  ┌──────────────┐
//! │ BrokerHandle │───────────────▶│ BrokerActor  │──────────────▶│  Providers   │
//! └──────────────┘                 └──────────────┘               └──────────────┘
//!        ▲                          │    ▲    ▲                        │
//!        │ ClientEvent              │    │    └──── SessionCallback ───┘
//!        └──────────────────────────┘    └────────── peer deaths
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::sync::Arc;

use tokio::sync::mpsc;

mod actor;
mod commands;
mod connection;
mod fanout;
mod handle;
mod inputs;
mod state;

pub use actor::{BrokerActor, BrokerDeps};
pub use commands::{
    BrokerCommand, BrokerError, ClientEvent, HardwareEvent, InputNotification, Respond,
};
pub use connection::{ConnectionReporter, ProviderConnector};
pub use fanout::{ClientHandle, RegistryCallback};
pub use handle::BrokerHandle;
pub use state::{
    BrokerSnapshot, ClientSnapshot, InputSnapshot, ServiceSnapshot, SessionSnapshot,
    UserSnapshot,
};

use fanout::HardwareListenerProxy;

/// Spawns the broker actor and returns a handle for interaction.
///
/// The actor first builds the active user's input list, binding its
/// hardware providers.
///
/// # Example
///
/// ```ignore
/// let handle = spawn_broker(BrokerDeps {
///     directory,
///     connector,
///     hardware,
///     settings,
///     watch_log,
///     current_user: UserId::SYSTEM,
/// });
/// let inputs = handle.get_input_list(caller, UserId::CURRENT).await?;
/// ```
pub fn spawn_broker(deps: BrokerDeps) -> BrokerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    deps.hardware.set_listener(Arc::new(HardwareListenerProxy {
        commands: cmd_tx.clone(),
    }));

    let actor = BrokerActor::new(cmd_rx, cmd_tx.downgrade(), deps);
    tokio::spawn(actor.run());

    BrokerHandle::new(cmd_tx)
}
