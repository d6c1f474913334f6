//! tvim Daemon - TV input session broker and socket server
//!
//! This crate provides the core infrastructure for the tvim daemon:
//! - `broker` - Broker actor owning inputs, provider connections and sessions
//! - `client` - In-process client library on top of the broker
//! - `server` - Unix socket server for out-of-process clients
//! - `directory` / `hardware` / `settings` / `watch_log` - external collaborators
//! - `loopback` - Connector that runs loopback providers in-process
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        tvimd daemon                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  DaemonServer   │────▶│        BrokerActor          │    │
//! │  │ (Unix Socket)   │     │  (per-user state owner)     │    │
//! │  └────────┬────────┘     └──────┬───────────────┬──────┘    │
//! │           │                     │               │           │
//! │           │ connections         │ bind          │ records   │
//! │           ▼                     ▼               ▼           │
//! │  ┌─────────────────┐     ┌──────────────┐ ┌────────────┐    │
//! │  │ConnectionHandler│     │  Providers   │ │ Watch log  │    │
//! │  │  (per client)   │     │ (connector)  │ │ & settings │    │
//! │  └─────────────────┘     └──────────────┘ └────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod broker;
pub mod client;
pub mod config;
pub mod directory;
pub mod hardware;
pub mod loopback;
pub mod server;
pub mod settings;
pub mod watch_log;
