//! tvim Protocol - Wire protocol for daemon communication
//!
//! Newline-delimited JSON between socket clients and the tvimd daemon.
//! Every client message carries the protocol version; the first message
//! on a connection must be `connect`.

pub mod message;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, ErrorCode, MessageType};
pub use version::{ProtocolVersion, VersionError};
