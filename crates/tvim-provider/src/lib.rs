//! tvim Provider - the provider side of the session contract.
//!
//! A provider is an out-of-process component that creates sessions for
//! one or more inputs. This crate holds:
//!
//! - The traits the broker talks to (`ProviderService`, `RemoteSession`)
//!   and the callbacks providers report through (`SessionCallback`,
//!   `ServiceCallback`)
//! - Peer liveness (`Peer`, `watch`)
//! - The per-session dispatch queue and its worker (`SessionWrapper`)
//! - The input-event channel
//! - A loopback provider that runs in-process
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod input;
pub mod loopback;
pub mod op;
pub mod peer;
pub mod queue;
pub mod remote;
pub mod session;
pub mod wrapper;

pub use error::{DispatchError, RemoteError};
pub use tvim_core::SessionEvent;
pub use input::{
    input_channel_pair, InputChannelClient, InputChannelServer, InputDispatch, InputEvent,
    InputEventFinisher,
};
pub use loopback::{JournalEntry, LoopbackJournal, LoopbackProvider};
pub use op::SessionOp;
pub use peer::{watch, Peer, PeerId, PeerWatch};
pub use queue::DispatchQueue;
pub use remote::{ProviderService, RemoteSession, ServiceCallback, SessionCallback};
pub use session::SessionImpl;
pub use wrapper::{LatencyLimits, SessionWrapper};
