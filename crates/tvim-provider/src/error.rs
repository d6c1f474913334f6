//! Error types for provider calls and the dispatch queue.

use thiserror::Error;

/// Failure of a one-way call into a provider or session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote process is gone.
    #[error("Remote peer is dead")]
    PeerDead,

    /// The remote side refused the call.
    #[error("Remote call rejected: {0}")]
    Rejected(String),
}

/// A session operation that breached a hard latency ceiling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{op} took longer than {limit_ms}ms")]
    Stalled { op: &'static str, limit_ms: u64 },
}
