//! Peer liveness.
//!
//! A [`Peer`] stands for a remote process (or an object living inside
//! one). Anyone holding a clone can observe its death; [`watch`]
//! registers a one-shot callback that runs when the peer is lost and is
//! unsubscribed automatically when the returned [`PeerWatch`] is dropped.
//!
//! Peers form a tree: a child dies with its parent. A provider process
//! is a root peer and every session it hands out is a child.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::error::RemoteError;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Liveness handle of a remote process or object.
#[derive(Clone)]
pub struct Peer {
    id: PeerId,
    label: Arc<str>,
    alive: CancellationToken,
}

impl Peer {
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Self::with_token(label.into(), CancellationToken::new())
    }

    fn with_token(label: Arc<str>, alive: CancellationToken) -> Self {
        Self {
            id: PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)),
            label,
            alive,
        }
    }

    /// A peer that dies whenever `self` dies, and may also die alone.
    pub fn child(&self, label: impl Into<Arc<str>>) -> Self {
        Self::with_token(label.into(), self.alive.child_token())
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_alive(&self) -> bool {
        !self.alive.is_cancelled()
    }

    /// Marks the peer (and all its children) dead.
    pub fn kill(&self) {
        if self.is_alive() {
            debug!(peer = %self.id, label = %self.label, "Peer killed");
        }
        self.alive.cancel();
    }

    /// Resolves once the peer is dead.
    pub async fn lost(&self) {
        self.alive.cancelled().await;
    }

    /// Fails with [`RemoteError::PeerDead`] if the peer is gone.
    pub fn ensure_alive(&self) -> Result<(), RemoteError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(RemoteError::PeerDead)
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Subscription created by [`watch`]. Dropping it unsubscribes.
pub struct PeerWatch {
    peer: PeerId,
    _unsubscribe: DropGuard,
}

impl PeerWatch {
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

impl fmt::Debug for PeerWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerWatch").field("peer", &self.peer).finish()
    }
}

/// Runs `on_lost` once when `peer` dies, unless the watch is dropped first.
///
/// Fails with [`RemoteError::PeerDead`] when the peer is already dead;
/// the callback is not run in that case.
///
/// Must be called from within a tokio runtime.
pub fn watch<F>(peer: &Peer, on_lost: F) -> Result<PeerWatch, RemoteError>
where
    F: FnOnce() + Send + 'static,
{
    peer.ensure_alive()?;

    let unsubscribe = CancellationToken::new();
    let unsubscribed = unsubscribe.clone();
    let target = peer.clone();

    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = unsubscribed.cancelled() => {}
            _ = target.lost() => {
                debug!(peer = %target.id, label = %target.label, "Peer lost");
                on_lost();
            }
        }
    });

    Ok(PeerWatch {
        peer: peer.id,
        _unsubscribe: unsubscribe.drop_guard(),
    })
}
