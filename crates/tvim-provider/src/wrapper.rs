//! Session wrapper: the provider-side dispatch queue of one session.
//!
//! The broker holds a [`SessionWrapper`] as an `Arc<dyn RemoteSession>`.
//! Every call enqueues one [`SessionOp`]; a single worker task executes
//! them in order against the provider's [`SessionImpl`].
//!
//! # Ordering
//!
//! - Operations execute strictly in arrival order
//! - A new `tune` drops every `tune` still waiting in the queue
//! - `release` runs the overlay-cleanup hook synchronously before it is
//!   queued; nothing queued after it executes
//!
//! # Latency ceilings
//!
//! An operation slower than [`LatencyLimits::warn_after`] is logged. A
//! `tune` exceeding [`LatencyLimits::tune_ceiling`], or any operation
//! exceeding [`LatencyLimits::op_ceiling`], is fatal: the worker stops
//! and the whole provider peer is killed, which the broker sees as a
//! provider crash.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{DispatchError, RemoteError};
use crate::input::{InputChannelServer, InputDispatch};
use crate::op::SessionOp;
use crate::peer::Peer;
use crate::queue::DispatchQueue;
use crate::remote::RemoteSession;
use crate::session::{execute, SessionImpl};

/// Latency thresholds of the session worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyLimits {
    pub warn_after: Duration,
    pub tune_ceiling: Duration,
    pub op_ceiling: Duration,
}

impl Default for LatencyLimits {
    fn default() -> Self {
        Self {
            warn_after: Duration::from_millis(50),
            tune_ceiling: Duration::from_millis(2000),
            op_ceiling: Duration::from_millis(5000),
        }
    }
}

/// Broker-facing handle of one provider session.
pub struct SessionWrapper {
    peer: Peer,
    queue: Arc<DispatchQueue<SessionOp>>,
    session: Arc<dyn SessionImpl>,
}

impl SessionWrapper {
    /// Starts the worker (and the input receiver, when a channel is given).
    ///
    /// The session's peer is a child of `provider`. Must be called from
    /// within a tokio runtime.
    pub fn spawn(
        session: Arc<dyn SessionImpl>,
        provider: &Peer,
        label: &str,
        channel: Option<InputChannelServer>,
        limits: LatencyLimits,
    ) -> Arc<Self> {
        let peer = provider.child(format!("session:{label}"));
        let queue = Arc::new(DispatchQueue::new());
        let released = CancellationToken::new();

        tokio::spawn(run_worker(
            queue.clone(),
            session.clone(),
            peer.clone(),
            provider.clone(),
            limits,
            released.clone(),
        ));

        if let Some(channel) = channel {
            tokio::spawn(run_input_receiver(
                channel,
                session.clone(),
                peer.clone(),
                released,
            ));
        }

        Arc::new(Self {
            peer,
            queue,
            session,
        })
    }

    /// Number of operations waiting for the worker.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl RemoteSession for SessionWrapper {
    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn send(&self, op: SessionOp) -> Result<(), RemoteError> {
        self.peer.ensure_alive()?;

        let name = op.name();
        let accepted = match op {
            SessionOp::Release => {
                self.session.schedule_overlay_view_cleanup();
                self.queue.push(SessionOp::Release)
            }
            tune @ SessionOp::Tune { .. } => {
                match self.queue.push_superseding(tune, SessionOp::is_tune) {
                    Some(dropped) => {
                        if dropped > 0 {
                            debug!(peer = %self.peer.id(), dropped, "Superseded pending tune");
                        }
                        true
                    }
                    None => false,
                }
            }
            other => self.queue.push(other),
        };

        if !accepted {
            debug!(peer = %self.peer.id(), op = name, "Ignoring operation on released session");
        }
        Ok(())
    }
}

async fn run_worker(
    queue: Arc<DispatchQueue<SessionOp>>,
    session: Arc<dyn SessionImpl>,
    peer: Peer,
    provider: Peer,
    limits: LatencyLimits,
    released: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            op = queue.pop() => op,
            _ = peer.lost() => None,
        };
        let Some(op) = next else {
            break;
        };

        let name = op.name();
        let is_release = op.is_release();
        let ceiling = if op.is_tune() {
            limits.tune_ceiling
        } else {
            limits.op_ceiling
        };

        let started = Instant::now();
        if tokio::time::timeout(ceiling, execute(session.as_ref(), op))
            .await
            .is_err()
        {
            let err = DispatchError::Stalled {
                op: name,
                limit_ms: u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX),
            };
            error!(
                peer = %peer.id(),
                provider = %provider.label(),
                error = %err,
                "Session worker stalled, killing provider"
            );
            queue.close_and_clear();
            provider.kill();
            return;
        }

        let elapsed = started.elapsed();
        if elapsed > limits.warn_after {
            warn!(
                peer = %peer.id(),
                op = name,
                elapsed_ms = millis(elapsed),
                "Slow session operation"
            );
        }

        if is_release {
            released.cancel();
            let dropped = queue.close_and_clear();
            debug!(peer = %peer.id(), dropped, "Session released");
            break;
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

async fn run_input_receiver(
    mut channel: InputChannelServer,
    session: Arc<dyn SessionImpl>,
    peer: Peer,
    released: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            next = channel.recv() => next,
            _ = peer.lost() => None,
        };
        let Some((seq, event)) = next else {
            break;
        };

        let finisher = channel.finisher(seq);
        if released.is_cancelled() {
            finisher.finish(false);
            continue;
        }

        match session.on_input_event(&event, finisher.clone()) {
            InputDispatch::Handled => {
                finisher.finish(true);
            }
            InputDispatch::NotHandled => {
                finisher.finish(false);
            }
            InputDispatch::InProgress => {}
        }
    }
    debug!(channel = channel.name(), "Input receiver stopped");
}
