//! Input-event channel between a client session and a provider session.
//!
//! Events travel client → provider on their own channel, separate from
//! the dispatch queue. Every event is acknowledged exactly once with a
//! handled flag. A provider may answer [`InputDispatch::InProgress`] and
//! finish the event later through its [`InputEventFinisher`]. Only the
//! first `finish` of an event is delivered.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::RemoteError;

/// A remote-control or touch event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputEvent {
    Key { key_code: u32, down: bool },
    Motion { action: u32, x: f32, y: f32 },
}

/// Immediate answer of a provider to an input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDispatch {
    Handled,
    NotHandled,
    /// The provider will call [`InputEventFinisher::finish`] later.
    InProgress,
}

/// Creates a connected channel pair.
pub fn input_channel_pair(name: impl Into<Arc<str>>) -> (InputChannelClient, InputChannelServer) {
    let name = name.into();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (finished_tx, finished_rx) = mpsc::unbounded_channel();
    (
        InputChannelClient {
            name: name.clone(),
            events: events_tx,
            finished: finished_rx,
        },
        InputChannelServer {
            name,
            events: events_rx,
            finished: finished_tx,
        },
    )
}

/// Client end: sends events, receives acknowledgements.
pub struct InputChannelClient {
    name: Arc<str>,
    events: mpsc::UnboundedSender<(u64, InputEvent)>,
    finished: mpsc::UnboundedReceiver<(u64, bool)>,
}

impl InputChannelClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, seq: u64, event: InputEvent) -> Result<(), RemoteError> {
        self.events
            .send((seq, event))
            .map_err(|_| RemoteError::PeerDead)
    }

    /// Next `(seq, handled)` acknowledgement. `None` once the provider
    /// end is gone.
    pub async fn recv_finished(&mut self) -> Option<(u64, bool)> {
        self.finished.recv().await
    }
}

impl fmt::Debug for InputChannelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputChannelClient")
            .field("name", &self.name)
            .finish()
    }
}

/// Provider end: receives events, acknowledges them.
pub struct InputChannelServer {
    name: Arc<str>,
    events: mpsc::UnboundedReceiver<(u64, InputEvent)>,
    finished: mpsc::UnboundedSender<(u64, bool)>,
}

impl InputChannelServer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn recv(&mut self) -> Option<(u64, InputEvent)> {
        self.events.recv().await
    }

    pub fn finisher(&self, seq: u64) -> InputEventFinisher {
        InputEventFinisher {
            seq,
            sender: Arc::new(Mutex::new(Some(self.finished.clone()))),
        }
    }
}

impl fmt::Debug for InputChannelServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputChannelServer")
            .field("name", &self.name)
            .finish()
    }
}

/// Acknowledges one event. Clones share the same once-only slot.
#[derive(Clone)]
pub struct InputEventFinisher {
    seq: u64,
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<(u64, bool)>>>>,
}

impl InputEventFinisher {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns false if the event was already finished.
    pub fn finish(&self, handled: bool) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };
        // Client may already have released its session
        let _ = sender.send((self.seq, handled));
        true
    }

    pub fn is_finished(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl fmt::Debug for InputEventFinisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputEventFinisher")
            .field("seq", &self.seq)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> InputEvent {
        InputEvent::Key {
            key_code: 19,
            down: true,
        }
    }

    #[tokio::test]
    async fn test_event_round_trip_through_channel() {
        let (mut client, mut server) = input_channel_pair("s1");
        client.send(1, key()).unwrap();

        let (seq, event) = server.recv().await.unwrap();
        assert_eq!(seq, 1);
        assert_eq!(event, key());

        server.finisher(seq).finish(true);
        assert_eq!(client.recv_finished().await, Some((1, true)));
    }

    #[tokio::test]
    async fn test_finish_is_sent_once() {
        let (mut client, server) = input_channel_pair("s1");
        let finisher = server.finisher(2);
        let kept = finisher.clone();
        assert!(finisher.finish(true));
        assert!(!kept.finish(false));
        assert!(kept.is_finished());
        drop(server);
        drop(finisher);
        drop(kept);
        assert_eq!(client.recv_finished().await, Some((2, true)));
        assert_eq!(client.recv_finished().await, None);
    }

    #[tokio::test]
    async fn test_send_after_server_dropped_fails() {
        let (client, server) = input_channel_pair("s1");
        drop(server);
        assert_eq!(client.send(1, key()), Err(RemoteError::PeerDead));
    }
}
