//! Watch-log recorder.
//!
//! The broker reports tunes and releases here without waiting. A single
//! recorder task drains the queue and appends records to the active
//! user's log. Records of one session share the session-token key.
//!
//! A start that is still queued when a newer start for the same session
//! arrives is dropped: the superseded tune never reached the provider.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use tvim_core::{SessionToken, TuneParams, UserId};
use tvim_provider::DispatchQueue;

#[derive(Debug, Error)]
pub enum WatchLogError {
    #[error("watch log I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed watch log record: {0}")]
    Format(#[from] serde_json::Error),
}

/// One persisted watch-log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum WatchRecord {
    Start {
        session_token: String,
        package: String,
        watch_start_time_ms: i64,
        channel_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tune_params: Option<String>,
    },
    End {
        session_token: String,
        watch_end_time_ms: i64,
    },
}

impl WatchRecord {
    pub fn start(
        token: SessionToken,
        package: impl Into<String>,
        start_ms: i64,
        channel_id: i64,
        params: &TuneParams,
    ) -> Self {
        Self::Start {
            session_token: token.to_string(),
            package: package.into(),
            watch_start_time_ms: start_ms,
            channel_id,
            tune_params: (!params.is_empty()).then(|| params.encode()),
        }
    }

    pub fn end(token: SessionToken, end_ms: i64) -> Self {
        Self::End {
            session_token: token.to_string(),
            watch_end_time_ms: end_ms,
        }
    }

    pub fn session_token(&self) -> &str {
        match self {
            Self::Start { session_token, .. } | Self::End { session_token, .. } => session_token,
        }
    }

    fn is_start(&self) -> bool {
        matches!(self, Self::Start { .. })
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Append-only per-user record storage.
pub trait WatchLogStore: Send + Sync {
    fn append(&self, user: UserId, record: &WatchRecord) -> Result<(), WatchLogError>;

    fn records(&self, user: UserId) -> Result<Vec<WatchRecord>, WatchLogError>;
}

/// One JSON-lines file per user.
pub struct JsonlWatchLog {
    dir: PathBuf,
}

impl JsonlWatchLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, user: UserId) -> PathBuf {
        self.dir.join(format!("watch-log-{user}.jsonl"))
    }
}

impl WatchLogStore for JsonlWatchLog {
    fn append(&self, user: UserId, record: &WatchRecord) -> Result<(), WatchLogError> {
        let path = self.path_for(user);
        let io_err = |source| WatchLogError::Io {
            path: path.clone(),
            source,
        };
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)
    }

    fn records(&self, user: UserId) -> Result<Vec<WatchRecord>, WatchLogError> {
        let path = self.path_for(user);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(WatchLogError::Io { path, source }),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(WatchLogError::from))
            .collect()
    }
}

/// Watch log kept in memory.
#[derive(Default)]
pub struct MemoryWatchLog {
    users: Mutex<HashMap<UserId, Vec<WatchRecord>>>,
}

impl MemoryWatchLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatchLogStore for MemoryWatchLog {
    fn append(&self, user: UserId, record: &WatchRecord) -> Result<(), WatchLogError> {
        self.users
            .lock()
            .entry(user)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn records(&self, user: UserId) -> Result<Vec<WatchRecord>, WatchLogError> {
        Ok(self.users.lock().get(&user).cloned().unwrap_or_default())
    }
}

// ============================================================================
// Recorder
// ============================================================================

enum RecorderMessage {
    Record(WatchRecord),
    SwitchUser(UserId),
    Flush(oneshot::Sender<()>),
}

/// Sender side of the recorder task. Cheap to clone.
#[derive(Clone)]
pub struct WatchLogHandle {
    queue: Arc<DispatchQueue<RecorderMessage>>,
}

impl WatchLogHandle {
    /// Starts the recorder task writing to `user`'s log.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<dyn WatchLogStore>, user: UserId) -> Self {
        let queue = Arc::new(DispatchQueue::new());
        tokio::spawn(run_recorder(queue.clone(), store, user));
        Self { queue }
    }

    pub fn log_start(&self, record: WatchRecord) {
        let token = record.session_token().to_string();
        let dropped = self.queue.push_superseding(RecorderMessage::Record(record), |queued| {
            matches!(queued, RecorderMessage::Record(r) if r.is_start() && r.session_token() == token)
        });
        if let Some(dropped) = dropped.filter(|n| *n > 0) {
            debug!(session = %token, dropped, "Superseded queued watch start");
        }
    }

    pub fn log_end(&self, record: WatchRecord) {
        self.queue.push(RecorderMessage::Record(record));
    }

    /// Later records go to `user`'s log.
    pub fn switch_user(&self, user: UserId) {
        self.queue.push(RecorderMessage::SwitchUser(user));
    }

    /// Resolves once every record queued before the call is written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.queue.push(RecorderMessage::Flush(tx)) {
            let _ = rx.await;
        }
    }

    /// Stops the recorder after draining queued records.
    pub fn close(&self) {
        self.queue.close();
    }
}

async fn run_recorder(
    queue: Arc<DispatchQueue<RecorderMessage>>,
    store: Arc<dyn WatchLogStore>,
    mut user: UserId,
) {
    info!(user = %user, "Watch-log recorder started");
    while let Some(message) = queue.pop().await {
        match message {
            RecorderMessage::Record(record) => {
                if let Err(e) = store.append(user, &record) {
                    error!(user = %user, error = %e, "Failed to append watch record");
                }
            }
            RecorderMessage::SwitchUser(next) => {
                debug!(from = %user, to = %next, "Watch-log recorder switching user");
                user = next;
            }
            RecorderMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Watch-log recorder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_encoding() {
        let params = TuneParams::new().with("lang", "en,fr").with("mode", "a=b");
        let record = WatchRecord::start(SessionToken::new(7), "com.tuner", 1000, 42, &params);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["record"], "start");
        assert_eq!(json["session_token"], "session-7");
        assert_eq!(json["channel_id"], 42);
        assert_eq!(json["tune_params"], "lang=en%,fr, mode=a%=b");

        let no_params = WatchRecord::start(SessionToken::new(7), "p", 1, 2, &TuneParams::new());
        assert!(serde_json::to_value(&no_params).unwrap().get("tune_params").is_none());
    }

    #[tokio::test]
    async fn test_queued_start_is_superseded() {
        let store = Arc::new(MemoryWatchLog::new());
        let log = WatchLogHandle::spawn(store.clone(), UserId::SYSTEM);
        let token = SessionToken::new(1);

        // Nothing runs between these calls on a current-thread runtime
        log.log_start(WatchRecord::start(token, "p", 1, 42, &TuneParams::new()));
        log.log_start(WatchRecord::start(SessionToken::new(2), "p", 1, 5, &TuneParams::new()));
        log.log_start(WatchRecord::start(token, "p", 2, 7, &TuneParams::new()));
        log.flush().await;

        let records = store.records(UserId::SYSTEM).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], WatchRecord::Start { channel_id: 5, .. }));
        assert!(matches!(&records[1], WatchRecord::Start { channel_id: 7, .. }));
    }

    #[tokio::test]
    async fn test_switch_user_routes_records() {
        let store = Arc::new(MemoryWatchLog::new());
        let log = WatchLogHandle::spawn(store.clone(), UserId::SYSTEM);
        log.log_end(WatchRecord::end(SessionToken::new(1), 10));
        log.switch_user(UserId::new(10));
        log.log_end(WatchRecord::end(SessionToken::new(2), 20));
        log.flush().await;

        assert_eq!(store.records(UserId::SYSTEM).unwrap().len(), 1);
        assert_eq!(
            store.records(UserId::new(10)).unwrap(),
            vec![WatchRecord::end(SessionToken::new(2), 20)]
        );
    }

    #[test]
    fn test_jsonl_roundtrip_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = JsonlWatchLog::new(dir.path());
        let user = UserId::new(10);
        store
            .append(user, &WatchRecord::start(SessionToken::new(3), "p", 5, 9, &TuneParams::new()))
            .unwrap();
        store.append(user, &WatchRecord::end(SessionToken::new(3), 8)).unwrap();

        let records = store.records(user).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].session_token(), "session-3");
        assert!(dir.path().join("watch-log-10.jsonl").exists());
        assert!(store.records(UserId::SYSTEM).unwrap().is_empty());
    }
}
