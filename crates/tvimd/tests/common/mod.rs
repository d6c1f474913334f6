//! Shared harness for broker integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use tvim_core::{
    CallerIdentity, ComponentName, InputId, InputType, SessionToken, Uid, UserId,
};
use tvim_provider::{LoopbackJournal, LoopbackProvider, Peer, ProviderService};
use tvimd::broker::{
    spawn_broker, BrokerDeps, BrokerHandle, BrokerSnapshot, ClientEvent, ClientHandle,
    ConnectionReporter, InputNotification, ProviderConnector,
};
use tvimd::directory::{Directory, InputMetadata, ProviderEntry, BIND_PERMISSION};
use tvimd::hardware::InMemoryHardwareManager;
use tvimd::settings::FileSettingsStore;
use tvimd::watch_log::{MemoryWatchLog, WatchLogHandle};

/// Upper bound for anything the broker does asynchronously.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait before concluding that nothing else arrives.
pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

// ============================================================================
// Directory
// ============================================================================

/// Directory whose providers are set by the test.
#[derive(Default)]
pub struct FixedDirectory {
    entries: Mutex<Vec<ProviderEntry>>,
}

impl FixedDirectory {
    pub fn new(entries: Vec<ProviderEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn set(&self, entries: Vec<ProviderEntry>) {
        *self.entries.lock() = entries;
    }
}

impl Directory for FixedDirectory {
    fn enumerate_providers(&self, _user: UserId) -> Vec<ProviderEntry> {
        self.entries.lock().clone()
    }
}

pub fn component(package: &str) -> ComponentName {
    ComponentName::new(package, format!("{package}.InputService"))
}

pub fn input_of(package: &str) -> InputId {
    InputId::for_component(&component(package))
}

/// A non-hardware tuner provider.
pub fn tuner_entry(package: &str) -> ProviderEntry {
    ProviderEntry {
        component: component(package),
        permission: Some(BIND_PERMISSION.to_string()),
        is_hardware: false,
        runtime: "loopback".to_string(),
        metadata: Some(InputMetadata {
            input_type: InputType::Tuner,
            setup_activity: Some(format!("{package}.Setup")),
            label: Some(package.to_string()),
            parent: None,
        }),
    }
}

/// A hardware provider; its inputs come from hardware reports.
pub fn hardware_entry(package: &str) -> ProviderEntry {
    ProviderEntry {
        component: component(package),
        permission: Some(BIND_PERMISSION.to_string()),
        is_hardware: true,
        runtime: "loopback".to_string(),
        metadata: None,
    }
}

// ============================================================================
// Connector
// ============================================================================

type Key = (UserId, ComponentName);

/// Connector that runs loopback providers and lets tests steer binding.
pub struct TestConnector {
    journal: LoopbackJournal,
    auto_connect: AtomicBool,
    fail_bind: AtomicBool,
    fail_creation: AtomicBool,
    binds: AtomicUsize,
    unbinds: AtomicUsize,
    wrapped: Mutex<HashMap<ComponentName, SessionToken>>,
    providers: Mutex<HashMap<Key, Arc<LoopbackProvider>>>,
    reporters: Mutex<HashMap<Key, ConnectionReporter>>,
}

impl TestConnector {
    pub fn new() -> Self {
        Self {
            journal: LoopbackJournal::new(),
            auto_connect: AtomicBool::new(true),
            fail_bind: AtomicBool::new(false),
            fail_creation: AtomicBool::new(false),
            binds: AtomicUsize::new(0),
            unbinds: AtomicUsize::new(0),
            wrapped: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
            reporters: Mutex::new(HashMap::new()),
        }
    }

    /// Shared by every provider this connector starts.
    pub fn journal(&self) -> &LoopbackJournal {
        &self.journal
    }

    /// When off, binds wait for [`TestConnector::connect`].
    pub fn set_auto_connect(&self, on: bool) {
        self.auto_connect.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_bind(&self, fail: bool) {
        self.fail_bind.store(fail, Ordering::SeqCst);
    }

    /// Providers started from now on refuse to create sessions.
    pub fn set_fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    /// Sessions of `package` report wrapping `token`.
    pub fn wrap_sessions(&self, package: &str, token: SessionToken) {
        let component = component(package);
        for ((_, c), provider) in self.providers.lock().iter() {
            if *c == component {
                provider.set_hardware_session(Some(token));
            }
        }
        self.wrapped.lock().insert(component, token);
    }

    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn unbinds(&self) -> usize {
        self.unbinds.load(Ordering::SeqCst)
    }

    pub fn provider(&self, package: &str, user: UserId) -> Option<Arc<LoopbackProvider>> {
        self.providers.lock().get(&(user, component(package))).cloned()
    }

    pub fn is_bound(&self, package: &str, user: UserId) -> bool {
        self.reporters.lock().contains_key(&(user, component(package)))
    }

    /// Completes a pending bind with a fresh provider.
    pub fn connect(&self, package: &str, user: UserId) -> Arc<LoopbackProvider> {
        let key = (user, component(package));
        let reporter = self
            .reporters
            .lock()
            .get(&key)
            .cloned()
            .expect("provider was never bound");
        self.start(key, &reporter)
    }

    /// Reports the connection lost without killing anything.
    pub fn disconnect(&self, package: &str, user: UserId) {
        let reporter = self
            .reporters
            .lock()
            .get(&(user, component(package)))
            .cloned()
            .expect("provider was never bound");
        reporter.disconnected();
    }

    fn start(&self, key: Key, reporter: &ConnectionReporter) -> Arc<LoopbackProvider> {
        let provider = Arc::new(
            LoopbackProvider::new(key.1.clone()).with_journal(self.journal.clone()),
        );
        provider.set_fail_creation(self.fail_creation.load(Ordering::SeqCst));
        provider.set_hardware_session(self.wrapped.lock().get(&key.1).copied());
        if let Some(previous) = self.providers.lock().insert(key, provider.clone()) {
            previous.peer().kill();
        }
        reporter.connected(provider.clone());
        provider
    }
}

impl ProviderConnector for TestConnector {
    fn bind(&self, component: &ComponentName, user: UserId, reporter: ConnectionReporter) -> bool {
        self.binds.fetch_add(1, Ordering::SeqCst);
        if self.fail_bind.load(Ordering::SeqCst) {
            return false;
        }
        let key = (user, component.clone());
        self.reporters.lock().insert(key.clone(), reporter.clone());
        if self.auto_connect.load(Ordering::SeqCst) {
            self.start(key, &reporter);
        }
        true
    }

    /// The provider winds down on its own; queued operations still run.
    fn unbind(&self, component: &ComponentName, user: UserId) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
        let key = (user, component.clone());
        self.reporters.lock().remove(&key);
        self.providers.lock().remove(&key);
    }
}

// ============================================================================
// Broker
// ============================================================================

/// A running broker with every collaborator reachable from the test.
pub struct Harness {
    pub broker: BrokerHandle,
    pub connector: Arc<TestConnector>,
    pub directory: Arc<FixedDirectory>,
    pub hardware: Arc<InMemoryHardwareManager>,
    pub watch_store: Arc<MemoryWatchLog>,
    pub watch_log: WatchLogHandle,
}

impl Harness {
    pub fn start(entries: Vec<ProviderEntry>) -> Self {
        Self::start_with(entries, Arc::new(InMemoryHardwareManager::new()))
    }

    pub fn start_with(entries: Vec<ProviderEntry>, hardware: Arc<InMemoryHardwareManager>) -> Self {
        let directory = Arc::new(FixedDirectory::new(entries));
        let connector = Arc::new(TestConnector::new());
        let watch_store = Arc::new(MemoryWatchLog::new());
        let watch_log = WatchLogHandle::spawn(watch_store.clone(), UserId::SYSTEM);

        let broker = spawn_broker(BrokerDeps {
            directory: directory.clone(),
            connector: connector.clone(),
            hardware: hardware.clone(),
            settings: Arc::new(FileSettingsStore::in_memory()),
            watch_log: watch_log.clone(),
            current_user: UserId::SYSTEM,
        });

        Self {
            broker,
            connector,
            directory,
            hardware,
            watch_store,
            watch_log,
        }
    }

    /// Creates a session on `package`'s input and waits for its outcome.
    pub async fn open_session(
        &self,
        caller: &CallerIdentity,
        client: &TestClient,
        package: &str,
        seq: u64,
    ) -> Option<SessionToken> {
        self.open_session_on(caller, client, input_of(package), seq)
            .await
    }

    pub async fn open_session_on(
        &self,
        caller: &CallerIdentity,
        client: &TestClient,
        input_id: InputId,
        seq: u64,
    ) -> Option<SessionToken> {
        let token = self
            .broker
            .create_session(
                caller.clone(),
                UserId::CURRENT,
                client.handle.clone(),
                input_id,
                seq,
            )
            .await
            .expect("create_session should succeed");
        let (created, got_seq) = client.created().await;
        assert_eq!(got_seq, seq);
        if created.is_some() {
            assert_eq!(created, token);
        }
        created
    }
}

// ============================================================================
// Clients & callers
// ============================================================================

/// A client process with its event stream.
pub struct TestClient {
    pub handle: ClientHandle,
    pub peer: Peer,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl TestClient {
    pub fn new(label: &str) -> Self {
        let peer = Peer::new(format!("client:{label}"));
        let (handle, events) = ClientHandle::new(peer.clone());
        Self {
            handle,
            peer,
            events: tokio::sync::Mutex::new(events),
        }
    }

    pub async fn next_event(&self) -> ClientEvent {
        timeout(EVENT_TIMEOUT, self.events.lock().await.recv())
            .await
            .expect("timed out waiting for a client event")
            .expect("client event channel closed")
    }

    /// None if nothing arrives within the quiet period.
    pub async fn try_next_event(&self) -> Option<ClientEvent> {
        timeout(QUIET_PERIOD, self.events.lock().await.recv())
            .await
            .ok()
            .flatten()
    }

    /// Waits for the next `SessionCreated`, skipping other events.
    pub async fn created(&self) -> (Option<SessionToken>, u64) {
        loop {
            if let ClientEvent::SessionCreated { token, seq, .. } = self.next_event().await {
                return (token, seq);
            }
        }
    }

    /// Waits for `SessionReleased` of `token`, skipping other events.
    pub async fn released(&self, token: SessionToken) {
        loop {
            if let ClientEvent::SessionReleased { token: t, .. } = self.next_event().await {
                if t == token {
                    return;
                }
            }
        }
    }
}

/// The system caller acting for the active user.
pub fn system_caller() -> CallerIdentity {
    CallerIdentity::system()
}

/// An unprivileged app of `user`.
pub fn app_caller(uid: u32, user: UserId) -> CallerIdentity {
    CallerIdentity::new(uid, Uid::new(uid), user)
}

/// Polls `check` until it holds or the event timeout elapses.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < EVENT_TIMEOUT {
        if check() {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("condition never held: {what}");
}

/// Takes snapshots until one satisfies `check`.
pub async fn snapshot_until(
    broker: &BrokerHandle,
    what: &str,
    check: impl Fn(&BrokerSnapshot) -> bool,
) -> BrokerSnapshot {
    let start = tokio::time::Instant::now();
    while start.elapsed() < EVENT_TIMEOUT {
        let snapshot = broker.snapshot().await.expect("broker stopped");
        if check(&snapshot) {
            return snapshot;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("snapshot never matched: {what}");
}

/// Receives the next registry notification.
pub async fn next_notification(
    rx: &mut mpsc::UnboundedReceiver<InputNotification>,
) -> InputNotification {
    timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a notification")
        .expect("notification channel closed")
}
