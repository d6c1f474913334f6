//! Serves providers whose manifest names the `loopback` runtime.
//!
//! Binding starts an in-process [`LoopbackProvider`] and reports it
//! connected from a separate task, the way a real bind completes later.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tvim_core::{ComponentName, UserId};
use tvim_provider::{LoopbackProvider, ProviderService};

use crate::broker::{ConnectionReporter, ProviderConnector};
use crate::directory::Directory;

/// Runtime name served in-process.
pub const LOOPBACK_RUNTIME: &str = "loopback";

/// [`ProviderConnector`] backed by in-process loopback providers.
pub struct LoopbackConnector {
    directory: Arc<dyn Directory>,
    running: Mutex<HashMap<(UserId, ComponentName), Arc<LoopbackProvider>>>,
}

impl LoopbackConnector {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// The provider currently bound for `user`, if any.
    pub fn provider(&self, component: &ComponentName, user: UserId) -> Option<Arc<LoopbackProvider>> {
        self.running
            .lock()
            .get(&(user, component.clone()))
            .cloned()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }
}

impl ProviderConnector for LoopbackConnector {
    fn bind(&self, component: &ComponentName, user: UserId, reporter: ConnectionReporter) -> bool {
        let entry = self
            .directory
            .enumerate_providers(user)
            .into_iter()
            .find(|entry| &entry.component == component);
        let Some(entry) = entry else {
            warn!(component = %component, user = %user, "Bind for unknown provider");
            return false;
        };
        if entry.runtime != LOOPBACK_RUNTIME {
            warn!(
                component = %component,
                runtime = %entry.runtime,
                "No runtime available for provider"
            );
            return false;
        }

        let provider = Arc::new(LoopbackProvider::new(component.clone()));
        let previous = self
            .running
            .lock()
            .insert((user, component.clone()), Arc::clone(&provider));
        if let Some(previous) = previous {
            // A rebind replaces the old process
            previous.peer().kill();
        }

        info!(component = %component, user = %user, "Starting loopback provider");
        tokio::spawn(async move {
            reporter.connected(provider);
        });
        true
    }

    fn unbind(&self, component: &ComponentName, user: UserId) {
        let removed = self.running.lock().remove(&(user, component.clone()));
        match removed {
            Some(provider) => {
                debug!(component = %component, user = %user, "Stopping loopback provider");
                provider.peer().kill();
            }
            None => debug!(component = %component, user = %user, "Unbind of idle provider"),
        }
    }
}
