//! Input registry: building, diffing and notifying.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, info, warn};

use tvim_core::{CallerIdentity, ComponentName, InputDescriptor, InputId, InputState, UserId};

use super::actor::BrokerActor;
use super::commands::{BrokerError, HardwareEvent, InputNotification};
use super::state::{InputRecord, ServiceState};

impl BrokerActor {
    // ========================================================================
    // Queries
    // ========================================================================

    pub(super) fn handle_get_input_list(
        &self,
        caller: &CallerIdentity,
        user: UserId,
    ) -> Result<Vec<InputDescriptor>, BrokerError> {
        let user = self.resolve_calling_user(caller, user)?;
        Ok(self
            .users
            .get(&user)
            .map(|s| s.inputs.values().map(|r| r.descriptor.clone()).collect())
            .unwrap_or_default())
    }

    pub(super) fn handle_get_input_info(
        &self,
        caller: &CallerIdentity,
        user: UserId,
        input_id: &InputId,
    ) -> Result<Option<InputDescriptor>, BrokerError> {
        let user = self.resolve_calling_user(caller, user)?;
        Ok(self
            .users
            .get(&user)
            .and_then(|s| s.inputs.get(input_id))
            .map(|r| r.descriptor.clone()))
    }

    /// Unknown inputs report `Connected`.
    pub(super) fn handle_get_input_state(
        &self,
        caller: &CallerIdentity,
        user: UserId,
        input_id: &InputId,
    ) -> Result<InputState, BrokerError> {
        let user = self.resolve_calling_user(caller, user)?;
        Ok(self
            .users
            .get(&user)
            .and_then(|s| s.inputs.get(input_id))
            .map(|r| r.state)
            .unwrap_or(InputState::Connected))
    }

    // ========================================================================
    // Rebuild
    // ========================================================================

    /// Re-reads the directory for `user` and notifies the differences.
    ///
    /// Inputs of packages listed in `changed` that are still present are
    /// reported as updated. Stored input states survive the rebuild.
    pub(crate) fn rebuild_input_list(&mut self, user: UserId, changed: Option<&[String]>) {
        let providers = self.directory.enumerate_providers(user);
        let mut inputs: BTreeMap<InputId, InputDescriptor> = BTreeMap::new();
        let mut packages = BTreeSet::new();
        let mut hardware_components = BTreeSet::new();
        let mut first_seen = Vec::new();

        for entry in providers {
            if !entry.requires_bind_permission() {
                warn!(
                    component = %entry.component,
                    permission = ?entry.permission,
                    "Skipping provider without the bind permission"
                );
                continue;
            }

            if entry.is_hardware {
                hardware_components.insert(entry.component.clone());
                let state = self.user_state_mut(user);
                let service = state
                    .services
                    .entry(entry.component.clone())
                    .or_insert_with(|| {
                        first_seen.push(entry.component.clone());
                        ServiceState::new(entry.component.clone(), true)
                    });
                service.is_hardware = true;
                for input in &service.hardware_inputs {
                    inputs.insert(input.id.clone(), input.clone());
                }
            } else {
                match self.directory.load_descriptor(&entry) {
                    Ok(input) => {
                        inputs.insert(input.id.clone(), input);
                    }
                    Err(e) => {
                        error!(component = %entry.component, error = %e, "Failed to load input");
                        continue;
                    }
                }
            }
            packages.insert(entry.component.package.clone());
        }

        // New hardware providers bind as soon as they are discovered
        for component in first_seen {
            self.update_service_connection(user, &component);
        }

        let state = self.user_state_mut(user);
        state.hardware_components = hardware_components;
        state.packages = packages;

        let added: Vec<InputId> = inputs
            .keys()
            .filter(|id| !state.inputs.contains_key(*id))
            .cloned()
            .collect();
        let updated: Vec<(InputId, ComponentName)> = match changed {
            Some(changed) => inputs
                .iter()
                .filter(|(id, _)| state.inputs.contains_key(*id))
                .filter(|(_, input)| changed.iter().any(|p| p == &input.component.package))
                .map(|(id, input)| (id.clone(), input.component.clone()))
                .collect(),
            None => Vec::new(),
        };
        let removed: Vec<(InputId, ComponentName)> = state
            .inputs
            .iter()
            .filter(|(id, _)| !inputs.contains_key(*id))
            .map(|(id, record)| (id.clone(), record.descriptor.component.clone()))
            .collect();

        let records: BTreeMap<InputId, InputRecord> = inputs
            .into_iter()
            .map(|(id, descriptor)| {
                let input_state = state
                    .inputs
                    .get(&id)
                    .map(|r| r.state)
                    .unwrap_or_default();
                (
                    id,
                    InputRecord {
                        descriptor,
                        state: input_state,
                    },
                )
            })
            .collect();
        state.inputs = records;

        debug!(
            user = %user,
            inputs = state.inputs.len(),
            added = added.len(),
            updated = updated.len(),
            removed = removed.len(),
            "Input list rebuilt"
        );

        for input_id in added {
            info!(input_id = %input_id, user = %user, "Input added");
            self.notify(user, InputNotification::Added(input_id));
        }
        for (input_id, component) in updated {
            // The package changed under a bound provider
            self.update_service_connection(user, &component);
            info!(input_id = %input_id, user = %user, "Input updated");
            self.notify(user, InputNotification::Updated(input_id));
        }
        for (input_id, component) in removed {
            let has_service = self
                .users
                .get(&user)
                .is_some_and(|s| s.services.contains_key(&component));
            if has_service {
                self.abort_pending_create_session_requests(user, &component, Some(&input_id));
            }
            info!(input_id = %input_id, user = %user, "Input removed");
            self.notify(user, InputNotification::Removed(input_id));
        }
    }

    // ========================================================================
    // Input state
    // ========================================================================

    /// Stores a new connectivity state and notifies a change.
    ///
    /// Notifications are held back while the owning provider should be
    /// connected but isn't; they are replayed on reconnection.
    pub(super) fn set_input_state(&mut self, user: UserId, input_id: &InputId, new_state: InputState) {
        let Some(state) = self.users.get_mut(&user) else {
            return;
        };
        let Some(record) = state.inputs.get_mut(input_id) else {
            debug!(input_id = %input_id, "State change for unknown input ignored");
            return;
        };
        let old_state = record.state;
        record.state = new_state;

        let held_back = state
            .services
            .get(&record.descriptor.component)
            .is_some_and(|s| {
                s.service.is_none() && (!s.session_tokens.is_empty() || s.is_hardware)
            });
        if held_back {
            return;
        }
        if old_state != new_state {
            self.notify_input_state_changed(user, input_id, new_state);
        }
    }

    pub(super) fn notify_input_state_changed(
        &self,
        user: UserId,
        input_id: &InputId,
        state: InputState,
    ) {
        debug!(input_id = %input_id, state = state.label(), "Input state changed");
        self.notify(
            user,
            InputNotification::StateChanged {
                input_id: input_id.clone(),
                state,
            },
        );
    }

    fn notify(&self, user: UserId, notification: InputNotification) {
        let Some(state) = self.users.get(&user) else {
            return;
        };
        for callback in state.callbacks.values() {
            callback.callback.notify(notification.clone());
        }
    }

    // ========================================================================
    // Hardware inputs
    // ========================================================================

    /// A hardware provider reported an input for a device or HDMI device.
    pub(super) fn handle_hardware_input_added(
        &mut self,
        user: UserId,
        component: &ComponentName,
        device_id: Option<u32>,
        hdmi_device_id: Option<u32>,
        input: InputDescriptor,
    ) {
        if &input.component != component {
            warn!(
                component = %component,
                input_component = %input.component,
                "Provider reported an input it does not own"
            );
            return;
        }
        let is_hardware_provider = self
            .users
            .get(&user)
            .and_then(|s| s.services.get(component))
            .is_some_and(|s| s.is_hardware);
        if !is_hardware_provider {
            warn!(component = %component, "Input report from a non-hardware provider ignored");
            return;
        }

        match (device_id, hdmi_device_id) {
            (Some(device_id), _) => self.hardware.add_hardware_input(device_id, &input),
            (None, Some(hdmi_device_id)) => self.hardware.add_hdmi_input(hdmi_device_id, &input),
            (None, None) => {}
        }

        if let Some(service) = self
            .users
            .get_mut(&user)
            .and_then(|s| s.services.get_mut(component))
        {
            service.hardware_inputs.retain(|i| i.id != input.id);
            service.hardware_inputs.push(input);
        }
        self.rebuild_input_list(user, None);
    }

    pub(super) fn handle_provider_input_removed(
        &mut self,
        user: UserId,
        component: &ComponentName,
        input_id: &InputId,
    ) {
        let removed = self
            .users
            .get_mut(&user)
            .and_then(|s| s.services.get_mut(component))
            .is_some_and(|service| {
                let before = service.hardware_inputs.len();
                service.hardware_inputs.retain(|i| &i.id != input_id);
                service.hardware_inputs.len() != before
            });
        if removed {
            self.rebuild_input_list(user, None);
            self.hardware.remove_input(input_id);
        } else {
            warn!(component = %component, input_id = %input_id, "Removal of unknown hardware input");
        }
    }

    /// Hardware-manager reports apply to the active user.
    pub(super) fn handle_hardware_event(&mut self, event: HardwareEvent) {
        let user = self.current_user;
        match event {
            HardwareEvent::StateChanged { input_id, state } => {
                self.set_input_state(user, &input_id, state);
            }
            HardwareEvent::HdmiDeviceUpdated { input_id, device } => {
                if let Some(state) = device.power_status.to_input_state() {
                    self.set_input_state(user, &input_id, state);
                }
            }
            other => {
                let Some(state) = self.users.get(&user) else {
                    return;
                };
                for service in state.services.values().filter(|s| s.is_hardware) {
                    let Some(remote) = &service.service else {
                        continue;
                    };
                    let result = match &other {
                        HardwareEvent::DeviceAdded(hw) => remote.notify_hardware_added(hw),
                        HardwareEvent::DeviceRemoved(hw) => remote.notify_hardware_removed(hw),
                        HardwareEvent::HdmiDeviceAdded(dev) => remote.notify_hdmi_device_added(dev),
                        HardwareEvent::HdmiDeviceRemoved(dev) => {
                            remote.notify_hdmi_device_removed(dev)
                        }
                        HardwareEvent::StateChanged { .. }
                        | HardwareEvent::HdmiDeviceUpdated { .. } => Ok(()),
                    };
                    if let Err(e) = result {
                        error!(component = %service.component, error = %e, "Error forwarding hardware event");
                    }
                }
            }
        }
    }
}
