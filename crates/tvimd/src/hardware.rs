//! Hardware manager - arbitrates pass-through devices.
//!
//! The broker treats the hardware manager as an opaque collaborator: it
//! forwards the inputs hardware providers report, hands out leases on
//! devices, and relays device hot-plug events to hardware providers
//! through a [`HardwareListener`].
//!
//! [`InMemoryHardwareManager`] keeps the device tables in memory and
//! exposes `plug_*` / `unplug_*` methods to simulate hot-plug.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tvim_core::{
    HardwareInfo, HdmiDeviceInfo, InputDescriptor, InputId, InputState, StreamConfig,
    SurfaceHandle, Uid, UserId,
};

/// Holder-side notifications about an acquired device.
pub trait HardwareCallback: Send + Sync {
    /// The lease was taken over by another caller or the device vanished.
    fn on_released(&self);

    fn on_stream_config_changed(&self, configs: &[StreamConfig]);
}

/// Broker-side notifications from the hardware manager.
pub trait HardwareListener: Send + Sync {
    fn on_state_changed(&self, input_id: &InputId, state: InputState);

    fn on_hardware_device_added(&self, hardware: &HardwareInfo);

    fn on_hardware_device_removed(&self, hardware: &HardwareInfo);

    fn on_hdmi_device_added(&self, device: &HdmiDeviceInfo);

    fn on_hdmi_device_removed(&self, device: &HdmiDeviceInfo);

    /// An HDMI device behind a known input changed (e.g. power status).
    fn on_hdmi_device_updated(&self, input_id: &InputId, device: &HdmiDeviceInfo);
}

/// Proof of an acquired device, returned by [`HardwareManager::acquire_hardware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareLease {
    pub device_id: u32,
    lease_id: u64,
}

pub trait HardwareManager: Send + Sync {
    fn set_listener(&self, listener: Arc<dyn HardwareListener>);

    fn hardware_list(&self) -> Vec<HardwareInfo>;

    fn hdmi_device_list(&self) -> Vec<HdmiDeviceInfo>;

    /// Associates an input reported by a hardware provider with a device.
    fn add_hardware_input(&self, device_id: u32, input: &InputDescriptor);

    fn add_hdmi_input(&self, hdmi_device_id: u32, input: &InputDescriptor);

    fn remove_input(&self, input_id: &InputId);

    /// Leases `device_id`, preempting any other holder.
    fn acquire_hardware(
        &self,
        device_id: u32,
        callback: Arc<dyn HardwareCallback>,
        input: &InputDescriptor,
        uid: Uid,
        user: UserId,
    ) -> Option<HardwareLease>;

    fn release_hardware(&self, lease: HardwareLease, uid: Uid, user: UserId);

    fn available_stream_configs(&self, input_id: &InputId, uid: Uid, user: UserId)
        -> Vec<StreamConfig>;

    /// Captures one frame of `input_id` into `surface`.
    fn capture_frame(
        &self,
        input_id: &InputId,
        surface: SurfaceHandle,
        config: &StreamConfig,
        uid: Uid,
        user: UserId,
    ) -> bool;
}

// ============================================================================
// In-memory implementation
// ============================================================================

struct Lease {
    lease_id: u64,
    uid: Uid,
    input_id: InputId,
    callback: Arc<dyn HardwareCallback>,
}

#[derive(Default)]
struct Devices {
    hardware: BTreeMap<u32, HardwareInfo>,
    stream_configs: BTreeMap<u32, Vec<StreamConfig>>,
    hdmi: BTreeMap<u32, HdmiDeviceInfo>,
    /// Input id → hardware device id.
    hardware_inputs: BTreeMap<InputId, u32>,
    /// Input id → HDMI device id.
    hdmi_inputs: BTreeMap<InputId, u32>,
    leases: BTreeMap<u32, Lease>,
}

impl Devices {
    fn device_for_input(&self, input_id: &InputId) -> Option<u32> {
        if let Some(device_id) = self.hardware_inputs.get(input_id) {
            return Some(*device_id);
        }
        // An HDMI input streams through the hardware on its port
        let hdmi_id = self.hdmi_inputs.get(input_id)?;
        let port = self.hdmi.get(hdmi_id)?.port_id;
        self.hardware
            .values()
            .find(|hw| hw.hdmi_port_id == Some(port))
            .map(|hw| hw.device_id)
    }
}

/// Hardware manager holding its device tables in memory.
#[derive(Default)]
pub struct InMemoryHardwareManager {
    devices: Mutex<Devices>,
    listener: Mutex<Option<Arc<dyn HardwareListener>>>,
    next_lease: AtomicU64,
}

impl InMemoryHardwareManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn listener(&self) -> Option<Arc<dyn HardwareListener>> {
        self.listener.lock().clone()
    }

    /// Hot-plugs a hardware device.
    pub fn plug_hardware(&self, hardware: HardwareInfo, configs: Vec<StreamConfig>) {
        {
            let mut devices = self.devices.lock();
            devices.stream_configs.insert(hardware.device_id, configs);
            devices.hardware.insert(hardware.device_id, hardware.clone());
        }
        info!(device_id = hardware.device_id, "Hardware device added");
        if let Some(listener) = self.listener() {
            listener.on_hardware_device_added(&hardware);
        }
    }

    /// Removes a hardware device and revokes its lease.
    pub fn unplug_hardware(&self, device_id: u32) {
        let (hardware, lease) = {
            let mut devices = self.devices.lock();
            devices.stream_configs.remove(&device_id);
            devices.hardware_inputs.retain(|_, id| *id != device_id);
            (
                devices.hardware.remove(&device_id),
                devices.leases.remove(&device_id),
            )
        };
        if let Some(lease) = lease {
            lease.callback.on_released();
        }
        if let Some(hardware) = hardware {
            info!(device_id, "Hardware device removed");
            if let Some(listener) = self.listener() {
                listener.on_hardware_device_removed(&hardware);
            }
        }
    }

    pub fn plug_hdmi(&self, device: HdmiDeviceInfo) {
        self.devices.lock().hdmi.insert(device.id, device.clone());
        info!(hdmi_device_id = device.id, port = device.port_id, "HDMI device added");
        if let Some(listener) = self.listener() {
            listener.on_hdmi_device_added(&device);
        }
    }

    pub fn unplug_hdmi(&self, hdmi_device_id: u32) {
        let device = {
            let mut devices = self.devices.lock();
            devices.hdmi_inputs.retain(|_, id| *id != hdmi_device_id);
            devices.hdmi.remove(&hdmi_device_id)
        };
        if let Some(device) = device {
            info!(hdmi_device_id, "HDMI device removed");
            if let Some(listener) = self.listener() {
                listener.on_hdmi_device_removed(&device);
            }
        }
    }

    /// Replaces an HDMI device's info and reports it for its input.
    pub fn update_hdmi(&self, device: HdmiDeviceInfo) {
        let input_id = {
            let mut devices = self.devices.lock();
            devices.hdmi.insert(device.id, device.clone());
            devices
                .hdmi_inputs
                .iter()
                .find(|(_, id)| **id == device.id)
                .map(|(input_id, _)| input_id.clone())
        };
        match (input_id, self.listener()) {
            (Some(input_id), Some(listener)) => {
                listener.on_hdmi_device_updated(&input_id, &device);
            }
            (None, _) => debug!(hdmi_device_id = device.id, "HDMI update without an input"),
            _ => {}
        }
    }

    /// Reports a cable/signal change on a hardware device.
    pub fn set_hardware_state(&self, device_id: u32, state: InputState) {
        let inputs: Vec<InputId> = self
            .devices
            .lock()
            .hardware_inputs
            .iter()
            .filter(|(_, id)| **id == device_id)
            .map(|(input_id, _)| input_id.clone())
            .collect();
        if let Some(listener) = self.listener() {
            for input_id in &inputs {
                listener.on_state_changed(input_id, state);
            }
        }
    }

    /// Replaces a device's stream configs and tells its holder.
    pub fn set_stream_configs(&self, device_id: u32, configs: Vec<StreamConfig>) {
        let holder = {
            let mut devices = self.devices.lock();
            devices.stream_configs.insert(device_id, configs.clone());
            devices.leases.get(&device_id).map(|l| l.callback.clone())
        };
        if let Some(callback) = holder {
            callback.on_stream_config_changed(&configs);
        }
    }
}

impl HardwareManager for InMemoryHardwareManager {
    fn set_listener(&self, listener: Arc<dyn HardwareListener>) {
        *self.listener.lock() = Some(listener);
    }

    fn hardware_list(&self) -> Vec<HardwareInfo> {
        self.devices.lock().hardware.values().cloned().collect()
    }

    fn hdmi_device_list(&self) -> Vec<HdmiDeviceInfo> {
        self.devices.lock().hdmi.values().cloned().collect()
    }

    fn add_hardware_input(&self, device_id: u32, input: &InputDescriptor) {
        let mut devices = self.devices.lock();
        if !devices.hardware.contains_key(&device_id) {
            warn!(device_id, input_id = %input.id, "Input reported for unknown hardware");
            return;
        }
        devices.hardware_inputs.insert(input.id.clone(), device_id);
    }

    fn add_hdmi_input(&self, hdmi_device_id: u32, input: &InputDescriptor) {
        let mut devices = self.devices.lock();
        if !devices.hdmi.contains_key(&hdmi_device_id) {
            warn!(hdmi_device_id, input_id = %input.id, "Input reported for unknown HDMI device");
            return;
        }
        devices.hdmi_inputs.insert(input.id.clone(), hdmi_device_id);
    }

    fn remove_input(&self, input_id: &InputId) {
        let mut devices = self.devices.lock();
        devices.hardware_inputs.remove(input_id);
        devices.hdmi_inputs.remove(input_id);
    }

    fn acquire_hardware(
        &self,
        device_id: u32,
        callback: Arc<dyn HardwareCallback>,
        input: &InputDescriptor,
        uid: Uid,
        _user: UserId,
    ) -> Option<HardwareLease> {
        let lease_id = self.next_lease.fetch_add(1, Ordering::Relaxed) + 1;
        let preempted = {
            let mut devices = self.devices.lock();
            if !devices.hardware.contains_key(&device_id) {
                debug!(device_id, "Acquire of unknown hardware");
                return None;
            }
            devices.leases.insert(
                device_id,
                Lease {
                    lease_id,
                    uid,
                    input_id: input.id.clone(),
                    callback: callback.clone(),
                },
            )
        };

        if let Some(previous) = preempted {
            if !Arc::ptr_eq(&previous.callback, &callback) {
                info!(device_id, previous_uid = %previous.uid, %uid, "Hardware lease preempted");
                previous.callback.on_released();
            }
        }
        Some(HardwareLease {
            device_id,
            lease_id,
        })
    }

    fn release_hardware(&self, lease: HardwareLease, uid: Uid, _user: UserId) {
        let mut devices = self.devices.lock();
        let matches = devices
            .leases
            .get(&lease.device_id)
            .is_some_and(|held| held.lease_id == lease.lease_id && held.uid == uid);
        if matches {
            devices.leases.remove(&lease.device_id);
            debug!(device_id = lease.device_id, "Hardware released");
        } else {
            debug!(device_id = lease.device_id, "Stale hardware release ignored");
        }
    }

    fn available_stream_configs(
        &self,
        input_id: &InputId,
        _uid: Uid,
        _user: UserId,
    ) -> Vec<StreamConfig> {
        let devices = self.devices.lock();
        devices
            .device_for_input(input_id)
            .and_then(|device_id| devices.stream_configs.get(&device_id).cloned())
            .unwrap_or_default()
    }

    fn capture_frame(
        &self,
        input_id: &InputId,
        surface: SurfaceHandle,
        config: &StreamConfig,
        uid: Uid,
        _user: UserId,
    ) -> bool {
        let devices = self.devices.lock();
        let Some(device_id) = devices.device_for_input(input_id) else {
            return false;
        };
        let held_by_caller = devices
            .leases
            .get(&device_id)
            .is_some_and(|lease| lease.uid == uid && lease.input_id == *input_id);
        let known_config = devices
            .stream_configs
            .get(&device_id)
            .is_some_and(|configs| configs.contains(config));
        let captured = held_by_caller && known_config;
        debug!(input_id = %input_id, surface = surface.as_u64(), captured, "Capture frame");
        captured
    }
}
