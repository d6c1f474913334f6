//! Hardware pass-through device descriptions.

use serde::{Deserialize, Serialize};

use crate::input::{InputState, InputType};

/// A hardware input device known to the hardware manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub device_id: u32,
    pub input_type: InputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdmi_port_id: Option<u32>,
}

impl HardwareInfo {
    pub fn new(device_id: u32, input_type: InputType) -> Self {
        Self {
            device_id,
            input_type,
            hdmi_port_id: None,
        }
    }

    #[must_use]
    pub fn with_hdmi_port(mut self, port: u32) -> Self {
        self.hdmi_port_id = Some(port);
        self
    }
}

/// Power status reported by an HDMI-CEC device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdmiPowerStatus {
    On,
    Standby,
    TransientToOn,
    TransientToStandby,
    #[default]
    Unknown,
}

impl HdmiPowerStatus {
    /// Input state implied by this power status, if any.
    pub fn to_input_state(self) -> Option<InputState> {
        match self {
            Self::On => Some(InputState::Connected),
            Self::Standby | Self::TransientToOn | Self::TransientToStandby => {
                Some(InputState::ConnectedStandby)
            }
            Self::Unknown => None,
        }
    }
}

/// An HDMI-CEC device behind a hardware port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdmiDeviceInfo {
    pub id: u32,
    pub port_id: u32,
    pub logical_address: u32,
    #[serde(default)]
    pub power_status: HdmiPowerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl HdmiDeviceInfo {
    pub fn new(id: u32, port_id: u32, logical_address: u32) -> Self {
        Self {
            id,
            port_id,
            logical_address,
            power_status: HdmiPowerStatus::Unknown,
            display_name: None,
        }
    }

    #[must_use]
    pub fn with_power_status(mut self, status: HdmiPowerStatus) -> Self {
        self.power_status = status;
        self
    }
}

/// A stream configuration offered by a hardware input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub stream_id: u32,
    pub generation: u32,
    pub max_width: u32,
    pub max_height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_status_mapping() {
        assert_eq!(HdmiPowerStatus::On.to_input_state(), Some(InputState::Connected));
        assert_eq!(
            HdmiPowerStatus::Standby.to_input_state(),
            Some(InputState::ConnectedStandby)
        );
        assert_eq!(
            HdmiPowerStatus::TransientToOn.to_input_state(),
            Some(InputState::ConnectedStandby)
        );
        assert_eq!(HdmiPowerStatus::Unknown.to_input_state(), None);
    }
}
