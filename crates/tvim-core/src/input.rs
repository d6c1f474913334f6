//! Input descriptors: the identity of everything a session can be opened on.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DomainError, DomainResult};
use crate::hardware::{HardwareInfo, HdmiDeviceInfo};

// ============================================================================
// Component Name
// ============================================================================

/// A provider component: the package that ships it plus its class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentName {
    pub package: String,
    pub class: String,
}

impl ComponentName {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }

    /// Short form: `pkg/.Class` when the class lives inside the package
    /// namespace, `pkg/other.Class` otherwise.
    pub fn to_short_string(&self) -> String {
        match self.class.strip_prefix(self.package.as_str()) {
            Some(rest) if rest.starts_with('.') => format!("{}/{}", self.package, rest),
            _ => format!("{}/{}", self.package, self.class),
        }
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.class)
    }
}

// ============================================================================
// Input Id
// ============================================================================

/// Unique string id of an input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputId(String);

impl InputId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of an input declared in a provider's manifest.
    pub fn for_component(component: &ComponentName) -> Self {
        Self(component.to_short_string())
    }

    /// Id of an input a hardware provider reports for a device.
    pub fn for_hardware(component: &ComponentName, hardware: &HardwareInfo) -> Self {
        Self(format!(
            "{}/HW{}",
            component.to_short_string(),
            hardware.device_id
        ))
    }

    /// Id of an input a hardware provider reports for an HDMI-CEC device.
    pub fn for_hdmi_device(component: &ComponentName, device: &HdmiDeviceInfo) -> Self {
        Self(format!(
            "{}/HDMI{:02X}{:02X}",
            component.to_short_string(),
            device.port_id,
            device.logical_address
        ))
    }
}

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InputId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InputId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for InputId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Input Type & State
// ============================================================================

/// Declared type of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    Tuner,
    Other,
    Composite,
    SVideo,
    Scart,
    Component,
    Vga,
    Dvi,
    Hdmi,
    DisplayPort,
}

impl InputType {
    /// Numeric code used on the provider wire.
    pub fn code(&self) -> u32 {
        match self {
            Self::Tuner => 0,
            Self::Other => 1000,
            Self::Composite => 1001,
            Self::SVideo => 1002,
            Self::Scart => 1003,
            Self::Component => 1004,
            Self::Vga => 1005,
            Self::Dvi => 1006,
            Self::Hdmi => 1007,
            Self::DisplayPort => 1008,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Tuner),
            1000 => Some(Self::Other),
            1001 => Some(Self::Composite),
            1002 => Some(Self::SVideo),
            1003 => Some(Self::Scart),
            1004 => Some(Self::Component),
            1005 => Some(Self::Vga),
            1006 => Some(Self::Dvi),
            1007 => Some(Self::Hdmi),
            1008 => Some(Self::DisplayPort),
            _ => None,
        }
    }
}

/// Connectivity state of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputState {
    #[default]
    Connected,
    ConnectedStandby,
    Disconnected,
}

impl InputState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::ConnectedStandby => "standby",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for InputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ============================================================================
// Input Descriptor
// ============================================================================

/// Identity and capabilities of one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub id: InputId,
    pub component: ComponentName,
    pub input_type: InputType,
    /// Set for inputs exposed by a provider that owns hardware devices.
    #[serde(default)]
    pub is_hardware: bool,
    /// Physical input this logical input sits behind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<InputId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdmi_device_id: Option<u32>,
}

impl InputDescriptor {
    pub fn new(id: impl Into<InputId>, component: ComponentName, input_type: InputType) -> Self {
        Self {
            id: id.into(),
            component,
            input_type,
            is_hardware: false,
            parent_id: None,
            setup_activity: None,
            label: None,
            hdmi_device_id: None,
        }
    }

    #[must_use]
    pub fn with_hardware(mut self, is_hardware: bool) -> Self {
        self.is_hardware = is_hardware;
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<InputId>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    #[must_use]
    pub fn with_setup_activity(mut self, activity: impl Into<String>) -> Self {
        self.setup_activity = Some(activity.into());
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_hdmi_device(mut self, device_id: u32) -> Self {
        self.hdmi_device_id = Some(device_id);
        self
    }

    /// Pass-through inputs (HDMI, composite, ...) have no channel lineup.
    pub fn is_passthrough(&self) -> bool {
        self.input_type != InputType::Tuner
    }

    /// Checks the metadata a tuner input must carry.
    ///
    /// A tuner input needs a setup activity to populate its channels.
    pub fn validate(&self) -> DomainResult<()> {
        if self.id.as_str().is_empty() {
            return Err(DomainError::InvalidFieldValue {
                field: "id".to_string(),
                value: String::new(),
                expected: "non-empty input id".to_string(),
            });
        }
        if self.input_type == InputType::Tuner && self.setup_activity.is_none() {
            return Err(DomainError::InvalidFieldValue {
                field: "setup_activity".to_string(),
                value: "none".to_string(),
                expected: format!("setup activity for tuner input {}", self.id),
            });
        }
        Ok(())
    }
}
