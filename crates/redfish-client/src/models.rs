//! Redfish data models
//!
//! The controller-facing types plus the wire structs the HTTP client
//! deserializes Redfish payloads into.

use serde::{Deserialize, Serialize};

/// Observed chassis power state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PowerState {
    On,
    Off,
    PoweringOn,
    PoweringOff,
    #[serde(other)]
    #[default]
    Unknown,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Power actions the controllers may request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
    Reset,
}

impl PowerAction {
    /// The Redfish `ResetType` for this action.
    pub fn reset_type(self) -> &'static str {
        match self {
            PowerAction::On => "On",
            PowerAction::Off => "ForceOff",
            PowerAction::Reset => "ForceRestart",
        }
    }

    /// The power state this action should settle into, when deterministic.
    pub fn target_state(self) -> Option<PowerState> {
        match self {
            PowerAction::On | PowerAction::Reset => Some(PowerState::On),
            PowerAction::Off => Some(PowerState::Off),
        }
    }
}

/// System inventory the controllers consume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SystemInfo {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub power_state: PowerState,
    /// Allowable boot-source override targets, e.g. "Cd", "UefiTarget"
    pub boot_options: Vec<String>,
    /// Rolled-up health: "OK", "Warning", "Critical"
    pub health: Option<String>,
    pub cpu_cores: Option<u32>,
    pub memory_gib: Option<u64>,
    pub disk_gib: Option<u64>,
}

// Wire structs. Field names follow the Redfish schema, so serde renames are
// explicit throughout.

#[derive(Debug, Clone, Deserialize)]
pub struct ODataRef {
    #[serde(rename = "@odata.id")]
    pub odata_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Collection {
    #[serde(rename = "Members", default)]
    pub members: Vec<ODataRef>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResourceStatus {
    #[serde(rename = "Health")]
    pub health: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProcessorSummary {
    #[serde(rename = "CoreCount")]
    pub core_count: Option<u32>,
    #[serde(rename = "LogicalProcessorCount")]
    pub logical_processor_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemorySummary {
    #[serde(rename = "TotalSystemMemoryGiB")]
    pub total_system_memory_gib: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BootSettings {
    #[serde(rename = "BootSourceOverrideTarget")]
    pub boot_source_override_target: Option<String>,
    #[serde(rename = "BootSourceOverrideTarget@Redfish.AllowableValues", default)]
    pub allowable_values: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputerSystem {
    #[serde(rename = "Manufacturer", default)]
    pub manufacturer: Option<String>,
    #[serde(rename = "Model", default)]
    pub model: Option<String>,
    #[serde(rename = "SerialNumber", default)]
    pub serial_number: Option<String>,
    #[serde(rename = "PowerState", default)]
    pub power_state: Option<PowerState>,
    #[serde(rename = "Status", default)]
    pub status: Option<ResourceStatus>,
    #[serde(rename = "ProcessorSummary", default)]
    pub processor_summary: Option<ProcessorSummary>,
    #[serde(rename = "MemorySummary", default)]
    pub memory_summary: Option<MemorySummary>,
    #[serde(rename = "Boot", default)]
    pub boot: Option<BootSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMediaSlot {
    #[serde(rename = "@odata.id")]
    pub odata_id: String,
    #[serde(rename = "MediaTypes", default)]
    pub media_types: Vec<String>,
    #[serde(rename = "Inserted", default)]
    pub inserted: Option<bool>,
    #[serde(rename = "Image", default)]
    pub image: Option<String>,
}

impl VirtualMediaSlot {
    /// Whether this slot accepts optical media.
    pub fn is_optical(&self) -> bool {
        self.media_types.iter().any(|t| t == "CD" || t == "DVD")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BiosAttributes {
    #[serde(rename = "Attributes", default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}
