//! Beskar7Machine CRD
//!
//! A node request: asks the provider for one physical node, provisioned
//! from the given image.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::physical_host::MachineAddress;

/// Finalizer placed on Beskar7Machines so deletion releases the owned host
/// before the resource is removed.
pub const BESKAR7_MACHINE_FINALIZER: &str = "beskar7machine.infrastructure.cluster.x-k8s.io";

/// OS families accepted when no override is configured.
pub const DEFAULT_OS_FAMILIES: &[&str] = &["kairos", "flatcar", "LeapMicro"];

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Beskar7Machine",
    namespaced,
    status = "Beskar7MachineStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct Beskar7MachineSpec {
    /// URL of the installer image (ISO)
    #[serde(rename = "imageURL")]
    pub image_url: String,

    /// OS family of the image, e.g. "kairos", "flatcar", "LeapMicro".
    /// The accepted set is controller configuration, not schema.
    pub os_family: String,

    /// How the node is provisioned
    pub provisioning_mode: ProvisioningMode,

    /// URL of the remote configuration, required when `provisioningMode`
    /// is RemoteConfig
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "configURL")]
    pub config_url: Option<String>,

    /// Provider ID, set by the controller after provisioning; stable once
    /// the machine is ready
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "providerID")]
    pub provider_id: Option<String>,

    /// Minimum hardware the backing host must offer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_requirements: Option<HardwareRequirements>,
}

/// Provisioning modes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ProvisioningMode {
    /// Generic ISO plus kernel-argument injection pointing at `configURL`
    RemoteConfig,

    /// Fully pre-configured ISO, no kernel-argument injection
    #[serde(rename = "PreBakedISO")]
    PreBakedIso,

    /// Network boot (accepted by the API, not yet implemented)
    #[serde(rename = "PXE")]
    Pxe,

    /// iPXE network boot (accepted by the API, not yet implemented)
    #[serde(rename = "iPXE")]
    IPxe,
}

/// Minimum hardware a claimed host must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HardwareRequirements {
    /// Minimum CPU core count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cores: Option<u32>,

    /// Minimum memory in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_memory_gib: Option<u64>,

    /// Minimum local disk in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_disk_gib: Option<u64>,
}

impl HardwareRequirements {
    /// Whether any minimum is actually set.
    pub fn is_empty(&self) -> bool {
        self.min_cores.is_none() && self.min_memory_gib.is_none() && self.min_disk_gib.is_none()
    }
}

/// Machine lifecycle phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum MachinePhase {
    /// Waiting for a host to be claimed
    #[default]
    Pending,

    /// Host claimed, boot configuration in flight
    Provisioning,

    /// Backing host is provisioned; providerID is set
    Provisioned,

    /// Terminal failure; see failureReason/failureMessage
    Failed,

    /// Deletion in progress, host being released
    Deleting,
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Beskar7MachineStatus {
    /// Current phase
    #[serde(default)]
    pub phase: MachinePhase,

    /// True once the backing host is provisioned
    #[serde(default)]
    pub ready: bool,

    /// Terminal failure reason, from the fixed reason enumeration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Terminal failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Addresses copied from the backing host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Observed conditions, including PhysicalHostAssociated and
    /// InfrastructureReady
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Beskar7Machine {
    /// Namespace/name identity used in consumer refs and claim hashing.
    pub fn machine_id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// Whether the machine has already failed terminally.
    pub fn has_failed(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.failure_reason.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&ProvisioningMode::PreBakedIso).unwrap(),
            "\"PreBakedISO\""
        );
        assert_eq!(serde_json::to_string(&ProvisioningMode::IPxe).unwrap(), "\"iPXE\"");
        assert_eq!(
            serde_json::from_str::<ProvisioningMode>("\"RemoteConfig\"").unwrap(),
            ProvisioningMode::RemoteConfig
        );
    }

    #[test]
    fn hardware_requirements_empty() {
        assert!(HardwareRequirements::default().is_empty());
        let req = HardwareRequirements {
            min_cores: Some(4),
            ..Default::default()
        };
        assert!(!req.is_empty());
    }
}
