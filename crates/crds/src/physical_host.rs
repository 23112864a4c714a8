//! PhysicalHost CRD
//!
//! Represents one physical server manageable over Redfish. The PhysicalHost
//! reconciler drives enrollment and hardware heartbeats; the claim
//! coordinator owns `consumerRef`, `bootIsoSource` and the claim
//! annotations.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::references::{ConsumerRef, SecretRef};

/// Annotation holding the RFC3339 claim timestamp, written atomically with
/// `consumerRef`.
pub const ANNOTATION_CLAIMED_AT: &str = "beskar7.io/claimed-at";

/// Annotation holding the claiming machine's name, written atomically with
/// `consumerRef`.
pub const ANNOTATION_CLAIMED_BY: &str = "beskar7.io/claimed-by";

/// Annotation overriding the vendor boot-parameter mechanism.
/// Accepted values: `bios-attribute`, `uefi-target`, `unsupported`.
pub const ANNOTATION_BOOT_PARAM_MECHANISM: &str =
    "beskar7.infrastructure.cluster.x-k8s.io/boot-parameter-mechanism";

/// Annotation naming the BIOS attribute used for kernel arguments when the
/// mechanism is `bios-attribute`.
pub const ANNOTATION_BIOS_KERNEL_ARG_ATTRIBUTE: &str =
    "beskar7.infrastructure.cluster.x-k8s.io/bios-kernel-arg-attribute";

/// Well-known zone label read by Beskar7Cluster to derive failure domains.
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";

/// Finalizer placed on PhysicalHosts so deletion runs deprovisioning first.
pub const PHYSICAL_HOST_FINALIZER: &str = "physicalhost.infrastructure.cluster.x-k8s.io";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "PhysicalHost",
    namespaced,
    status = "PhysicalHostStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Consumer","type":"string","jsonPath":".spec.consumerRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalHostSpec {
    /// How to reach the host's BMC
    pub redfish_connection: RedfishConnection,

    /// The Beskar7Machine that currently owns this host; set atomically by
    /// the claim coordinator, cleared on release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_ref: Option<ConsumerRef>,

    /// URL of the ISO this host should boot; only ever set while claimed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_iso_source: Option<String>,

    /// Secret holding user data for the provisioned OS.
    ///
    /// Accepted and validated, but not yet wired into OS-specific
    /// provisioning (cloud-init / Ignition / Combustion); the injection
    /// path is a future extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret_ref: Option<SecretRef>,
}

/// Connection details for a Redfish BMC.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RedfishConnection {
    /// Base URL of the BMC, e.g. "https://10.0.0.5"
    pub address: String,

    /// Secret (same namespace) with `username` and `password` keys
    pub credentials_secret_ref: String,

    /// Skip TLS certificate verification when talking to the BMC
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Lifecycle state of a PhysicalHost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default, Hash)]
pub enum HostState {
    /// Not yet seen by the reconciler
    #[default]
    None,

    /// Connection probe and hardware inventory in progress
    Enrolling,

    /// Healthy, unclaimed, ready to be selected by the coordinator
    Available,

    /// Owned by a machine, boot configuration not yet requested
    Claimed,

    /// Boot configuration and power-on in progress
    Provisioning,

    /// Boot configured and powered on for its consumer
    Provisioned,

    /// Deletion requested; media ejected and power handled before removal
    Deprovisioning,

    /// A fatal or exhausted-retry failure; see `errorMessage`
    Error,

    /// State could not be determined
    Unknown,
}

impl HostState {
    /// States in which a host may carry a `consumerRef`.
    pub fn allows_consumer(self) -> bool {
        matches!(
            self,
            HostState::Claimed | HostState::Provisioning | HostState::Provisioned
        )
    }

    /// States counted as ready when hardware details are populated.
    pub fn is_ready_state(self) -> bool {
        matches!(
            self,
            HostState::Available
                | HostState::Claimed
                | HostState::Provisioning
                | HostState::Provisioned
        )
    }
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Hardware inventory retrieved from the BMC during enrollment and
/// refreshed on the heartbeat interval.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HardwareDetails {
    /// System manufacturer as reported by Redfish
    pub manufacturer: String,

    /// System model
    pub model: String,

    /// Chassis serial number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    /// Rolled-up health, e.g. "OK", "Warning", "Critical"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,

    /// Total CPU core count, used for hardware-requirement matching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,

    /// Total memory in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_gib: Option<u64>,

    /// Total local disk in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_gib: Option<u64>,
}

/// A network address of the host, Cluster API style.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    /// Address type: "Hostname", "InternalIP" or "ExternalIP"
    #[serde(rename = "type")]
    pub address_type: String,

    /// The address value
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalHostStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub state: HostState,

    /// True when the host is in a ready state and hardware details are
    /// populated
    #[serde(default)]
    pub ready: bool,

    /// Power state last observed on the BMC ("On", "Off", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_power_state: Option<String>,

    /// Populated when `state` is Error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Hardware inventory from the BMC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_details: Option<HardwareDetails>,

    /// Known addresses of the host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Observed conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When `state` last changed; drives stuck-state detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_changed_at: Option<DateTime<Utc>>,

    /// How many stuck-state recoveries have been attempted in the current
    /// state; reset on every legal transition
    #[serde(default, skip_serializing_if = "is_zero")]
    pub recovery_attempts: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl PhysicalHost {
    /// The host identifier used for deterministic candidate ordering.
    pub fn host_id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// Current state, `HostState::None` when status is unset.
    pub fn state(&self) -> HostState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Whether the host is claimable: Available and without a consumer.
    pub fn is_available(&self) -> bool {
        self.state() == HostState::Available && self.spec.consumer_ref.is_none()
    }
}
