//! Test utilities for unit testing reconcilers and the coordinator
//!
//! Fixture builders for CRD objects; the in-memory host store lives in
//! `host_store::mem`.

#[cfg(test)]
use crds::*;
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Helper to create a PhysicalHost in a given state with default hardware.
#[cfg(test)]
pub fn host_in_state(namespace: &str, name: &str, state: HostState) -> PhysicalHost {
    PhysicalHost {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: PhysicalHostSpec {
            redfish_connection: RedfishConnection {
                address: format!("https://bmc-{name}"),
                credentials_secret_ref: format!("{name}-credentials"),
                insecure_skip_verify: false,
            },
            consumer_ref: None,
            boot_iso_source: None,
            user_data_secret_ref: None,
        },
        status: Some(PhysicalHostStatus {
            state,
            ready: state.is_ready_state(),
            hardware_details: Some(HardwareDetails {
                manufacturer: "Dell Inc.".to_string(),
                model: "PowerEdge R650".to_string(),
                serial_number: Some(format!("SN-{name}")),
                health: Some("OK".to_string()),
                cpu_cores: Some(32),
                memory_gib: Some(256),
                disk_gib: Some(1000),
            }),
            state_changed_at: Some(chrono::Utc::now()),
            ..Default::default()
        }),
    }
}

/// Helper to create an Available, unclaimed PhysicalHost.
#[cfg(test)]
pub fn available_host(namespace: &str, name: &str) -> PhysicalHost {
    host_in_state(namespace, name, HostState::Available)
}

/// Helper to create an Available host with specific capacity.
#[cfg(test)]
pub fn available_host_with_capacity(
    namespace: &str,
    name: &str,
    cores: u32,
    memory_gib: u64,
    disk_gib: u64,
) -> PhysicalHost {
    let mut host = available_host(namespace, name);
    if let Some(status) = host.status.as_mut() {
        if let Some(details) = status.hardware_details.as_mut() {
            details.cpu_cores = Some(cores);
            details.memory_gib = Some(memory_gib);
            details.disk_gib = Some(disk_gib);
        }
    }
    host
}

/// Helper to create a claimed host owned by the given machine.
#[cfg(test)]
pub fn claimed_host(namespace: &str, name: &str, machine: &str) -> PhysicalHost {
    let mut host = host_in_state(namespace, name, HostState::Claimed);
    host.spec.consumer_ref = Some(ConsumerRef::machine(namespace, machine));
    let annotations = host.metadata.annotations.get_or_insert_default();
    annotations.insert(
        ANNOTATION_CLAIMED_AT.to_string(),
        chrono::Utc::now().to_rfc3339(),
    );
    annotations.insert(ANNOTATION_CLAIMED_BY.to_string(), machine.to_string());
    host
}

/// Helper to create a test Beskar7Machine.
#[cfg(test)]
pub fn test_machine(
    namespace: &str,
    name: &str,
    mode: ProvisioningMode,
    os_family: &str,
) -> Beskar7Machine {
    Beskar7Machine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Beskar7MachineSpec {
            image_url: "https://images.example/installer.iso".to_string(),
            os_family: os_family.to_string(),
            provisioning_mode: mode,
            config_url: matches!(mode, ProvisioningMode::RemoteConfig)
                .then(|| "https://config.example/node.yaml".to_string()),
            provider_id: None,
            hardware_requirements: None,
        },
        status: None,
    }
}
