//! RedfishClient trait for mocking
//!
//! Abstracts the BMC client so production HTTPS clients and test mocks are
//! interchangeable. All async methods must be `Send` to work with Tokio's
//! work-stealing runtime.

use crate::error::RedfishError;
use crate::models::{PowerAction, PowerState, SystemInfo};

/// The Redfish capability surface the controllers consume.
#[async_trait::async_trait]
pub trait RedfishClientTrait: Send + Sync {
    /// BMC base address this client talks to.
    fn address(&self) -> &str;

    /// Retrieve manufacturer, model, serial, power state and boot options.
    async fn get_system_info(&self) -> Result<SystemInfo, RedfishError>;

    /// Current chassis power state.
    async fn get_power_state(&self) -> Result<PowerState, RedfishError>;

    /// Request a power action. The call returns once the BMC accepts the
    /// action; reaching the target state is verified by the caller.
    async fn set_power_state(&self, action: PowerAction) -> Result<(), RedfishError>;

    /// Insert the ISO at `image_url` into the first optical virtual-media
    /// slot.
    async fn insert_virtual_media(&self, image_url: &str) -> Result<(), RedfishError>;

    /// Eject whatever is in the optical virtual-media slot. Must be a
    /// no-op when nothing is inserted.
    async fn eject_virtual_media(&self) -> Result<(), RedfishError>;

    /// One-time boot from the inserted virtual media.
    async fn set_boot_source_iso(&self) -> Result<(), RedfishError>;

    /// One-time boot with kernel arguments passed via the UEFI target
    /// override.
    async fn set_uefi_boot_target(&self, kernel_args: &[String]) -> Result<(), RedfishError>;

    /// Read a BIOS attribute; `AttributeUnsupported` when absent.
    async fn get_bios_attribute(&self, name: &str) -> Result<serde_json::Value, RedfishError>;

    /// Stage a BIOS attribute write (applied by the firmware on next boot);
    /// `AttributeUnsupported` when the vendor does not expose it.
    async fn set_bios_attribute(
        &self,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), RedfishError>;
}
