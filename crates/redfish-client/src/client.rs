//! Redfish HTTPS client
//!
//! Implements the capability contract against a standard Redfish service:
//! `/redfish/v1/Systems` for power/boot/BIOS, the owning Manager's
//! `VirtualMedia` collection for media operations.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::RedfishError;
use crate::models::{
    BiosAttributes, Collection, ComputerSystem, PowerAction, PowerState, SystemInfo,
    VirtualMediaSlot,
};
use crate::redfish_trait::RedfishClientTrait;

const SYSTEMS_COLLECTION: &str = "/redfish/v1/Systems";
const MANAGERS_COLLECTION: &str = "/redfish/v1/Managers";

/// Redfish client backed by reqwest.
pub struct RedfishClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    // Discovered on first use; BMCs never change these at runtime.
    system_uri: OnceCell<String>,
    manager_uri: OnceCell<String>,
}

impl std::fmt::Debug for RedfishClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedfishClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl RedfishClient {
    /// Create a new Redfish client.
    ///
    /// # Arguments
    /// * `base_url` - BMC base URL (e.g. "https://10.0.0.5")
    /// * `username` / `password` - from the host's credentials secret
    /// * `timeout` - per-call deadline
    /// * `insecure_skip_verify` - accept the BMC's self-signed certificate
    pub fn new(
        base_url: String,
        username: String,
        password: String,
        timeout: Duration,
        insecure_skip_verify: bool,
    ) -> Result<Self, RedfishError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure_skip_verify)
            .build()
            .map_err(RedfishError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
            system_uri: OnceCell::new(),
            manager_uri: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: for<'de> serde::Deserialize<'de>>(
        &self,
        path: &str,
    ) -> Result<T, RedfishError> {
        debug!("GET {}", path);
        let response = self
            .client
            .get(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RedfishError::Authentication(format!("{status} on {path}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RedfishError::Api(format!("{status} on {path}: {body}")));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(RedfishError::Serialization)
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: serde_json::Value,
    ) -> Result<StatusCode, RedfishError> {
        debug!("{} {}", method, path);
        let response = self
            .client
            .request(method, self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RedfishError::Authentication(format!("{status} on {path}")));
        }
        Ok(status)
    }

    /// First member of the Systems collection. Single-system BMCs are the
    /// only deployment target today.
    async fn system_uri(&self) -> Result<&str, RedfishError> {
        self.system_uri
            .get_or_try_init(|| async {
                let collection: Collection = self.get_json(SYSTEMS_COLLECTION).await?;
                collection
                    .members
                    .into_iter()
                    .next()
                    .map(|m| m.odata_id)
                    .ok_or_else(|| RedfishError::Api("Systems collection is empty".to_string()))
            })
            .await
            .map(String::as_str)
    }

    async fn manager_uri(&self) -> Result<&str, RedfishError> {
        self.manager_uri
            .get_or_try_init(|| async {
                let collection: Collection = self.get_json(MANAGERS_COLLECTION).await?;
                collection
                    .members
                    .into_iter()
                    .next()
                    .map(|m| m.odata_id)
                    .ok_or_else(|| RedfishError::Api("Managers collection is empty".to_string()))
            })
            .await
            .map(String::as_str)
    }

    /// The first optical virtual-media slot of the first manager.
    async fn optical_media_slot(&self) -> Result<VirtualMediaSlot, RedfishError> {
        let manager = self.manager_uri().await?;
        let collection: Collection = self
            .get_json(&format!("{manager}/VirtualMedia"))
            .await?;

        for member in collection.members {
            let slot: VirtualMediaSlot = self.get_json(&member.odata_id).await?;
            if slot.is_optical() {
                return Ok(slot);
            }
        }
        Err(RedfishError::BootSourceUnavailable(
            "no optical virtual-media slot found".to_string(),
        ))
    }

    async fn fetch_system(&self) -> Result<ComputerSystem, RedfishError> {
        let uri = self.system_uri().await?.to_string();
        self.get_json(&uri).await
    }
}

#[async_trait::async_trait]
impl RedfishClientTrait for RedfishClient {
    fn address(&self) -> &str {
        &self.base_url
    }

    async fn get_system_info(&self) -> Result<SystemInfo, RedfishError> {
        let system = self.fetch_system().await?;
        let processor = system.processor_summary.unwrap_or_default();
        Ok(SystemInfo {
            manufacturer: system.manufacturer.unwrap_or_default(),
            model: system.model.unwrap_or_default(),
            serial_number: system.serial_number,
            power_state: system.power_state.unwrap_or_default(),
            boot_options: system.boot.map(|b| b.allowable_values).unwrap_or_default(),
            health: system.status.and_then(|s| s.health),
            cpu_cores: processor.core_count.or(processor.logical_processor_count),
            memory_gib: system
                .memory_summary
                .and_then(|m| m.total_system_memory_gib)
                .map(|gib| gib.round() as u64),
            disk_gib: None,
        })
    }

    async fn get_power_state(&self) -> Result<PowerState, RedfishError> {
        let system = self.fetch_system().await?;
        Ok(system.power_state.unwrap_or_default())
    }

    async fn set_power_state(&self, action: PowerAction) -> Result<(), RedfishError> {
        let uri = format!(
            "{}/Actions/ComputerSystem.Reset",
            self.system_uri().await?
        );
        let status = self
            .send_json(
                reqwest::Method::POST,
                &uri,
                json!({ "ResetType": action.reset_type() }),
            )
            .await?;

        if status.is_success() {
            Ok(())
        } else {
            Err(RedfishError::Api(format!(
                "reset {} rejected with {status}",
                action.reset_type()
            )))
        }
    }

    async fn insert_virtual_media(&self, image_url: &str) -> Result<(), RedfishError> {
        let slot = self.optical_media_slot().await?;

        if slot.inserted == Some(true) {
            if slot.image.as_deref() == Some(image_url) {
                debug!("virtual media already inserted: {}", image_url);
                return Ok(());
            }
            return Err(RedfishError::VirtualMediaBusy(format!(
                "slot {} holds {:?}",
                slot.odata_id, slot.image
            )));
        }

        let uri = format!("{}/Actions/VirtualMedia.InsertMedia", slot.odata_id);
        let status = self
            .send_json(
                reqwest::Method::POST,
                &uri,
                json!({ "Image": image_url, "Inserted": true, "WriteProtected": true }),
            )
            .await?;

        match status {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(RedfishError::VirtualMediaBusy(format!(
                "insert rejected on {}",
                slot.odata_id
            ))),
            s => Err(RedfishError::Api(format!("insert media failed: {s}"))),
        }
    }

    async fn eject_virtual_media(&self) -> Result<(), RedfishError> {
        let slot = self.optical_media_slot().await?;
        if slot.inserted != Some(true) {
            return Ok(());
        }

        let uri = format!("{}/Actions/VirtualMedia.EjectMedia", slot.odata_id);
        let status = self
            .send_json(reqwest::Method::POST, &uri, json!({}))
            .await?;

        match status {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(RedfishError::VirtualMediaBusy(format!(
                "eject rejected on {}",
                slot.odata_id
            ))),
            s => Err(RedfishError::Api(format!("eject media failed: {s}"))),
        }
    }

    async fn set_boot_source_iso(&self) -> Result<(), RedfishError> {
        let system = self.fetch_system().await?;
        if let Some(boot) = &system.boot {
            if !boot.allowable_values.is_empty()
                && !boot.allowable_values.iter().any(|v| v == "Cd")
            {
                return Err(RedfishError::BootSourceUnavailable(
                    "Cd not in allowable boot targets".to_string(),
                ));
            }
        }

        let uri = self.system_uri().await?.to_string();
        let status = self
            .send_json(
                reqwest::Method::PATCH,
                &uri,
                json!({
                    "Boot": {
                        "BootSourceOverrideEnabled": "Once",
                        "BootSourceOverrideTarget": "Cd"
                    }
                }),
            )
            .await?;

        if status.is_success() {
            Ok(())
        } else {
            Err(RedfishError::Api(format!("boot override rejected: {status}")))
        }
    }

    async fn set_uefi_boot_target(&self, kernel_args: &[String]) -> Result<(), RedfishError> {
        let system = self.fetch_system().await?;
        if let Some(boot) = &system.boot {
            if !boot.allowable_values.is_empty()
                && !boot.allowable_values.iter().any(|v| v == "UefiTarget")
            {
                return Err(RedfishError::BootSourceUnavailable(
                    "UefiTarget not in allowable boot targets".to_string(),
                ));
            }
        }

        let uri = self.system_uri().await?.to_string();
        let status = self
            .send_json(
                reqwest::Method::PATCH,
                &uri,
                json!({
                    "Boot": {
                        "BootSourceOverrideEnabled": "Once",
                        "BootSourceOverrideTarget": "UefiTarget",
                        "UefiTargetBootSourceOverride": kernel_args.join(" ")
                    }
                }),
            )
            .await?;

        if status.is_success() {
            Ok(())
        } else {
            Err(RedfishError::Api(format!(
                "UEFI target override rejected: {status}"
            )))
        }
    }

    async fn get_bios_attribute(&self, name: &str) -> Result<serde_json::Value, RedfishError> {
        let uri = format!("{}/Bios", self.system_uri().await?);
        let bios: BiosAttributes = self.get_json(&uri).await?;
        bios.attributes
            .get(name)
            .cloned()
            .ok_or_else(|| RedfishError::AttributeUnsupported(name.to_string()))
    }

    async fn set_bios_attribute(
        &self,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), RedfishError> {
        // Read first: a missing attribute means the vendor does not expose
        // the mechanism at all, which the caller treats as a strategy
        // fallback rather than a retry.
        self.get_bios_attribute(name).await?;

        let uri = format!("{}/Bios/Settings", self.system_uri().await?);
        let status = self
            .send_json(
                reqwest::Method::PATCH,
                &uri,
                json!({ "Attributes": { name: value } }),
            )
            .await?;

        match status {
            s if s.is_success() => Ok(()),
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                Err(RedfishError::AttributeUnsupported(name.to_string()))
            }
            s => Err(RedfishError::Api(format!("BIOS settings patch rejected: {s}"))),
        }
    }
}
