//! Redfish BMC Client
//!
//! The narrow Redfish capability surface the Beskar7 controllers consume:
//! power control, boot-source override, virtual media, system inventory and
//! BIOS attributes. All calls go through [`RedfishClientTrait`] so the
//! reqwest-backed [`RedfishClient`] and the in-memory mock are
//! interchangeable.
//!
//! # Example
//!
//! ```no_run
//! use redfish_client::{RedfishClient, RedfishClientTrait, PowerAction};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RedfishClient::new(
//!     "https://10.0.0.5".to_string(),
//!     "admin".to_string(),
//!     "secret".to_string(),
//!     Duration::from_secs(30),
//!     false,
//! )?;
//!
//! let info = client.get_system_info().await?;
//! println!("{} {}", info.manufacturer, info.model);
//!
//! client.insert_virtual_media("https://images.example/node.iso").await?;
//! client.set_boot_source_iso().await?;
//! client.set_power_state(PowerAction::On).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod redfish_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::RedfishClient;
pub use error::RedfishError;
pub use models::*;
pub use redfish_trait::RedfishClientTrait;
#[cfg(feature = "test-util")]
pub use mock::{MockRedfishClient, RecordedCall};
