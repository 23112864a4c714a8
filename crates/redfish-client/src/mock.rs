//! Mock RedfishClient for unit testing
//!
//! In-memory implementation of [`RedfishClientTrait`] usable without a BMC.
//! The mock keeps a scriptable power/media/BIOS state, records every call
//! with its start instant (so tests can assert per-BMC ordering and
//! cooldown spacing), and supports per-method and global failure
//! injection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::RedfishError;
use crate::models::{PowerAction, PowerState, SystemInfo};
use crate::redfish_trait::RedfishClientTrait;

/// A call observed by the mock, in invocation order.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    GetSystemInfo,
    GetPowerState,
    SetPowerState(PowerAction),
    InsertVirtualMedia(String),
    EjectVirtualMedia,
    SetBootSourceIso,
    SetUefiBootTarget(Vec<String>),
    GetBiosAttribute(String),
    SetBiosAttribute(String, serde_json::Value),
}

impl RecordedCall {
    fn method(&self) -> &'static str {
        match self {
            RecordedCall::GetSystemInfo => "get_system_info",
            RecordedCall::GetPowerState => "get_power_state",
            RecordedCall::SetPowerState(_) => "set_power_state",
            RecordedCall::InsertVirtualMedia(_) => "insert_virtual_media",
            RecordedCall::EjectVirtualMedia => "eject_virtual_media",
            RecordedCall::SetBootSourceIso => "set_boot_source_iso",
            RecordedCall::SetUefiBootTarget(_) => "set_uefi_boot_target",
            RecordedCall::GetBiosAttribute(_) => "get_bios_attribute",
            RecordedCall::SetBiosAttribute(_, _) => "set_bios_attribute",
        }
    }
}

/// Cloneable failure kinds for injection; converted to [`RedfishError`]
/// when the scripted call fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    Connection,
    Authentication,
    VirtualMediaBusy,
    AttributeUnsupported,
    Timeout,
    PowerStateMismatch,
}

impl MockFailure {
    fn into_error(self, context: &str) -> RedfishError {
        match self {
            MockFailure::Connection => RedfishError::Connection(format!("mock: {context}")),
            MockFailure::Authentication => {
                RedfishError::Authentication(format!("mock: {context}"))
            }
            MockFailure::VirtualMediaBusy => {
                RedfishError::VirtualMediaBusy(format!("mock: {context}"))
            }
            MockFailure::AttributeUnsupported => {
                RedfishError::AttributeUnsupported(context.to_string())
            }
            MockFailure::Timeout => RedfishError::Timeout(format!("mock: {context}")),
            MockFailure::PowerStateMismatch => RedfishError::PowerStateMismatch {
                wanted: "On".to_string(),
                observed: "Off".to_string(),
            },
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    system_info: SystemInfo,
    power_state: PowerState,
    inserted_media: Option<String>,
    bios_attributes: HashMap<String, serde_json::Value>,
    calls: Vec<(Instant, RecordedCall)>,
    per_method_failures: HashMap<&'static str, VecDeque<MockFailure>>,
    fail_always: Option<MockFailure>,
}

/// Mock BMC client for testing.
#[derive(Debug, Clone)]
pub struct MockRedfishClient {
    address: String,
    state: Arc<Mutex<MockState>>,
    /// Simulated duration of each BMC call.
    op_duration: Duration,
}

impl MockRedfishClient {
    /// Create a mock with default (powered-off, empty-media) state.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Arc::new(Mutex::new(MockState {
                power_state: PowerState::Off,
                ..Default::default()
            })),
            op_duration: Duration::ZERO,
        }
    }

    /// Create a mock that reports the given manufacturer/model.
    pub fn with_vendor(address: impl Into<String>, manufacturer: &str, model: &str) -> Self {
        let mock = Self::new(address);
        mock.set_system_info(SystemInfo {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            power_state: PowerState::Off,
            ..Default::default()
        });
        mock
    }

    /// Make every call take `duration` (tokio time; cooperates with
    /// paused-clock tests).
    pub fn with_op_duration(mut self, duration: Duration) -> Self {
        self.op_duration = duration;
        self
    }

    pub fn set_system_info(&self, info: SystemInfo) {
        let mut state = self.lock();
        state.power_state = info.power_state;
        state.system_info = info;
    }

    /// Seed a BIOS attribute so `set_bios_attribute` accepts it.
    pub fn seed_bios_attribute(&self, name: &str, value: serde_json::Value) {
        self.lock().bios_attributes.insert(name.to_string(), value);
    }

    /// Fail the next call to `method` (one-shot; queued in order).
    pub fn fail_next(&self, method: &'static str, failure: MockFailure) {
        self.lock()
            .per_method_failures
            .entry(method)
            .or_default()
            .push_back(failure);
    }

    /// Fail every call until [`Self::clear_failures`] — a BMC that stopped
    /// responding.
    pub fn fail_always(&self, failure: MockFailure) {
        self.lock().fail_always = Some(failure);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_always = None;
        state.per_method_failures.clear();
    }

    /// All calls observed so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Calls with their start instants, for spacing assertions.
    pub fn call_log(&self) -> Vec<(Instant, RecordedCall)> {
        self.lock().calls.clone()
    }

    pub fn inserted_media(&self) -> Option<String> {
        self.lock().inserted_media.clone()
    }

    pub fn power_state(&self) -> PowerState {
        self.lock().power_state
    }

    pub fn bios_attribute(&self, name: &str) -> Option<serde_json::Value> {
        self.lock().bios_attributes.get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // Mutex poisoning only happens when a test already panicked.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn begin(&self, call: RecordedCall) -> Result<(), RedfishError> {
        let method = call.method();
        let failure = {
            let mut state = self.lock();
            state.calls.push((Instant::now(), call.clone()));
            if let Some(f) = state.fail_always.clone() {
                Some(f)
            } else {
                state
                    .per_method_failures
                    .get_mut(method)
                    .and_then(VecDeque::pop_front)
            }
        };

        if self.op_duration > Duration::ZERO {
            tokio::time::sleep(self.op_duration).await;
        }

        match failure {
            Some(f) => Err(f.into_error(method)),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl RedfishClientTrait for MockRedfishClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn get_system_info(&self) -> Result<SystemInfo, RedfishError> {
        self.begin(RecordedCall::GetSystemInfo).await?;
        let state = self.lock();
        let mut info = state.system_info.clone();
        info.power_state = state.power_state;
        Ok(info)
    }

    async fn get_power_state(&self) -> Result<PowerState, RedfishError> {
        self.begin(RecordedCall::GetPowerState).await?;
        Ok(self.lock().power_state)
    }

    async fn set_power_state(&self, action: PowerAction) -> Result<(), RedfishError> {
        self.begin(RecordedCall::SetPowerState(action)).await?;
        if let Some(target) = action.target_state() {
            self.lock().power_state = target;
        }
        Ok(())
    }

    async fn insert_virtual_media(&self, image_url: &str) -> Result<(), RedfishError> {
        self.begin(RecordedCall::InsertVirtualMedia(image_url.to_string()))
            .await?;
        let mut state = self.lock();
        match &state.inserted_media {
            Some(existing) if existing != image_url => Err(RedfishError::VirtualMediaBusy(
                format!("slot holds {existing}"),
            )),
            _ => {
                state.inserted_media = Some(image_url.to_string());
                Ok(())
            }
        }
    }

    async fn eject_virtual_media(&self) -> Result<(), RedfishError> {
        self.begin(RecordedCall::EjectVirtualMedia).await?;
        self.lock().inserted_media = None;
        Ok(())
    }

    async fn set_boot_source_iso(&self) -> Result<(), RedfishError> {
        self.begin(RecordedCall::SetBootSourceIso).await?;
        if self.lock().inserted_media.is_none() {
            return Err(RedfishError::BootSourceUnavailable(
                "no media inserted".to_string(),
            ));
        }
        Ok(())
    }

    async fn set_uefi_boot_target(&self, kernel_args: &[String]) -> Result<(), RedfishError> {
        self.begin(RecordedCall::SetUefiBootTarget(kernel_args.to_vec()))
            .await
    }

    async fn get_bios_attribute(&self, name: &str) -> Result<serde_json::Value, RedfishError> {
        self.begin(RecordedCall::GetBiosAttribute(name.to_string()))
            .await?;
        self.lock()
            .bios_attributes
            .get(name)
            .cloned()
            .ok_or_else(|| RedfishError::AttributeUnsupported(name.to_string()))
    }

    async fn set_bios_attribute(
        &self,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), RedfishError> {
        self.begin(RecordedCall::SetBiosAttribute(name.to_string(), value.clone()))
            .await?;
        let mut state = self.lock();
        if !state.bios_attributes.contains_key(name) {
            return Err(RedfishError::AttributeUnsupported(name.to_string()));
        }
        state.bios_attributes.insert(name.to_string(), value);
        Ok(())
    }
}
