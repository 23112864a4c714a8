//! Condition types for Beskar7 resource status
//!
//! Cluster API style conditions: a typed list on every status object, with
//! a fixed enumeration of condition types and failure reasons so consumers
//! never have to parse message text.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set on a Beskar7Machine once a PhysicalHost is claimed.
pub const CONDITION_PHYSICAL_HOST_ASSOCIATED: &str = "PhysicalHostAssociated";

/// Condition type set once the backing host is provisioned and powered on.
pub const CONDITION_INFRASTRUCTURE_READY: &str = "InfrastructureReady";

/// Condition type surfaced on a PhysicalHost whose deletion is blocked.
pub const CONDITION_DEPROVISION_BLOCKED: &str = "DeprovisionBlocked";

// Reasons, drawn from a fixed enumeration. Retry/terminal classification
// lives in the error types, never here.
pub const REASON_WAITING_FOR_PHYSICAL_HOST: &str = "WaitingForPhysicalHost";
pub const REASON_PHYSICAL_HOST_ERROR: &str = "PhysicalHostError";
pub const REASON_RELEASE_PHYSICAL_HOST_FAILED: &str = "ReleasePhysicalHostFailed";
pub const REASON_BOOT_CONFIG_FAILED: &str = "BootConfigFailed";
pub const REASON_CLAIM_CONFLICT: &str = "ClaimConflict";
pub const REASON_BOOT_PARAM_UNSUPPORTED: &str = "BootParamUnsupported";
pub const REASON_PROVISIONING_TIMEOUT: &str = "ProvisioningTimeout";
pub const REASON_CREDENTIAL_ERROR: &str = "CredentialError";
pub const REASON_REDFISH_CONNECTION_FAILED: &str = "RedfishConnectionFailed";
pub const REASON_HOST_CLAIMED: &str = "HostClaimed";
pub const REASON_PROVISIONED: &str = "Provisioned";
pub const REASON_HOST_STILL_CLAIMED: &str = "HostStillClaimed";
pub const REASON_MODE_NOT_IMPLEMENTED: &str = "ProvisioningModeNotImplemented";

/// Condition status values, matching metav1.ConditionStatus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Severity of a False condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionSeverity {
    Error,
    Warning,
    Info,
}

/// A single observed condition on a resource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. "PhysicalHostAssociated"
    #[serde(rename = "type")]
    pub condition_type: String,

    /// True, False or Unknown
    pub status: ConditionStatus,

    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Severity, set when status is False
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    /// When the condition last changed status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// A True condition with a reason.
    pub fn true_with_reason(condition_type: &str, reason: &str) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: ConditionStatus::True,
            reason: Some(reason.to_string()),
            message: None,
            severity: None,
            last_transition_time: Some(Utc::now()),
        }
    }

    /// A False condition with a reason, message and severity.
    pub fn false_with_reason(
        condition_type: &str,
        reason: &str,
        message: &str,
        severity: ConditionSeverity,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: ConditionStatus::False,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            severity: Some(severity),
            last_transition_time: Some(Utc::now()),
        }
    }
}

/// Upsert `cond` into `conditions`, keyed by condition type.
///
/// The stored `last_transition_time` is preserved when the status did not
/// change, so repeated reconciles do not churn the timestamp.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == cond.condition_type)
    {
        if existing.status == cond.status {
            cond.last_transition_time = existing.last_transition_time;
        }
        *existing = cond;
    } else {
        conditions.push(cond);
    }
}

/// Look up a condition by type.
pub fn get_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// Whether the condition of the given type is present and True.
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    matches!(
        get_condition(conditions, condition_type),
        Some(c) if c.status == ConditionStatus::True
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_inserts_and_replaces() {
        let mut conds = Vec::new();
        set_condition(
            &mut conds,
            Condition::true_with_reason(CONDITION_PHYSICAL_HOST_ASSOCIATED, REASON_HOST_CLAIMED),
        );
        assert_eq!(conds.len(), 1);
        assert!(is_condition_true(&conds, CONDITION_PHYSICAL_HOST_ASSOCIATED));

        set_condition(
            &mut conds,
            Condition::false_with_reason(
                CONDITION_PHYSICAL_HOST_ASSOCIATED,
                REASON_CLAIM_CONFLICT,
                "host already claimed",
                ConditionSeverity::Warning,
            ),
        );
        assert_eq!(conds.len(), 1);
        assert!(!is_condition_true(&conds, CONDITION_PHYSICAL_HOST_ASSOCIATED));
    }

    #[test]
    fn transition_time_preserved_when_status_unchanged() {
        let mut conds = Vec::new();
        let first = Condition::true_with_reason(CONDITION_INFRASTRUCTURE_READY, REASON_PROVISIONED);
        let first_time = first.last_transition_time;
        set_condition(&mut conds, first);

        let mut again =
            Condition::true_with_reason(CONDITION_INFRASTRUCTURE_READY, REASON_PROVISIONED);
        again.last_transition_time = Some(Utc::now());
        set_condition(&mut conds, again);

        assert_eq!(conds[0].last_transition_time, first_time);
    }
}
