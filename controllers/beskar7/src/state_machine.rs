//! PhysicalHost state machine
//!
//! Pure transition validation plus stuck-state detection. The reconcilers
//! and the claim coordinator run every host mutation through
//! [`apply_transition`]; the conditional write to the API server is what
//! makes the guarded mutation atomic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use crds::{HostState, PhysicalHostSpec, PhysicalHostStatus};

use crate::error::ControllerError;

/// Recoveries attempted on a stuck host before it transitions to Error.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Whether `from -> to` appears in the transition table.
///
/// `(any) -> Error` is always legal: a fatal reconcile error can strike in
/// any state.
pub fn is_transition_allowed(from: HostState, to: HostState) -> bool {
    use HostState::*;
    if to == Error {
        return true;
    }
    matches!(
        (from, to),
        (None, Enrolling)
            | (Enrolling, Available)
            | (Available, Claimed)
            | (Available, Deprovisioning)
            | (Claimed, Provisioning)
            | (Claimed, Available)
            | (Provisioning, Provisioned)
            | (Provisioned, Available)
            | (Provisioned, Deprovisioning)
            | (Error, Enrolling)
            | (Error, Available)
            | (Error, Deprovisioning)
    )
}

/// Validate the invariants that must hold after a mutation lands.
///
/// * a consumer is carried exactly in Claimed/Provisioning/Provisioned
/// * a boot ISO implies a consumer
/// * Provisioning implies a boot ISO
pub fn validate_invariants(
    spec: &PhysicalHostSpec,
    state: HostState,
) -> Result<(), ControllerError> {
    let has_consumer = spec.consumer_ref.is_some();
    if has_consumer != state.allows_consumer() {
        return Err(ControllerError::Validation(format!(
            "consumerRef {} is inconsistent with state {state}",
            if has_consumer { "set" } else { "unset" },
        )));
    }
    if spec.boot_iso_source.is_some() && !has_consumer {
        return Err(ControllerError::Validation(
            "bootIsoSource set on an unclaimed host".to_string(),
        ));
    }
    if state == HostState::Provisioning && spec.boot_iso_source.is_none() {
        return Err(ControllerError::Validation(
            "Provisioning host has no bootIsoSource".to_string(),
        ));
    }
    Ok(())
}

/// Move `status` to `to`, enforcing the transition table and invariants
/// against the (already mutated) `spec`.
///
/// Resets the recovery counter and stamps `state_changed_at`; `ready` is
/// recomputed from the new state and hardware details.
pub fn apply_transition(
    status: &mut PhysicalHostStatus,
    spec: &PhysicalHostSpec,
    to: HostState,
    now: DateTime<Utc>,
) -> Result<(), ControllerError> {
    let from = status.state;
    if from == to {
        return Ok(());
    }
    if !is_transition_allowed(from, to) {
        return Err(ControllerError::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    validate_invariants(spec, to)?;

    status.state = to;
    status.state_changed_at = Some(now);
    status.recovery_attempts = 0;
    status.ready = to.is_ready_state() && status.hardware_details.is_some();
    if to != HostState::Error {
        status.error_message = None;
    }
    Ok(())
}

/// Recovery strategy for a stuck transitional state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckRecovery {
    /// Enrolling too long: re-run the connection probe
    ReprobeConnection,
    /// Provisioning too long: eject media, verify power, retry boot setup
    EjectAndRetryBoot,
}

/// Detect a stuck transitional state.
///
/// Returns the recovery strategy when the host has sat in Enrolling or
/// Provisioning for longer than `timeout`. Hosts without a recorded state
/// timestamp are never considered stuck; the next transition stamps one.
pub fn detect_stuck(
    status: &PhysicalHostStatus,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Option<StuckRecovery> {
    let strategy = match status.state {
        HostState::Enrolling => StuckRecovery::ReprobeConnection,
        HostState::Provisioning => StuckRecovery::EjectAndRetryBoot,
        _ => return None,
    };
    let since = status.state_changed_at?;
    let held = now.signed_duration_since(since);
    if held >= chrono::Duration::from_std(timeout).ok()? {
        Some(strategy)
    } else {
        None
    }
}

/// Whether the stuck host has exhausted its recovery budget.
pub fn recoveries_exhausted(status: &PhysicalHostStatus) -> bool {
    status.recovery_attempts >= MAX_RECOVERY_ATTEMPTS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{ConsumerRef, HardwareDetails, RedfishConnection};

    fn spec(consumer: bool, iso: bool) -> PhysicalHostSpec {
        PhysicalHostSpec {
            redfish_connection: RedfishConnection {
                address: "https://bmc-1".to_string(),
                credentials_secret_ref: "bmc-1-creds".to_string(),
                insecure_skip_verify: false,
            },
            consumer_ref: consumer.then(|| ConsumerRef::machine("metal", "m-1")),
            boot_iso_source: iso.then(|| "https://images/os.iso".to_string()),
            user_data_secret_ref: Option::None,
        }
    }

    fn status_in(state: HostState) -> PhysicalHostStatus {
        PhysicalHostStatus {
            state,
            hardware_details: Some(HardwareDetails::default()),
            ..Default::default()
        }
    }

    #[test]
    fn table_accepts_documented_transitions() {
        use HostState::*;
        let allowed = [
            (None, Enrolling),
            (Enrolling, Available),
            (Enrolling, Error),
            (Available, Claimed),
            (Available, Deprovisioning),
            (Claimed, Provisioning),
            (Claimed, Available),
            (Provisioning, Provisioned),
            (Provisioning, Error),
            (Provisioned, Available),
            (Provisioned, Deprovisioning),
            (Error, Enrolling),
            (Error, Available),
            (Error, Deprovisioning),
        ];
        for (from, to) in allowed {
            assert!(is_transition_allowed(from, to), "{from} -> {to}");
        }
    }

    #[test]
    fn table_rejects_shortcuts() {
        use HostState::*;
        let rejected = [
            (None, Available),
            (Enrolling, Claimed),
            (Available, Provisioning),
            (Available, Provisioned),
            (Claimed, Provisioned),
            (Provisioned, Claimed),
            (Deprovisioning, Available),
        ];
        for (from, to) in rejected {
            assert!(!is_transition_allowed(from, to), "{from} -> {to}");
        }
    }

    #[test]
    fn any_state_may_fail() {
        for from in [
            HostState::None,
            HostState::Enrolling,
            HostState::Available,
            HostState::Claimed,
            HostState::Provisioning,
            HostState::Provisioned,
            HostState::Deprovisioning,
            HostState::Unknown,
        ] {
            assert!(is_transition_allowed(from, HostState::Error));
        }
    }

    #[test]
    fn claim_transition_requires_consumer() {
        let mut status = status_in(HostState::Available);
        // Consumer not yet written: invariant (i) fails.
        let err = apply_transition(&mut status, &spec(false, false), HostState::Claimed, Utc::now());
        assert!(err.is_err());

        let mut status = status_in(HostState::Available);
        apply_transition(&mut status, &spec(true, false), HostState::Claimed, Utc::now())
            .expect("claim with consumer set");
        assert_eq!(status.state, HostState::Claimed);
        assert!(status.ready);
        assert!(status.state_changed_at.is_some());
    }

    #[test]
    fn provisioning_requires_boot_iso() {
        let mut status = status_in(HostState::Claimed);
        let err =
            apply_transition(&mut status, &spec(true, false), HostState::Provisioning, Utc::now());
        assert!(matches!(err, Err(ControllerError::Validation(_))));

        let mut status = status_in(HostState::Claimed);
        apply_transition(&mut status, &spec(true, true), HostState::Provisioning, Utc::now())
            .expect("provisioning with ISO set");
    }

    #[test]
    fn boot_iso_on_unclaimed_host_is_invalid() {
        assert!(validate_invariants(&spec(false, true), HostState::Available).is_err());
    }

    #[test]
    fn transition_resets_recovery_counter_and_error() {
        let mut status = status_in(HostState::Error);
        status.recovery_attempts = 2;
        status.error_message = Some("old failure".to_string());
        apply_transition(&mut status, &spec(false, false), HostState::Available, Utc::now())
            .expect("error recovery");
        assert_eq!(status.recovery_attempts, 0);
        assert!(status.error_message.is_none());
    }

    #[test]
    fn stuck_detection_fires_at_timeout() {
        let timeout = Duration::from_secs(900);
        let mut status = status_in(HostState::Provisioning);
        let start = Utc::now();
        status.state_changed_at = Some(start);

        let before = start + chrono::Duration::seconds(899);
        assert_eq!(detect_stuck(&status, before, timeout), Option::None);

        let at = start + chrono::Duration::seconds(900);
        assert_eq!(
            detect_stuck(&status, at, timeout),
            Some(StuckRecovery::EjectAndRetryBoot)
        );

        status.state = HostState::Enrolling;
        assert_eq!(
            detect_stuck(&status, at, timeout),
            Some(StuckRecovery::ReprobeConnection)
        );

        // Settled states are never stuck.
        status.state = HostState::Provisioned;
        assert_eq!(detect_stuck(&status, at, timeout), Option::None);
    }

    #[test]
    fn recovery_budget() {
        let mut status = status_in(HostState::Provisioning);
        assert!(!recoveries_exhausted(&status));
        status.recovery_attempts = MAX_RECOVERY_ATTEMPTS;
        assert!(recoveries_exhausted(&status));
    }
}
