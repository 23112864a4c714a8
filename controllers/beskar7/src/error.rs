//! Controller-specific error types.
//!
//! One flat taxonomy for everything the reconcilers can hit. Whether an
//! error is worth retrying is a property of the variant; nothing in the
//! controllers inspects error text.

use redfish_client::RedfishError;
use thiserror::Error;

/// Errors that can occur in the Beskar7 controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// BMC error, already classified by the Redfish client
    #[error("Redfish error: {0}")]
    Redfish(#[from] RedfishError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A resource failed invariant re-validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Credentials secret missing or malformed
    #[error("Credential error: {0}")]
    Credential(String),

    /// A state-machine guard rejected the mutation
    #[error("Illegal host state transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// Optimistic-lock retries exhausted while claiming
    #[error("Claim conflict on {0}")]
    #[allow(dead_code)] // Reserved: the coordinator reports ClaimError today
    ClaimConflict(String),

    /// The provisioning queue is at capacity; re-reconcile later
    #[error("Provisioning queue full")]
    #[allow(dead_code)] // Reserved: reconcilers translate QueueFull to a requeue
    QueueFull,

    /// A queue entry or reconcile hit its deadline
    #[error("Operation timed out: {0}")]
    #[allow(dead_code)] // Reserved: queue timeouts surface as OpError::Timeout
    OperationTimeout(String),

    /// Kernel-arg injection impossible for this host/machine combination
    #[error("Boot parameters unsupported: {0}")]
    #[allow(dead_code)] // Reserved: surfaced via machine failureReason today
    BootParamUnsupported(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Reconciliation failed for a reason with no narrower variant
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),
}

impl ControllerError {
    /// Whether the owning reconcile should requeue and try again.
    ///
    /// Terminal errors surface as `failureReason`/`failureMessage` on the
    /// resource instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Kube(_)
            | ControllerError::ClaimConflict(_)
            | ControllerError::QueueFull
            | ControllerError::OperationTimeout(_)
            | ControllerError::Watch(_)
            | ControllerError::Reconciliation(_) => true,
            ControllerError::Redfish(e) => e.is_retryable(),
            ControllerError::InvalidConfig(_)
            | ControllerError::Validation(_)
            | ControllerError::Credential(_)
            | ControllerError::IllegalTransition { .. }
            | ControllerError::BootParamUnsupported(_) => false,
        }
    }
}

/// Whether a kube error is an optimistic-concurrency conflict (HTTP 409).
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(ControllerError::QueueFull.is_retryable());
        assert!(ControllerError::ClaimConflict("h-a".into()).is_retryable());
        assert!(!ControllerError::Validation("bad".into()).is_retryable());
        assert!(!ControllerError::BootParamUnsupported("hpe".into()).is_retryable());
        assert!(
            ControllerError::Redfish(RedfishError::Connection("down".into())).is_retryable()
        );
        assert!(
            !ControllerError::Redfish(RedfishError::Authentication("denied".into()))
                .is_retryable()
        );
    }
}
