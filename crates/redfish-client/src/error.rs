//! Redfish client errors
//!
//! Every failure condition the controllers care about is a distinct
//! variant; retry-vs-fatal decisions are made on the variant, never on the
//! message text.

use thiserror::Error;

/// Errors that can occur when talking to a BMC over Redfish.
#[derive(Debug, Error)]
pub enum RedfishError {
    /// BMC unreachable: TLS, DNS or TCP failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Bad credentials or permission denied
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A power operation was accepted but the target state was not reached
    #[error("power state mismatch: wanted {wanted}, observed {observed}")]
    PowerStateMismatch { wanted: String, observed: String },

    /// The requested boot source is not offered by this system
    #[error("boot source unavailable: {0}")]
    BootSourceUnavailable(String),

    /// Virtual media slot busy or the insert/eject was rejected
    #[error("virtual media busy: {0}")]
    VirtualMediaBusy(String),

    /// The BIOS attribute does not exist on this vendor/firmware
    #[error("BIOS attribute unsupported: {0}")]
    AttributeUnsupported(String),

    /// The per-call deadline was hit
    #[error("timeout talking to BMC: {0}")]
    Timeout(String),

    /// Underlying HTTP transport error not classified above
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    /// The BMC answered with an unexpected Redfish payload or status
    #[error("Redfish API error: {0}")]
    Api(String),

    /// Payload could not be decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RedfishError {
    /// Whether the operation may succeed if simply retried later.
    ///
    /// Authentication and attribute-support failures are deterministic;
    /// retrying them only burns the BMC's session budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            RedfishError::Connection(_)
            | RedfishError::Timeout(_)
            | RedfishError::VirtualMediaBusy(_)
            | RedfishError::PowerStateMismatch { .. }
            | RedfishError::Http(_) => true,
            RedfishError::Authentication(_)
            | RedfishError::AttributeUnsupported(_)
            | RedfishError::BootSourceUnavailable(_)
            | RedfishError::Api(_)
            | RedfishError::Serialization(_) => false,
        }
    }
}

impl From<reqwest::Error> for RedfishError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RedfishError::Timeout(e.to_string())
        } else if e.is_connect() {
            RedfishError::Connection(e.to_string())
        } else {
            RedfishError::Http(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(RedfishError::Connection("refused".into()).is_retryable());
        assert!(RedfishError::Timeout("deadline".into()).is_retryable());
        assert!(RedfishError::VirtualMediaBusy("slot".into()).is_retryable());
        assert!(!RedfishError::Authentication("403".into()).is_retryable());
        assert!(!RedfishError::AttributeUnsupported("KernelArgs".into()).is_retryable());
    }
}
