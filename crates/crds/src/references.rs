//! Object references shared by Beskar7 CRDs
//!
//! Follows the Kubernetes ObjectReference pattern, trimmed to the fields the
//! controllers actually resolve.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to the Beskar7Machine that owns a PhysicalHost.
///
/// A PhysicalHost is exclusively owned by at most one machine at a time; the
/// claim coordinator writes this reference atomically together with the
/// claim annotations.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    /// Name of the owning Beskar7Machine
    pub name: String,

    /// Namespace of the owning Beskar7Machine
    pub namespace: String,

    /// Kind of the owning resource (always "Beskar7Machine" today)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// UID of the owning resource, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ConsumerRef {
    /// Create a reference to a Beskar7Machine.
    pub fn machine(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            kind: Some("Beskar7Machine".to_string()),
            uid: None,
        }
    }

    /// Whether this reference points at the given machine identity.
    pub fn matches(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

/// Reference to a Secret in the same namespace as the referencing resource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Name of the Secret
    pub name: String,
}
