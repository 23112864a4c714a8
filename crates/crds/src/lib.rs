//! Beskar7 CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Beskar7 bare-metal
//! infrastructure provider (API group `infrastructure.cluster.x-k8s.io`).

pub mod beskar7_cluster;
pub mod beskar7_machine;
pub mod beskar7_machine_template;
pub mod conditions;
pub mod physical_host;
pub mod references;

pub use beskar7_cluster::*;
pub use beskar7_machine::*;
pub use beskar7_machine_template::*;
pub use conditions::*;
pub use physical_host::*;
pub use references::*;

/// API group shared by all Beskar7 CRDs.
pub const API_GROUP: &str = "infrastructure.cluster.x-k8s.io";

/// API version shared by all Beskar7 CRDs.
pub const API_VERSION: &str = "v1beta1";

/// Builds the provider ID for a machine provisioned on `host_name`.
///
/// The format is part of the external contract and must stay bit-exact:
/// `beskar7://<namespace>/<physicalhost-name>`.
pub fn provider_id(namespace: &str, host_name: &str) -> String {
    format!("beskar7://{namespace}/{host_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_format() {
        assert_eq!(provider_id("metal", "h-a"), "beskar7://metal/h-a");
    }
}
