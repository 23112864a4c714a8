//! Beskar7MachineTemplate CRD
//!
//! Template consumed by Cluster API machine deployments to stamp out
//! Beskar7Machines.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::beskar7_machine::Beskar7MachineSpec;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Beskar7MachineTemplate",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct Beskar7MachineTemplateSpec {
    /// The template stamped onto new machines
    pub template: Beskar7MachineTemplateResource,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Beskar7MachineTemplateResource {
    /// Spec for machines created from this template
    pub spec: Beskar7MachineSpec,
}
