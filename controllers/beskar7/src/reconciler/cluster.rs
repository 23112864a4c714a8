//! Beskar7Cluster reconciler
//!
//! Thin: surfaces the control-plane endpoint and derives failure domains
//! from the zone labels on PhysicalHosts in the namespace.

use std::collections::BTreeMap;

use crds::*;
use kube_runtime::controller::Action;
use kube_runtime::events::EventType;
use tracing::{debug, info};

use super::Reconciler;
use crate::error::ControllerError;
use crate::reconcile_helpers::{patch_status, publish_event, PERIODIC_REQUEUE};

/// Collect the distinct `topology.kubernetes.io/zone` labels of a host
/// pool into Cluster API failure domains.
pub fn zone_failure_domains(hosts: &[PhysicalHost]) -> BTreeMap<String, FailureDomainSpec> {
    let mut domains = BTreeMap::new();
    for host in hosts {
        let Some(zone) = host
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_TOPOLOGY_ZONE))
        else {
            continue;
        };
        domains
            .entry(zone.clone())
            .or_insert(FailureDomainSpec { control_plane: true });
    }
    domains
}

impl Reconciler {
    pub async fn reconcile_cluster(
        &self,
        cluster: &Beskar7Cluster,
    ) -> Result<Action, ControllerError> {
        let name = cluster
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::Validation("Beskar7Cluster missing name".to_string()))?
            .to_string();
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default").to_string();

        info!("Reconciling Beskar7Cluster {}/{}", namespace, name);

        if cluster.metadata.deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        let hosts = self
            .host_api(&namespace)
            .list(&kube::api::ListParams::default())
            .await?;
        let failure_domains = zone_failure_domains(&hosts.items);

        let ready = cluster.spec.control_plane_endpoint.is_some();
        let previous = cluster.status.clone().unwrap_or_default();
        let status = Beskar7ClusterStatus {
            ready,
            failure_domains,
            conditions: previous.conditions.clone(),
        };

        if previous.ready != status.ready || previous.failure_domains != status.failure_domains {
            patch_status(&self.cluster_api(&namespace), &name, &status).await?;
            if ready && !previous.ready {
                publish_event(
                    &self.recorder,
                    cluster,
                    EventType::Normal,
                    "ClusterInfrastructureReady",
                    "Reconcile",
                    format!(
                        "control plane endpoint set, {} failure domain(s) discovered",
                        status.failure_domains.len()
                    ),
                )
                .await;
            }
        } else {
            debug!("Beskar7Cluster {}/{} unchanged", namespace, name);
        }

        // Failure domains drift as hosts are added and removed.
        Ok(Action::requeue(PERIODIC_REQUEUE))
    }
}
