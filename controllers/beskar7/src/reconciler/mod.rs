//! Reconcilers for the Beskar7 CRD kinds
//!
//! One `Reconciler` instance is shared by the PhysicalHost, Beskar7Machine
//! and Beskar7Cluster controllers. It owns the provisioning queue handle,
//! the claim coordinator (and its optional leader-elected front end), the
//! event recorder and the controller configuration.

pub mod cluster;
#[cfg(test)]
pub mod cluster_test;
pub mod machine;
#[cfg(test)]
pub mod machine_test;
pub mod physical_host;
#[cfg(test)]
pub mod physical_host_test;

use std::sync::Arc;
use std::time::Duration;

use crds::{Beskar7Cluster, Beskar7Machine, PhysicalHost};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use kube_runtime::events::{Recorder, Reporter};
use redfish_client::{RedfishClient, RedfishClientTrait};
use tracing::debug;

use crate::config::Config;
use crate::coordinator::leader::LeaderElectedCoordinator;
use crate::coordinator::{ClaimCoordinator, ClaimError, ClaimRequest};
use crate::error::ControllerError;
use crate::queue::ProvisioningQueue;

/// Shared reconciler for all Beskar7 kinds.
pub struct Reconciler {
    pub(crate) client: Client,
    pub(crate) config: Config,
    pub(crate) queue: Arc<ProvisioningQueue>,
    pub(crate) coordinator: ClaimCoordinator,
    pub(crate) leader_coordinator: Option<Arc<LeaderElectedCoordinator>>,
    pub(crate) recorder: Recorder,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        client: Client,
        config: Config,
        queue: Arc<ProvisioningQueue>,
        coordinator: ClaimCoordinator,
        leader_coordinator: Option<Arc<LeaderElectedCoordinator>>,
    ) -> Self {
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: "beskar7-controller".to_string(),
                instance: None,
            },
        );
        Self {
            client,
            config,
            queue,
            coordinator,
            leader_coordinator,
            recorder,
        }
    }

    pub(crate) fn host_api(&self, namespace: &str) -> Api<PhysicalHost> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub(crate) fn machine_api(&self, namespace: &str) -> Api<Beskar7Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub(crate) fn cluster_api(&self, namespace: &str) -> Api<Beskar7Cluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secret_api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Route a claim through the leader-elected queue when that mode is
    /// on, falling back to the local-optimistic path when this replica
    /// cannot get an answer from the lease holder.
    pub(crate) async fn claim_host(
        &self,
        req: &ClaimRequest,
    ) -> Result<PhysicalHost, ClaimError> {
        if let Some(leader) = &self.leader_coordinator {
            let patience = self.config.reconcile_timeout / 2;
            match leader.claim(req.clone(), patience).await {
                Err(ClaimError::LeadershipLost) => {
                    debug!(
                        "Leader queue unavailable for {}, claiming locally",
                        req.machine_id()
                    );
                    self.coordinator.claim(req).await
                }
                other => other,
            }
        } else {
            self.coordinator.claim(req).await
        }
    }

    /// Build a Redfish client for a host from its connection spec and
    /// credentials secret.
    pub(crate) async fn redfish_client_for(
        &self,
        host: &PhysicalHost,
    ) -> Result<Arc<dyn RedfishClientTrait>, ControllerError> {
        let namespace = host.metadata.namespace.as_deref().unwrap_or_default();
        let connection = &host.spec.redfish_connection;

        let secret = self
            .secret_api(namespace)
            .get(&connection.credentials_secret_ref)
            .await
            .map_err(|e| {
                ControllerError::Credential(format!(
                    "credentials secret {}/{}: {e}",
                    namespace, connection.credentials_secret_ref
                ))
            })?;
        let (username, password) = parse_credentials(&secret)?;

        let client = RedfishClient::new(
            connection.address.clone(),
            username,
            password,
            self.config.redfish_timeout,
            connection.insecure_skip_verify,
        )?;
        Ok(Arc::new(client))
    }

    /// How long a reconcile waits on an in-flight queue entry before
    /// requeueing itself.
    pub(crate) fn queue_wait_budget(&self) -> Duration {
        (self.config.reconcile_timeout / 4).min(Duration::from_secs(30))
    }
}

/// Extract and validate the `username`/`password` keys of a credentials
/// secret. Both must be present and non-empty.
pub fn parse_credentials(secret: &Secret) -> Result<(String, String), ControllerError> {
    let name = secret.metadata.name.as_deref().unwrap_or("<unnamed>");
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| ControllerError::Credential(format!("secret {name} has no data")))?;

    let field = |key: &str| -> Result<String, ControllerError> {
        let bytes = data
            .get(key)
            .ok_or_else(|| ControllerError::Credential(format!("secret {name} missing key {key}")))?;
        let value = String::from_utf8(bytes.0.clone())
            .map_err(|_| ControllerError::Credential(format!("secret {name} key {key} is not UTF-8")))?;
        if value.is_empty() {
            return Err(ControllerError::Credential(format!(
                "secret {name} key {key} is empty"
            )));
        }
        Ok(value)
    };

    Ok((field("username")?, field("password")?))
}
