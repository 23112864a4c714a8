//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires together the
//! provisioning queue, the claim coordinator (with its optional
//! leader-elected mode), the shared reconciler and one watcher task per
//! CRD kind.

use std::sync::Arc;

use crds::{Beskar7Cluster, Beskar7Machine, PhysicalHost};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::coordinator::leader::{LeaderElectedCoordinator, LeaseManager};
use crate::coordinator::ClaimCoordinator;
use crate::error::ControllerError;
use crate::host_store::{HostStore, KubeHostStore};
use crate::queue::ProvisioningQueue;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;

/// Main controller for Beskar7 resource management.
pub struct Controller {
    queue: Arc<ProvisioningQueue>,
    physical_host_watcher: JoinHandle<Result<(), ControllerError>>,
    machine_watcher: JoinHandle<Result<(), ControllerError>>,
    cluster_watcher: JoinHandle<Result<(), ControllerError>>,
    lease_task: Option<JoinHandle<()>>,
    drain_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing Beskar7 controller");

        let client = Client::try_default().await.map_err(ControllerError::Kube)?;

        // Process-wide provisioning queue: explicit init here, explicit
        // teardown in shutdown().
        let queue = Arc::new(ProvisioningQueue::new(
            config.queue.clone(),
            config.retry.max_attempts,
        ));
        queue.start();

        let store: Arc<dyn HostStore> = Arc::new(KubeHostStore::new(client.clone()));
        let coordinator = ClaimCoordinator::new(store, config.retry.clone());

        // Optional leader-elected claim mode: a lease loop plus the drain
        // loop that serializes claims on the lease holder.
        let (leader_coordinator, lease_task, drain_task) = if config.claim_leader_election.enabled {
            let leader = Arc::new(LeaderElectedCoordinator::new(coordinator.clone()));
            let lease_namespace = config
                .watch_namespace
                .clone()
                .unwrap_or_else(|| "default".to_string());
            let identity = format!(
                "{}-{}",
                std::env::var("POD_NAME").unwrap_or_else(|_| "beskar7-controller".to_string()),
                std::process::id()
            );
            info!(
                "Claim-coordinator leader election enabled (identity {}, lease in {})",
                identity, lease_namespace
            );
            let manager = LeaseManager::new(
                client.clone(),
                &lease_namespace,
                identity,
                config.claim_leader_election.clone(),
            );
            let lease_task = {
                let leader = Arc::clone(&leader);
                tokio::spawn(async move { manager.run(leader).await })
            };
            let drain_task = {
                let leader = Arc::clone(&leader);
                tokio::spawn(async move { leader.run_drain_loop().await })
            };
            (Some(leader), Some(lease_task), Some(drain_task))
        } else {
            (None, None, None)
        };

        let reconciler = Arc::new(Reconciler::new(
            client.clone(),
            config.clone(),
            Arc::clone(&queue),
            coordinator,
            leader_coordinator,
        ));

        let (host_api, machine_api, cluster_api): (
            Api<PhysicalHost>,
            Api<Beskar7Machine>,
            Api<Beskar7Cluster>,
        ) = match config.watch_namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            ),
            None => (
                Api::all(client.clone()),
                Api::all(client.clone()),
                Api::all(client.clone()),
            ),
        };

        let watcher_instance = Arc::new(Watcher::new(reconciler, host_api, machine_api, cluster_api));

        let physical_host_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_physical_hosts().await })
        };

        let machine_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_machines().await })
        };

        let cluster_watcher = {
            let watcher = watcher_instance;
            tokio::spawn(async move { watcher.watch_clusters().await })
        };

        Ok(Self {
            queue,
            physical_host_watcher,
            machine_watcher,
            cluster_watcher,
            lease_task,
            drain_task,
        })
    }

    /// Runs the controller until a watcher exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Beskar7 controller running");

        let result = tokio::select! {
            result = &mut self.physical_host_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("PhysicalHost watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("PhysicalHost watcher error: {e}")))
            }
            result = &mut self.machine_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Beskar7Machine watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("Beskar7Machine watcher error: {e}")))
            }
            result = &mut self.cluster_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Beskar7Cluster watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("Beskar7Cluster watcher error: {e}")))
            }
        };

        self.shutdown();
        result
    }

    /// Tear down process-wide state: queue workers, leader-election tasks.
    fn shutdown(&self) {
        info!("Beskar7 controller shutting down");
        self.queue.shutdown();
        if let Some(task) = &self.lease_task {
            task.abort();
        }
        if let Some(task) = &self.drain_task {
            task.abort();
        }
    }
}
