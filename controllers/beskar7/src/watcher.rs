//! Kubernetes resource watchers.
//!
//! This module handles watching Beskar7 resources for changes and
//! triggering reconciliation using kube_runtime::Controller.
//!
//! All watchers use a generic `watch_resource()` helper that properly
//! handles the reconcile loop with automatic reconnection and retry
//! logic.

use std::sync::Arc;
use std::time::Duration;

use crds::{Beskar7Cluster, Beskar7Machine, PhysicalHost};
use futures::StreamExt;
use kube::{Api, Resource};
use kube_runtime::{
    controller::{Action, Config as ControllerConfig},
    watcher, Controller,
};
use tracing::{debug, error, info};

use crate::error::ControllerError;
use crate::reconcile_helpers::action_for_error;
use crate::reconciler::Reconciler;

/// Generic watcher helper built on kube_runtime::Controller.
///
/// - automatic reconnection and watch restarts
/// - debounce batches bursts of status updates
/// - bounded concurrency per watched kind
async fn watch_resource<K, F>(
    api: Api<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    resource_name: &str,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    F: Fn(Arc<Reconciler>, Arc<K>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Action, ControllerError>> + Send>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    info!("Starting {} watcher", resource_name);

    let error_policy = {
        let resource_name = resource_name.to_string();
        move |_obj: Arc<K>, error: &ControllerError, _ctx: Arc<Reconciler>| {
            error!("Reconciliation error for {}: {}", resource_name, error);
            action_for_error(error)
        }
    };

    let reconcile = {
        let resource_name = resource_name.to_string();
        move |obj: Arc<K>, ctx: Arc<Reconciler>| {
            let reconcile_fn = reconcile_fn.clone();
            let resource_name = resource_name.clone();
            async move {
                debug!("Reconciling {} {:?}", resource_name, obj.meta().name);
                reconcile_fn(ctx, obj).await
            }
        }
    };

    // Debounce batches bursts of events; concurrency caps the parallel
    // reconciles per kind.
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(5);

    Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| {
            let resource_name = resource_name.to_string();
            async move {
                if let Err(e) = res {
                    error!("Controller error for {}: {}", resource_name, e);
                }
            }
        })
        .await;

    Ok(())
}

/// Watches Beskar7 resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    host_api: Api<PhysicalHost>,
    machine_api: Api<Beskar7Machine>,
    cluster_api: Api<Beskar7Cluster>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        host_api: Api<PhysicalHost>,
        machine_api: Api<Beskar7Machine>,
        cluster_api: Api<Beskar7Cluster>,
    ) -> Self {
        Self {
            reconciler,
            host_api,
            machine_api,
            cluster_api,
        }
    }

    /// Starts watching PhysicalHost resources.
    pub async fn watch_physical_hosts(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.host_api.clone(),
            Arc::clone(&self.reconciler),
            |reconciler, resource| {
                Box::pin(async move { reconciler.reconcile_physical_host(&resource).await })
            },
            "PhysicalHost",
        )
        .await
    }

    /// Starts watching Beskar7Machine resources.
    pub async fn watch_machines(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.machine_api.clone(),
            Arc::clone(&self.reconciler),
            |reconciler, resource| {
                Box::pin(async move { reconciler.reconcile_machine(&resource).await })
            },
            "Beskar7Machine",
        )
        .await
    }

    /// Starts watching Beskar7Cluster resources.
    pub async fn watch_clusters(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.cluster_api.clone(),
            Arc::clone(&self.reconciler),
            |reconciler, resource| {
                Box::pin(async move { reconciler.reconcile_cluster(&resource).await })
            },
            "Beskar7Cluster",
        )
        .await
    }
}
