//! Beskar7 Controller
//!
//! Cluster API infrastructure provider for bare-metal servers managed
//! over Redfish. One process reconciles three CRD kinds:
//! - PhysicalHost: enrollment, heartbeats, deprovisioning
//! - Beskar7Machine: host claim, boot configuration, readiness
//! - Beskar7Cluster: control-plane endpoint and failure domains
//!
//! The host-claim coordinator and the provisioning queue (per-BMC
//! serialization with cooldown) live in this process; all shared state is
//! persisted in the PhysicalHost objects themselves.

mod backoff;
mod config;
mod controller;
mod coordinator;
mod error;
mod host_store;
mod metrics;
mod queue;
mod reconcile_helpers;
mod reconciler;
mod state_machine;
mod test_utils;
mod watcher;

use controller::Controller;
use error::ControllerError;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Beskar7 controller");

    // Invalid configuration is a startup failure, surfaced as a non-zero
    // exit before any watcher comes up.
    let config = config::Config::from_env()?;
    info!("Configuration:");
    info!(
        "  Namespace: {}",
        config.watch_namespace.as_deref().unwrap_or("all namespaces")
    );
    info!(
        "  Provisioning queue: {} workers, {} max concurrent, size {}",
        config.queue.workers, config.queue.max_concurrent_ops, config.queue.max_queue_size
    );
    info!(
        "  Claim coordinator leader election: {}",
        config.claim_leader_election.enabled
    );
    info!("  OS families: {:?}", config.os_families);

    let metrics_addr = config.metrics_bind_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(&metrics_addr).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
