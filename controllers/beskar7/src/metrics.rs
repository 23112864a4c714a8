//! Prometheus metrics and the probes endpoint
//!
//! Counters for the claim coordinator and the provisioning queue, served
//! together with a liveness probe on the configured bind address.

use std::sync::LazyLock;

use axum::{Router, http::StatusCode, routing::get};
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::info;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static CLAIM_ATTEMPTS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_counter("beskar7_claim_attempts_total", "Host claim attempts")
});

pub static CLAIM_CONFLICTS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_counter(
        "beskar7_claim_conflicts_total",
        "Optimistic-lock conflicts during host claims",
    )
});

pub static CLAIMS_SUCCEEDED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_counter("beskar7_claims_succeeded_total", "Successful host claims")
});

pub static HOSTS_RELEASED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_counter("beskar7_hosts_released_total", "Host releases")
});

pub static QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::with_opts(Opts::new(
        "beskar7_provisioning_queue_depth",
        "Entries waiting in the provisioning queue",
    ))
    .unwrap_or_else(|e| panic!("queue depth gauge: {e}"));
    REGISTRY
        .register(Box::new(gauge.clone()))
        .unwrap_or_else(|e| panic!("register queue depth gauge: {e}"));
    gauge
});

pub static QUEUE_OPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counters = IntCounterVec::new(
        Opts::new(
            "beskar7_provisioning_ops_total",
            "Provisioning queue operations by kind and outcome",
        ),
        &["kind", "outcome"],
    )
    .unwrap_or_else(|e| panic!("queue ops counter: {e}"));
    REGISTRY
        .register(Box::new(counters.clone()))
        .unwrap_or_else(|e| panic!("register queue ops counter: {e}"));
    counters
});

pub static QUEUE_REJECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_counter(
        "beskar7_provisioning_queue_rejected_total",
        "Submissions rejected because the queue was full",
    )
});

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|e| panic!("counter {name}: {e}"));
    REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap_or_else(|e| panic!("register {name}: {e}"));
    counter
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Serve /metrics and /healthz until the process exits.
pub async fn serve(bind_addr: &str) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Metrics server listening on {}", bind_addr);
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_once() {
        CLAIM_ATTEMPTS.inc();
        CLAIM_CONFLICTS.inc();
        QUEUE_DEPTH.set(3);
        QUEUE_OPS.with_label_values(&["provision", "ok"]).inc();
        assert!(CLAIM_ATTEMPTS.get() >= 1);
        assert_eq!(QUEUE_DEPTH.get(), 3);
    }
}
