//! Controller configuration
//!
//! Everything is read from the process environment with the `BESKAR7_`
//! prefix. Durations accept humantime strings ("30s", "5m"). Invalid
//! values fail startup; a controller running with a half-parsed config is
//! worse than one that never came up.

use std::env;
use std::time::Duration;

use crate::error::ControllerError;

const PREFIX: &str = "BESKAR7_";

/// Per-call and retry tuning for BMC traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts before an error is treated as exhausted
    pub max_attempts: u32,
    /// First backoff interval
    pub initial_interval: Duration,
    /// Backoff multiplier between attempts
    pub multiplier: f64,
    /// Cap on any single backoff interval
    pub max_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(300),
        }
    }
}

/// Provisioning-queue tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Operations allowed in flight across all BMCs
    pub max_concurrent_ops: usize,
    /// Submissions beyond this are rejected with QueueFull
    pub max_queue_size: usize,
    /// Worker tasks pulling runnable entries
    pub workers: usize,
    /// Minimum gap between two operations on the same BMC
    pub bmc_cooldown_period: Duration,
    /// Deadline for a single queue entry
    pub operation_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ops: 5,
            max_queue_size: 50,
            workers: 3,
            bmc_cooldown_period: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(300),
        }
    }
}

/// Claim-coordinator leader election (optional mode).
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Complete controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Per-call BMC timeout
    pub redfish_timeout: Duration,
    pub retry: RetryConfig,
    /// Deadline for one reconcile pass
    pub reconcile_timeout: Duration,
    /// How long Enrolling/Provisioning may be held before recovery kicks in
    pub stuck_state_timeout: Duration,
    pub queue: QueueConfig,
    pub claim_leader_election: LeaderElectionConfig,
    /// Namespace to watch; None means all namespaces
    pub watch_namespace: Option<String>,
    /// Bind address for the /metrics and /healthz server
    pub metrics_bind_addr: String,
    /// OS families accepted on Beskar7Machine specs
    pub os_families: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redfish_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            reconcile_timeout: Duration::from_secs(120),
            stuck_state_timeout: Duration::from_secs(900),
            queue: QueueConfig::default(),
            claim_leader_election: LeaderElectionConfig::default(),
            watch_namespace: None,
            metrics_bind_addr: "0.0.0.0:8080".to_string(),
            os_families: crds::DEFAULT_OS_FAMILIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    /// for unset variables.
    pub fn from_env() -> Result<Self, ControllerError> {
        let defaults = Config::default();
        Ok(Self {
            redfish_timeout: env_duration("REDFISH_TIMEOUT", defaults.redfish_timeout)?,
            retry: RetryConfig {
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
                initial_interval: env_duration(
                    "RETRY_INITIAL_INTERVAL",
                    defaults.retry.initial_interval,
                )?,
                multiplier: env_parse("RETRY_MULTIPLIER", defaults.retry.multiplier)?,
                max_interval: env_duration("RETRY_MAX_INTERVAL", defaults.retry.max_interval)?,
            },
            reconcile_timeout: env_duration("RECONCILE_TIMEOUT", defaults.reconcile_timeout)?,
            stuck_state_timeout: env_duration(
                "STUCK_STATE_TIMEOUT",
                defaults.stuck_state_timeout,
            )?,
            queue: QueueConfig {
                max_concurrent_ops: env_parse(
                    "PROVISIONING_MAX_CONCURRENT_OPS",
                    defaults.queue.max_concurrent_ops,
                )?,
                max_queue_size: env_parse(
                    "PROVISIONING_MAX_QUEUE_SIZE",
                    defaults.queue.max_queue_size,
                )?,
                workers: env_parse("PROVISIONING_WORKERS", defaults.queue.workers)?,
                bmc_cooldown_period: env_duration(
                    "BMC_COOLDOWN_PERIOD",
                    defaults.queue.bmc_cooldown_period,
                )?,
                operation_timeout: env_duration(
                    "OPERATION_TIMEOUT",
                    defaults.queue.operation_timeout,
                )?,
            },
            claim_leader_election: LeaderElectionConfig {
                enabled: env_parse(
                    "ENABLE_CLAIM_COORDINATOR_LEADER_ELECTION",
                    defaults.claim_leader_election.enabled,
                )?,
                lease_duration: env_duration(
                    "CLAIM_COORDINATOR_LEASE_DURATION",
                    defaults.claim_leader_election.lease_duration,
                )?,
                renew_deadline: env_duration(
                    "RENEW_DEADLINE",
                    defaults.claim_leader_election.renew_deadline,
                )?,
                retry_period: env_duration(
                    "RETRY_PERIOD",
                    defaults.claim_leader_election.retry_period,
                )?,
            },
            watch_namespace: env::var(format!("{PREFIX}WATCH_NAMESPACE"))
                .ok()
                .filter(|s| !s.is_empty()),
            metrics_bind_addr: env::var(format!("{PREFIX}METRICS_BIND_ADDR"))
                .unwrap_or(defaults.metrics_bind_addr),
            os_families: match env::var(format!("{PREFIX}OS_FAMILIES")) {
                Ok(families) => {
                    let parsed: Vec<String> = families
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                    if parsed.is_empty() {
                        return Err(ControllerError::InvalidConfig(format!(
                            "{PREFIX}OS_FAMILIES must name at least one OS family"
                        )));
                    }
                    parsed
                }
                Err(_) => defaults.os_families,
            },
        })
    }

    /// Whether `family` is in the accepted OS family set
    /// (case-insensitive, matching the schema's free-form string).
    pub fn accepts_os_family(&self, family: &str) -> bool {
        self.os_families
            .iter()
            .any(|f| f.eq_ignore_ascii_case(family))
    }
}

fn env_duration(name: &str, default: Duration) -> Result<Duration, ControllerError> {
    match env::var(format!("{PREFIX}{name}")) {
        Ok(raw) => humantime::parse_duration(&raw).map_err(|e| {
            ControllerError::InvalidConfig(format!("{PREFIX}{name}={raw}: {e}"))
        }),
        Err(_) => Ok(default),
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ControllerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(format!("{PREFIX}{name}")) {
        Ok(raw) => raw.parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{PREFIX}{name}={raw}: {e}"))
        }),
        Err(_) => Ok(default),
    }
}
