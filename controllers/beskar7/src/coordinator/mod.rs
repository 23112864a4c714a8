//! Host-claim coordinator
//!
//! Matches machine requests to Available hosts. Selection is deterministic
//! (sorted candidates, hash-derived start index) so two controller
//! replicas reconciling the same machine prefer the same host, while
//! different machines spread across the pool. The claim itself is a
//! conditional write on the host's resource version; losers re-read and
//! retry with exponential backoff before moving to the next candidate.

pub mod leader;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use crds::{
    ConsumerRef, HardwareDetails, HardwareRequirements, HostState, PhysicalHost,
    ANNOTATION_CLAIMED_AT, ANNOTATION_CLAIMED_BY,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::RetryConfig;
use crate::host_store::{HostStore, HostStoreError};
use crate::metrics;
use crate::state_machine;

/// A request to claim one host for a machine.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Name of the requesting Beskar7Machine
    pub machine_name: String,
    /// Namespace of the machine (hosts are claimed in the same namespace)
    pub namespace: String,
    /// Hardware minima the host must satisfy
    pub hardware: Option<HardwareRequirements>,
    /// Labels a candidate host must carry
    pub selector: BTreeMap<String, String>,
    /// Claim attempts already made for this machine
    pub retries: u32,
    /// When the machine first asked for a host
    pub submitted_at: chrono::DateTime<chrono::Utc>,
}

impl ClaimRequest {
    pub fn new(namespace: &str, machine_name: &str) -> Self {
        Self {
            machine_name: machine_name.to_string(),
            namespace: namespace.to_string(),
            hardware: None,
            selector: BTreeMap::new(),
            retries: 0,
            submitted_at: Utc::now(),
        }
    }

    /// Namespace/name identity used for the deterministic start index.
    pub fn machine_id(&self) -> String {
        format!("{}/{}", self.namespace, self.machine_name)
    }
}

/// Typed claim failures.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// No Available host satisfies the request
    #[error("no available host for {0}")]
    NoAvailableHost(String),

    /// Conflict retries exhausted on every candidate
    #[error("optimistic lock conflict claiming {0}")]
    OptimisticLockConflict(String),

    /// The replica lost the claim-coordinator lease mid-request
    #[error("claim coordinator leadership lost")]
    LeadershipLost,

    /// Store failure outside the conflict protocol
    #[error(transparent)]
    Store(#[from] HostStoreError),
}

/// Outcome of a single candidate attempt, internal to the probe loop.
enum AttemptOutcome {
    Claimed(Box<PhysicalHost>),
    /// Someone else owns it now; move to the next candidate
    AlreadyClaimed,
    /// Conflict retries exhausted on this candidate
    ConflictExhausted,
}

/// FNV-1a over the machine identity; stable across restarts and replicas.
fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Index of the first candidate tried for a machine, given `n` candidates.
pub fn start_index(machine_id: &str, n: usize) -> usize {
    debug_assert!(n > 0);
    (fnv1a(machine_id) % n as u64) as usize
}

/// Whether a host's inventory satisfies the requested minima.
///
/// A stated minimum against missing inventory is a non-match; claiming a
/// host whose capacity is unknown would defeat the requirement.
pub fn hardware_matches(details: Option<&HardwareDetails>, req: Option<&HardwareRequirements>) -> bool {
    let Some(req) = req else { return true };
    if req.is_empty() {
        return true;
    }
    let Some(details) = details else { return false };
    if let Some(min) = req.min_cores {
        if details.cpu_cores.is_none_or(|c| c < min) {
            return false;
        }
    }
    if let Some(min) = req.min_memory_gib {
        if details.memory_gib.is_none_or(|m| m < min) {
            return false;
        }
    }
    if let Some(min) = req.min_disk_gib {
        if details.disk_gib.is_none_or(|d| d < min) {
            return false;
        }
    }
    true
}

fn labels_match(host: &PhysicalHost, selector: &BTreeMap<String, String>) -> bool {
    if selector.is_empty() {
        return true;
    }
    let labels = match &host.metadata.labels {
        Some(labels) => labels,
        None => return false,
    };
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|have| have == v))
}

/// The local-optimistic claim coordinator.
#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn HostStore>,
    retry: RetryConfig,
}

impl std::fmt::Debug for ClaimCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimCoordinator")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn HostStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Candidates for the request: Available, unclaimed, hardware and
    /// selector satisfied, sorted by namespace/name for restart-stable
    /// order.
    async fn candidates(&self, req: &ClaimRequest) -> Result<Vec<PhysicalHost>, ClaimError> {
        let mut hosts: Vec<PhysicalHost> = self
            .store
            .list(&req.namespace)
            .await?
            .into_iter()
            .filter(|h| h.is_available())
            .filter(|h| {
                hardware_matches(
                    h.status.as_ref().and_then(|s| s.hardware_details.as_ref()),
                    req.hardware.as_ref(),
                )
            })
            .filter(|h| labels_match(h, &req.selector))
            .collect();
        hosts.sort_by_key(PhysicalHost::host_id);
        Ok(hosts)
    }

    /// Claim a host for the request.
    ///
    /// On success the returned host carries the consumer reference, the
    /// claim annotations and state Claimed.
    pub async fn claim(&self, req: &ClaimRequest) -> Result<PhysicalHost, ClaimError> {
        metrics::CLAIM_ATTEMPTS.inc();
        let candidates = self.candidates(req).await?;
        if candidates.is_empty() {
            debug!(
                "No claimable host in {} for machine {}",
                req.namespace, req.machine_name
            );
            return Err(ClaimError::NoAvailableHost(req.machine_id()));
        }

        let start = start_index(&req.machine_id(), candidates.len());
        let mut conflicts_exhausted = false;

        for offset in 0..candidates.len() {
            let candidate = &candidates[(start + offset) % candidates.len()];
            let host_name = candidate.metadata.name.as_deref().unwrap_or_default();

            match self.attempt_claim(req, host_name).await? {
                AttemptOutcome::Claimed(host) => {
                    metrics::CLAIMS_SUCCEEDED.inc();
                    info!(
                        "Machine {} claimed host {}/{}",
                        req.machine_name, req.namespace, host_name
                    );
                    return Ok(*host);
                }
                AttemptOutcome::AlreadyClaimed => {
                    debug!(
                        "Host {}/{} taken before machine {} got it, trying next",
                        req.namespace, host_name, req.machine_name
                    );
                }
                AttemptOutcome::ConflictExhausted => {
                    conflicts_exhausted = true;
                }
            }
        }

        if conflicts_exhausted {
            Err(ClaimError::OptimisticLockConflict(req.machine_id()))
        } else {
            Err(ClaimError::NoAvailableHost(req.machine_id()))
        }
    }

    /// One candidate: re-read, re-validate, conditionally write. Conflicts
    /// retry with 1s, 2s, 4s... backoff up to the configured attempt
    /// budget.
    async fn attempt_claim(
        &self,
        req: &ClaimRequest,
        host_name: &str,
    ) -> Result<AttemptOutcome, ClaimError> {
        let mut backoff = ExponentialBackoff::from_retry_config(&self.retry);

        for attempt in 0..self.retry.max_attempts {
            let mut host = match self.store.get(&req.namespace, host_name).await {
                Ok(host) => host,
                Err(HostStoreError::NotFound(_)) => return Ok(AttemptOutcome::AlreadyClaimed),
                Err(e) => return Err(e.into()),
            };

            if !host.is_available() {
                return Ok(AttemptOutcome::AlreadyClaimed);
            }

            host.spec.consumer_ref = Some(ConsumerRef::machine(&req.namespace, &req.machine_name));
            let annotations = host.metadata.annotations.get_or_insert_with(BTreeMap::new);
            annotations.insert(ANNOTATION_CLAIMED_AT.to_string(), Utc::now().to_rfc3339());
            annotations.insert(ANNOTATION_CLAIMED_BY.to_string(), req.machine_name.clone());

            match self.store.update(&host).await {
                Ok(written) => {
                    let claimed = self.mark_claimed(written).await?;
                    return Ok(AttemptOutcome::Claimed(Box::new(claimed)));
                }
                Err(HostStoreError::Conflict(_)) => {
                    metrics::CLAIM_CONFLICTS.inc();
                    warn!(
                        "Claim conflict on {}/{} for machine {} (attempt {})",
                        req.namespace,
                        host_name,
                        req.machine_name,
                        attempt + 1
                    );
                    tokio::time::sleep(backoff.next_backoff()).await;
                }
                Err(HostStoreError::NotFound(_)) => return Ok(AttemptOutcome::AlreadyClaimed),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(AttemptOutcome::ConflictExhausted)
    }

    /// Record the Available -> Claimed transition on the freshly written
    /// host. A conflict here means another actor already advanced the
    /// host; the claim itself has landed, so retry once from a fresh read
    /// and otherwise leave convergence to the host reconciler.
    async fn mark_claimed(&self, mut host: PhysicalHost) -> Result<PhysicalHost, ClaimError> {
        for _ in 0..2 {
            let mut status = host.status.clone().unwrap_or_default();
            if status.state == HostState::Claimed {
                return Ok(host);
            }
            if let Err(e) =
                state_machine::apply_transition(&mut status, &host.spec, HostState::Claimed, Utc::now())
            {
                warn!("Claimed host left in state {}: {}", status.state, e);
                return Ok(host);
            }
            host.status = Some(status);
            match self.store.update_status(&host).await {
                Ok(written) => return Ok(written),
                Err(HostStoreError::Conflict(_)) => {
                    let namespace = host.metadata.namespace.clone().unwrap_or_default();
                    let name = host.metadata.name.clone().unwrap_or_default();
                    host = self.store.get(&namespace, &name).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(host)
    }

    /// Release the host owned by `machine_name`, restoring it to Available.
    ///
    /// Idempotent: releasing an unclaimed host, or one claimed by someone
    /// else, changes nothing and succeeds.
    pub async fn release(
        &self,
        namespace: &str,
        host_name: &str,
        machine_name: &str,
    ) -> Result<(), ClaimError> {
        let mut backoff = ExponentialBackoff::from_retry_config(&self.retry);

        for _ in 0..self.retry.max_attempts {
            let mut host = match self.store.get(namespace, host_name).await {
                Ok(host) => host,
                Err(HostStoreError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let owned_by_machine = host
                .spec
                .consumer_ref
                .as_ref()
                .is_some_and(|c| c.matches(namespace, machine_name));
            let has_claim_annotations = host
                .metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key(ANNOTATION_CLAIMED_AT) || a.contains_key(ANNOTATION_CLAIMED_BY));

            if !owned_by_machine {
                if host.spec.consumer_ref.is_none() && !has_claim_annotations {
                    debug!("Release of {namespace}/{host_name}: nothing to do");
                }
                return Ok(());
            }

            host.spec.consumer_ref = None;
            host.spec.boot_iso_source = None;
            if let Some(annotations) = host.metadata.annotations.as_mut() {
                annotations.remove(ANNOTATION_CLAIMED_AT);
                annotations.remove(ANNOTATION_CLAIMED_BY);
            }

            match self.store.update(&host).await {
                Ok(written) => {
                    metrics::HOSTS_RELEASED.inc();
                    self.mark_released(written).await?;
                    info!("Released host {namespace}/{host_name} from machine {machine_name}");
                    return Ok(());
                }
                Err(HostStoreError::Conflict(_)) => {
                    tokio::time::sleep(backoff.next_backoff()).await;
                }
                Err(HostStoreError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        Err(ClaimError::OptimisticLockConflict(format!(
            "{namespace}/{host_name}"
        )))
    }

    /// Move a just-released host back toward Available. Release from
    /// mid-provisioning has no legal direct path, so it goes through
    /// Error and the host reconciler brings it back once healthy.
    async fn mark_released(&self, mut host: PhysicalHost) -> Result<(), ClaimError> {
        let mut status = host.status.clone().unwrap_or_default();
        let target = match status.state {
            HostState::Claimed | HostState::Provisioned => HostState::Available,
            HostState::Provisioning => HostState::Error,
            _ => return Ok(()),
        };
        if target == HostState::Error {
            status.error_message = Some("released while provisioning".to_string());
        }
        if let Err(e) = state_machine::apply_transition(&mut status, &host.spec, target, Utc::now())
        {
            warn!("Released host left in state {}: {}", status.state, e);
            return Ok(());
        }
        host.status = Some(status);
        match self.store.update_status(&host).await {
            Ok(_) => Ok(()),
            Err(HostStoreError::Conflict(_)) | Err(HostStoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub mod coordinator_test;
