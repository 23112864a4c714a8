//! Leader-elected claim coordination (optional mode)
//!
//! All replicas enqueue claim requests into an in-process priority queue;
//! only the replica holding the coordination.k8s.io Lease drains it, so
//! claims are processed sequentially and the inter-replica optimistic-lock
//! race disappears. On-disk PhysicalHost semantics are identical to the
//! local-optimistic path - the leader runs the exact same
//! [`ClaimCoordinator`].
//!
//! A request parked on a replica that does not obtain (or loses) the
//! lease is handed back to the submitter as [`ClaimError::LeadershipLost`]
//! and retried via the local-optimistic path, so machines make progress
//! regardless of where the lease lives.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use crds::PhysicalHost;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use super::{ClaimCoordinator, ClaimError, ClaimRequest};
use crate::config::LeaderElectionConfig;
use crate::error::is_conflict;

/// Name of the shared claim-coordinator lease.
pub const CLAIM_LEASE_NAME: &str = "beskar7-claim-coordinator";

/// Priority of a pending claim. Older requests and simple hardware rise;
/// repeated retries sink.
pub fn claim_priority(req: &ClaimRequest, now: chrono::DateTime<chrono::Utc>) -> i64 {
    let age_minutes = now
        .signed_duration_since(req.submitted_at)
        .num_minutes()
        .max(0);
    let simple_hardware = req.hardware.as_ref().is_none_or(|h| h.is_empty());
    100 + age_minutes - 5 * i64::from(req.retries) + if simple_hardware { 50 } else { 0 }
}

struct PendingClaim {
    priority: i64,
    seq: u64,
    request: ClaimRequest,
    reply: oneshot::Sender<Result<PhysicalHost, ClaimError>>,
}

impl PartialEq for PendingClaim {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PendingClaim {}

impl PartialOrd for PendingClaim {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Max-heap: higher priority first, then earlier submission.
impl Ord for PendingClaim {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueShared {
    queue: Mutex<BinaryHeap<PendingClaim>>,
    seq: AtomicU64,
    is_leader: AtomicBool,
    wake: Notify,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, BinaryHeap<PendingClaim>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Claim coordinator that serializes claims through the lease holder.
pub struct LeaderElectedCoordinator {
    inner: ClaimCoordinator,
    shared: Arc<QueueShared>,
}

impl std::fmt::Debug for LeaderElectedCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElectedCoordinator")
            .field("is_leader", &self.is_leader())
            .finish_non_exhaustive()
    }
}

impl LeaderElectedCoordinator {
    pub fn new(inner: ClaimCoordinator) -> Self {
        Self {
            inner,
            shared: Arc::new(QueueShared::default()),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.shared.is_leader.load(AtomicOrdering::SeqCst)
    }

    /// Update leadership. Losing the lease cancels all in-flight
    /// coordinator work on this replica: every parked request is handed
    /// back for local retry.
    pub fn set_leader(&self, leader: bool) {
        let was = self.shared.is_leader.swap(leader, AtomicOrdering::SeqCst);
        if was == leader {
            return;
        }
        if leader {
            info!("Acquired claim-coordinator lease, draining queued claims");
            self.shared.wake.notify_one();
        } else {
            info!("Lost claim-coordinator lease, returning queued claims");
            let drained: Vec<PendingClaim> = {
                let mut queue = self.shared.lock();
                std::mem::take(&mut *queue).into_vec()
            };
            for pending in drained {
                // Receiver may have given up already; nothing to do then.
                let _ = pending.reply.send(Err(ClaimError::LeadershipLost));
            }
        }
    }

    /// Enqueue a claim and wait for the leader to process it.
    ///
    /// Waits at most `patience`; a replica that never becomes leader (or
    /// loses the lease) answers `LeadershipLost`, which callers translate
    /// into a local-optimistic retry.
    pub async fn claim(
        &self,
        req: ClaimRequest,
        patience: std::time::Duration,
    ) -> Result<PhysicalHost, ClaimError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.shared.lock();
            let seq = self.shared.seq.fetch_add(1, AtomicOrdering::SeqCst);
            queue.push(PendingClaim {
                priority: claim_priority(&req, Utc::now()),
                seq,
                request: req,
                reply: tx,
            });
        }
        self.shared.wake.notify_one();

        match tokio::time::timeout(patience, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped or patience ran out: hand back for local retry.
            Ok(Err(_)) | Err(_) => Err(ClaimError::LeadershipLost),
        }
    }

    /// Drain loop; run as a background task for the lifetime of the
    /// process. Only pops while this replica holds the lease.
    pub async fn run_drain_loop(&self) {
        loop {
            let pending = if self.is_leader() {
                self.shared.lock().pop()
            } else {
                None
            };

            match pending {
                Some(pending) => {
                    debug!(
                        "Leader processing claim for {} (priority {})",
                        pending.request.machine_id(),
                        pending.priority
                    );
                    let result = self.inner.claim(&pending.request).await;
                    let _ = pending.reply.send(result);
                }
                None => self.shared.wake.notified().await,
            }
        }
    }
}

/// Manages the claim-coordinator Lease and reports leadership changes.
pub struct LeaseManager {
    api: Api<Lease>,
    identity: String,
    config: LeaderElectionConfig,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LeaseManager {
    pub fn new(
        client: Client,
        namespace: &str,
        identity: String,
        config: LeaderElectionConfig,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            identity,
            config,
        }
    }

    fn now_micro() -> MicroTime {
        MicroTime(Utc::now())
    }

    fn lease_expired(&self, spec: &LeaseSpec, now: chrono::DateTime<chrono::Utc>) -> bool {
        let Some(renew) = &spec.renew_time else {
            return true;
        };
        let duration = spec
            .lease_duration_seconds
            .unwrap_or(self.config.lease_duration.as_secs() as i32);
        now.signed_duration_since(renew.0) > chrono::Duration::seconds(i64::from(duration))
    }

    /// One acquire-or-renew round. Returns whether this replica holds the
    /// lease afterwards.
    async fn try_acquire_or_renew(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();
        match self.api.get_opt(CLAIM_LEASE_NAME).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(CLAIM_LEASE_NAME.to_string()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        lease_duration_seconds: Some(
                            self.config.lease_duration.as_secs() as i32
                        ),
                        acquire_time: Some(Self::now_micro()),
                        renew_time: Some(Self::now_micro()),
                        lease_transitions: Some(1),
                        ..Default::default()
                    }),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    // Another replica created it first this round.
                    Err(e) if is_conflict(&e) => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Some(mut lease) => {
                let spec = lease.spec.clone().unwrap_or_default();
                let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());

                if !held_by_us && !self.lease_expired(&spec, now) {
                    return Ok(false);
                }

                let transitions = spec.lease_transitions.unwrap_or(0);
                lease.spec = Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
                    acquire_time: if held_by_us {
                        spec.acquire_time.clone()
                    } else {
                        Some(Self::now_micro())
                    },
                    renew_time: Some(Self::now_micro()),
                    lease_transitions: Some(if held_by_us {
                        transitions
                    } else {
                        transitions + 1
                    }),
                    ..Default::default()
                });

                match self
                    .api
                    .replace(CLAIM_LEASE_NAME, &PostParams::default(), &lease)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(e) if is_conflict(&e) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Run the lease loop forever, pushing leadership changes into the
    /// coordinator. Renewal failures beyond the renew deadline step the
    /// replica down even if the API stays unreachable.
    pub async fn run(&self, coordinator: Arc<LeaderElectedCoordinator>) {
        let mut last_success: Option<std::time::Instant> = None;
        loop {
            match self.try_acquire_or_renew().await {
                Ok(held) => {
                    if held {
                        last_success = Some(std::time::Instant::now());
                    }
                    coordinator.set_leader(held);
                }
                Err(e) => {
                    warn!("Claim-coordinator lease update failed: {}", e);
                    let expired = last_success
                        .is_none_or(|t| t.elapsed() > self.config.renew_deadline);
                    if expired {
                        coordinator.set_leader(false);
                    }
                }
            }
            tokio::time::sleep(self.config.retry_period).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::HardwareRequirements;

    fn request_with(retries: u32, age_minutes: i64, hardware: Option<HardwareRequirements>) -> ClaimRequest {
        let mut req = ClaimRequest::new("metal", "m-1");
        req.retries = retries;
        req.submitted_at = Utc::now() - chrono::Duration::minutes(age_minutes);
        req.hardware = hardware;
        req
    }

    #[test]
    fn priority_favors_age_and_simple_hardware() {
        let now = Utc::now();
        // base 100 + 50 simple-hardware bonus
        assert_eq!(claim_priority(&request_with(0, 0, None), now), 150);
        // + 10 minutes of age
        assert_eq!(claim_priority(&request_with(0, 10, None), now), 160);
        // - 5 per retry
        assert_eq!(claim_priority(&request_with(2, 0, None), now), 140);
        // no bonus with real hardware requirements
        let hw = HardwareRequirements {
            min_cores: Some(8),
            ..Default::default()
        };
        assert_eq!(claim_priority(&request_with(0, 0, Some(hw)), now), 100);
        // empty requirements struct still counts as simple
        assert_eq!(
            claim_priority(&request_with(0, 0, Some(HardwareRequirements::default())), now),
            150
        );
    }

    #[test]
    fn pending_claims_order_by_priority_then_submission() {
        let mut heap = BinaryHeap::new();
        let mk = |priority, seq| {
            let (tx, _rx) = oneshot::channel();
            PendingClaim {
                priority,
                seq,
                request: ClaimRequest::new("metal", "m"),
                reply: tx,
            }
        };
        heap.push(mk(100, 0));
        heap.push(mk(150, 1));
        heap.push(mk(150, 2));
        heap.push(mk(90, 3));

        let order: Vec<(i64, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|p| (p.priority, p.seq))
            .collect();
        assert_eq!(order, vec![(150, 1), (150, 2), (100, 0), (90, 3)]);
    }

    #[tokio::test]
    async fn losing_leadership_returns_parked_requests() {
        use crate::config::RetryConfig;
        use crate::host_store::mem::InMemoryHostStore;

        let store = Arc::new(InMemoryHostStore::new());
        let coordinator = Arc::new(LeaderElectedCoordinator::new(ClaimCoordinator::new(
            store,
            RetryConfig::default(),
        )));

        // Not leader: the request parks, then leadership is explicitly
        // lost and the parked request comes back.
        let pending = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .claim(
                        ClaimRequest::new("metal", "m-1"),
                        std::time::Duration::from_secs(30),
                    )
                    .await
            })
        };

        tokio::task::yield_now().await;
        coordinator.set_leader(true);
        coordinator.set_leader(false);

        let result = pending.await.expect("claim task");
        assert!(matches!(result, Err(ClaimError::LeadershipLost)));
    }
}
