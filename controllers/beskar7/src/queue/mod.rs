//! Provisioning queue
//!
//! A bounded priority queue feeding a worker pool that talks to BMCs.
//! Operations on the same BMC are strictly serial and separated by a
//! cooldown; operations on different BMCs run in parallel up to the
//! configured ceiling. Entries carry a deadline and a cooperative
//! cancellation handle. Duplicate submissions for the same host and
//! operation kind are folded into the pending entry.

mod execute;

pub use execute::{BootParamPlan, Operation, OpOutcome};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use redfish_client::RedfishClientTrait;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::metrics;

/// Operation kinds, in ascending priority:
/// deprovision < health < provision < claim. Deprovisioning of a host
/// that is being deleted is promoted to provision priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Pre-claim BMC validation; highest priority when used
    #[allow(dead_code)] // Reserved: claims are pure API writes today
    Claim,
    Provision,
    Health,
    Deprovision,
}

impl OpKind {
    fn priority(self, host_deleting: bool) -> u8 {
        match self {
            OpKind::Claim => 3,
            OpKind::Provision => 2,
            OpKind::Health => 1,
            OpKind::Deprovision if host_deleting => 2,
            OpKind::Deprovision => 0,
        }
    }

    fn label(self) -> &'static str {
        match self {
            OpKind::Claim => "claim",
            OpKind::Provision => "provision",
            OpKind::Health => "health",
            OpKind::Deprovision => "deprovision",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a queue entry did not produce an outcome.
#[derive(Debug, Error)]
pub enum OpError {
    /// The BMC call failed; classification inside
    #[error(transparent)]
    Redfish(#[from] redfish_client::RedfishError),

    /// Deadline hit and the retry budget is spent
    #[error("operation deadline exceeded after {retries} retries")]
    Timeout { retries: u32 },

    /// The submitter cancelled; any in-flight result was discarded
    #[error("operation cancelled")]
    Cancelled,
}

/// Result delivered through an [`OpHandle`].
pub type OpResult = Result<OpOutcome, OpError>;

/// A submission the queue accepted.
#[derive(Debug)]
pub enum Submitted {
    /// New entry; await its result on the handle
    Accepted(OpHandle),
    /// Same host and kind already pending or in flight; nothing new queued
    Duplicate,
}

/// Submission failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue is at capacity; re-reconcile later rather than fail
    #[error("provisioning queue is full")]
    QueueFull,

    /// The queue has been shut down
    #[error("provisioning queue is shut down")]
    ShutDown,
}

/// Handle returned to submitters: await the result, or cancel.
#[derive(Debug)]
pub struct OpHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    result: oneshot::Receiver<OpResult>,
    wake: Arc<Notify>,
}

impl OpHandle {
    /// Cooperative cancel: a queued entry is dropped; an in-flight BMC
    /// call is abandoned at its next await point, its result discarded
    /// and the BMC slot released.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Wait for the operation to finish.
    pub async fn wait(self) -> OpResult {
        match self.result.await {
            Ok(result) => result,
            // Queue dropped the sender (shutdown).
            Err(_) => Err(OpError::Cancelled),
        }
    }
}

/// One entry to execute against a BMC.
pub struct QueueEntry {
    /// namespace/name of the PhysicalHost this operates on
    pub host_id: String,
    pub kind: OpKind,
    /// Serialization key: one in-flight operation per BMC address
    pub bmc_address: String,
    /// Promotes deprovision priority when set
    pub host_deleting: bool,
    /// Client used to execute the operation
    pub client: Arc<dyn RedfishClientTrait>,
    pub operation: Operation,
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("host_id", &self.host_id)
            .field("kind", &self.kind)
            .field("bmc_address", &self.bmc_address)
            .field("host_deleting", &self.host_deleting)
            .finish_non_exhaustive()
    }
}

struct PendingEntry {
    id: u64,
    seq: u64,
    priority: u8,
    deadline: Instant,
    retries: u32,
    entry: QueueEntry,
    cancelled: Arc<AtomicBool>,
    reply: oneshot::Sender<OpResult>,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<PendingEntry>,
    /// BMCs with an operation in flight
    busy: std::collections::HashSet<String>,
    /// When the last operation on each BMC finished
    last_finished: HashMap<String, Instant>,
    in_flight: usize,
    /// Dedupe index: (host, kind) -> entry id
    keyed: HashMap<(String, OpKind), u64>,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Arc<Notify>,
    config: QueueConfig,
    retry_budget: u32,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    stopped: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The process-wide provisioning queue. Explicit init at manager startup,
/// explicit shutdown on exit.
pub struct ProvisioningQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProvisioningQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningQueue")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl ProvisioningQueue {
    /// Create the queue. Call [`Self::start`] to spawn the workers.
    pub fn new(config: QueueConfig, retry_budget: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                wake: Arc::new(Notify::new()),
                config,
                retry_budget,
                next_id: AtomicU64::new(1),
                next_seq: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool.
    pub fn start(&self) {
        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.shared.config.workers {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(worker_loop(shared, worker_id)));
        }
        info!(
            "Provisioning queue started: {} workers, {} max concurrent ops, cooldown {:?}",
            self.shared.config.workers,
            self.shared.config.max_concurrent_ops,
            self.shared.config.bmc_cooldown_period
        );
    }

    /// Stop the workers. Pending entries are answered with Cancelled.
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let drained: Vec<PendingEntry> = {
            let mut state = self.shared.lock();
            state.keyed.clear();
            std::mem::take(&mut state.pending)
        };
        metrics::QUEUE_DEPTH.set(0);
        for entry in drained {
            let _ = entry.reply.send(Err(OpError::Cancelled));
        }
        self.shared.wake.notify_waiters();
    }

    /// Submit an operation.
    ///
    /// Bounded: at `max_queue_size` pending entries the submission is
    /// rejected with `QueueFull` and the caller requeues its reconcile.
    pub fn submit(&self, entry: QueueEntry) -> Result<Submitted, SubmitError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(SubmitError::ShutDown);
        }

        let mut state = self.shared.lock();

        let key = (entry.host_id.clone(), entry.kind);
        if state.keyed.contains_key(&key) {
            debug!(
                "Duplicate {} submission for {} folded into pending entry",
                entry.kind, entry.host_id
            );
            return Ok(Submitted::Duplicate);
        }

        if state.pending.len() >= self.shared.config.max_queue_size {
            metrics::QUEUE_REJECTED.inc();
            return Err(SubmitError::QueueFull);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();

        let priority = entry.kind.priority(entry.host_deleting);
        debug!(
            "Queued {} for {} on {} (priority {}, id {})",
            entry.kind, entry.host_id, entry.bmc_address, priority, id
        );
        state.keyed.insert(key, id);
        state.pending.push(PendingEntry {
            id,
            seq,
            priority,
            deadline: Instant::now() + self.shared.config.operation_timeout,
            retries: 0,
            entry,
            cancelled: Arc::clone(&cancelled),
            reply: tx,
        });
        metrics::QUEUE_DEPTH.set(state.pending.len() as i64);
        drop(state);

        self.shared.wake.notify_waiters();
        Ok(Submitted::Accepted(OpHandle {
            id,
            cancelled,
            result: rx,
            wake: Arc::clone(&self.shared.wake),
        }))
    }

    /// Pending entries right now (excludes in-flight work).
    #[allow(dead_code)] // Diagnostic accessor, exercised by the queue tests
    pub fn depth(&self) -> usize {
        self.shared.lock().pending.len()
    }
}

/// Select the best runnable entry, marking its BMC busy.
///
/// Runnable: not cancelled, BMC idle, cooldown elapsed, in-flight below
/// the global ceiling. Highest priority wins; ties go to the earliest
/// submission.
fn take_runnable(shared: &Shared, state: &mut QueueState, now: Instant) -> Option<PendingEntry> {
    // Cancelled entries are dropped eagerly so they never hold dedupe keys.
    let mut index = 0;
    while index < state.pending.len() {
        if state.pending[index].cancelled.load(Ordering::SeqCst) {
            let dropped = state.pending.swap_remove(index);
            state
                .keyed
                .remove(&(dropped.entry.host_id.clone(), dropped.entry.kind));
            metrics::QUEUE_OPS
                .with_label_values(&[dropped.entry.kind.label(), "cancelled"])
                .inc();
            let _ = dropped.reply.send(Err(OpError::Cancelled));
        } else {
            index += 1;
        }
    }
    metrics::QUEUE_DEPTH.set(state.pending.len() as i64);

    if state.in_flight >= shared.config.max_concurrent_ops {
        return None;
    }

    let cooldown = shared.config.bmc_cooldown_period;
    let mut best: Option<usize> = None;
    for (index, pending) in state.pending.iter().enumerate() {
        let bmc = &pending.entry.bmc_address;
        if state.busy.contains(bmc) {
            continue;
        }
        if let Some(finished) = state.last_finished.get(bmc) {
            if now.duration_since(*finished) < cooldown {
                continue;
            }
        }
        match best {
            None => best = Some(index),
            Some(current) => {
                let cur = &state.pending[current];
                if pending.priority > cur.priority
                    || (pending.priority == cur.priority && pending.seq < cur.seq)
                {
                    best = Some(index);
                }
            }
        }
    }

    let index = best?;
    let entry = state.pending.swap_remove(index);
    state.busy.insert(entry.entry.bmc_address.clone());
    state.in_flight += 1;
    metrics::QUEUE_DEPTH.set(state.pending.len() as i64);
    Some(entry)
}

/// The earliest instant at which a currently blocked entry could become
/// runnable or expire, used to park idle workers precisely.
fn next_wake(shared: &Shared, state: &QueueState, now: Instant) -> Option<Instant> {
    let cooldown = shared.config.bmc_cooldown_period;
    state
        .pending
        .iter()
        .filter_map(|p| {
            let cooldown_ready = state
                .last_finished
                .get(&p.entry.bmc_address)
                .map(|finished| *finished + cooldown);
            let candidates = [cooldown_ready, Some(p.deadline)];
            candidates.into_iter().flatten().min()
        })
        .min()
        .map(|instant| instant.max(now))
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    debug!("Provisioning worker {} started", worker_id);
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }

        let now = Instant::now();
        let (runnable, wake_at) = {
            let mut state = shared.lock();
            expire_overdue(&shared, &mut state, now);
            let runnable = take_runnable(&shared, &mut state, now);
            let wake_at = if runnable.is_none() {
                next_wake(&shared, &state, now)
            } else {
                None
            };
            (runnable, wake_at)
        };

        match runnable {
            Some(pending) => run_entry(&shared, pending).await,
            None => {
                // Park until notified, the next cooldown/deadline instant,
                // or a short backstop tick; a submit racing the Notify
                // registration is then picked up on the next pass.
                let backstop = Duration::from_millis(250);
                let sleep_for = wake_at
                    .map(|instant| instant.saturating_duration_since(now).min(backstop))
                    .unwrap_or(backstop);
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
        }
    }
    debug!("Provisioning worker {} stopped", worker_id);
}

/// Fail or requeue entries whose deadline passed while they waited.
fn expire_overdue(shared: &Shared, state: &mut QueueState, now: Instant) {
    let mut index = 0;
    while index < state.pending.len() {
        if state.pending[index].deadline > now {
            index += 1;
            continue;
        }
        let mut overdue = state.pending.swap_remove(index);
        overdue.retries += 1;
        if overdue.retries <= shared.retry_budget {
            debug!(
                "Entry {} for {} missed its deadline while queued, requeueing (retry {})",
                overdue.id, overdue.entry.host_id, overdue.retries
            );
            overdue.deadline = now + shared.config.operation_timeout;
            // swap_remove moved an unexamined entry into `index`; the
            // requeued entry lands at the back with a future deadline.
            state.pending.push(overdue);
        } else {
            warn!(
                "Entry {} for {} exhausted its deadline budget in the queue",
                overdue.id, overdue.entry.host_id
            );
            state
                .keyed
                .remove(&(overdue.entry.host_id.clone(), overdue.entry.kind));
            metrics::QUEUE_OPS
                .with_label_values(&[overdue.entry.kind.label(), "timeout"])
                .inc();
            let retries = overdue.retries;
            let _ = overdue.reply.send(Err(OpError::Timeout { retries }));
        }
    }
    metrics::QUEUE_DEPTH.set(state.pending.len() as i64);
}

async fn run_entry(shared: &Shared, mut pending: PendingEntry) {
    let bmc = pending.entry.bmc_address.clone();
    let kind = pending.entry.kind;
    let host_id = pending.entry.host_id.clone();
    let now = Instant::now();
    let remaining = pending.deadline.saturating_duration_since(now);

    debug!(
        "Executing {} for {} on {} ({}s left)",
        kind,
        host_id,
        bmc,
        remaining.as_secs()
    );

    let cancelled = Arc::clone(&pending.cancelled);
    let cancel_wake = Arc::clone(&shared.wake);
    let outcome = tokio::select! {
        result = tokio::time::timeout(
            remaining,
            execute::run(&pending.entry.client, &pending.entry.operation),
        ) => match result {
            Ok(done) => Outcome::Finished(done),
            Err(_) => Outcome::DeadlineHit,
        },
        _ = wait_for_cancel(&cancelled, &cancel_wake) => Outcome::Cancelled,
    };

    // Release the BMC slot and stamp the cooldown clock before answering
    // the submitter.
    {
        let mut state = shared.lock();
        state.busy.remove(&bmc);
        state.last_finished.insert(bmc.clone(), Instant::now());
        state.in_flight -= 1;
    }

    match outcome {
        Outcome::Finished(result) => {
            let label = if result.is_ok() { "ok" } else { "error" };
            metrics::QUEUE_OPS.with_label_values(&[kind.label(), label]).inc();
            finish(shared, pending, result.map_err(OpError::Redfish));
        }
        Outcome::Cancelled => {
            metrics::QUEUE_OPS
                .with_label_values(&[kind.label(), "cancelled"])
                .inc();
            finish(shared, pending, Err(OpError::Cancelled));
        }
        Outcome::DeadlineHit => {
            pending.retries += 1;
            if pending.retries <= shared.retry_budget {
                debug!(
                    "{} for {} hit its deadline, requeueing (retry {})",
                    kind, host_id, pending.retries
                );
                pending.deadline = Instant::now() + shared.config.operation_timeout;
                let mut state = shared.lock();
                state.pending.push(pending);
                metrics::QUEUE_DEPTH.set(state.pending.len() as i64);
            } else {
                metrics::QUEUE_OPS
                    .with_label_values(&[kind.label(), "timeout"])
                    .inc();
                let retries = pending.retries;
                finish(shared, pending, Err(OpError::Timeout { retries }));
            }
        }
    }

    shared.wake.notify_waiters();
}

enum Outcome {
    Finished(Result<OpOutcome, redfish_client::RedfishError>),
    Cancelled,
    DeadlineHit,
}

async fn wait_for_cancel(flag: &AtomicBool, wake: &Notify) {
    loop {
        // Register interest before checking the flag so a cancel landing
        // in between is not lost.
        let mut notified = std::pin::pin!(wake.notified());
        notified.as_mut().enable();
        if flag.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

fn finish(shared: &Shared, pending: PendingEntry, result: OpResult) {
    {
        let mut state = shared.lock();
        state
            .keyed
            .remove(&(pending.entry.host_id.clone(), pending.entry.kind));
    }
    let _ = pending.reply.send(result);
}
