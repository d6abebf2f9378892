//! The job scheduler: one event loop that owns every worker and the backlog.
//!
//! All scheduler state lives inside a single task and is only touched from
//! its loop, so none of it needs a lock. Everything else talks to the loop by
//! sending [`SchedulerMessage`]s:
//!
//! * callers submit work items,
//! * workers announce `Ready`, `Error`, `JobDone` and `Exiting`,
//! * check-in lookups report back when an endpoint is next expected online.
//!
//! After each message the loop runs one scheduling pass:
//!
//! 1. hand the next backlog item to every idle worker that has one,
//! 2. if endpoints without a worker still have a backlog, retire idle
//!    workers with nothing to do until there is room,
//! 3. spawn workers for as many waiting endpoints as capacity allows,
//!    soonest expected check-in first,
//! 4. run step 1 once more.
//!
//! Invariants the loop maintains: at most one worker per endpoint, at most
//! `max_workers` workers (retiring ones included), and items for one
//! endpoint are started in submission order.
//!
//! Spawning never blocks the loop. A worker that fails to establish its
//! session puts its endpoint into exponential backoff; after
//! `max_spawn_failures` consecutive failures the endpoint's backlog is failed
//! with `CbError::WorkerUnavailable`. Check-in lookups run in their own
//! tasks and post their answer back as a message.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::LrBackend;
use crate::config::LrConfig;
use crate::error::CbError;
use crate::job::WorkItem;
use crate::worker::{JobWorker, WorkerCommand, WorkerHandle, WorkerStatus};

/// Upper bound on the delay between spawn attempts for one endpoint.
const MAX_SPAWN_BACKOFF: Duration = Duration::from_secs(60);

/// Messages accepted by the scheduler loop.
#[derive(Debug)]
pub(crate) enum SchedulerMessage {
    /// A new work item from a caller.
    Submit(WorkItem),
    /// A worker finished a job and is idle again.
    JobDone { endpoint_id: String },
    /// A worker changed lifecycle state.
    Worker {
        endpoint_id: String,
        status: WorkerStatus,
    },
    /// Result of a background check-in lookup.
    Checkin {
        endpoint_id: String,
        next_checkin: Option<DateTime<Utc>>,
    },
    /// Request for a point-in-time view of the scheduler.
    Snapshot(oneshot::Sender<SchedulerSnapshot>),
}

/// Point-in-time view of the scheduler, for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    /// Endpoints that currently have a worker, sorted.
    pub workers: Vec<String>,
    /// Endpoints whose worker is idle, sorted.
    pub idle: Vec<String>,
    /// Queued (not yet started) items per endpoint.
    pub backlog: HashMap<String, usize>,
}

/// The caller's side of a running scheduler.
#[derive(Debug)]
pub(crate) struct SchedulerHandle {
    pub(crate) tx: mpsc::UnboundedSender<SchedulerMessage>,
    pub(crate) join: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct SpawnFailures {
    count: u32,
    retry_at: Instant,
}

pub(crate) struct JobScheduler {
    backend: Arc<dyn LrBackend>,
    config: Arc<LrConfig>,
    tx: mpsc::UnboundedSender<SchedulerMessage>,
    rx: mpsc::UnboundedReceiver<SchedulerMessage>,
    cancel: CancellationToken,

    workers: HashMap<String, WorkerHandle>,
    idle: HashSet<String>,
    retiring: HashSet<String>,

    backlog: HashMap<String, VecDeque<WorkItem>>,
    /// Order in which endpoints joined the backlog; ties in the check-in
    /// ranking go to the endpoint that has waited longest.
    queued_since: HashMap<String, u64>,
    next_seq: u64,

    checkins: HashMap<String, DateTime<Utc>>,
    lookups: HashSet<String>,
    failures: HashMap<String, SpawnFailures>,
}

impl JobScheduler {
    /// Starts the scheduler loop. It runs until `cancel` fires.
    pub(crate) fn start(
        backend: Arc<dyn LrBackend>,
        config: Arc<LrConfig>,
        cancel: CancellationToken,
    ) -> SchedulerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = JobScheduler {
            backend,
            config,
            tx: tx.clone(),
            rx,
            cancel,
            workers: HashMap::new(),
            idle: HashSet::new(),
            retiring: HashSet::new(),
            backlog: HashMap::new(),
            queued_since: HashMap::new(),
            next_seq: 0,
            checkins: HashMap::new(),
            lookups: HashSet::new(),
            failures: HashMap::new(),
        };
        let join = tokio::spawn(scheduler.run());
        SchedulerHandle {
            tx,
            join: Some(join),
        }
    }

    async fn run(mut self) {
        tracing::info!(max_workers = self.config.max_workers, "job scheduler started");
        loop {
            let retry_at = self.next_retry();
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => Some(message),
                    None => break,
                },
                _ = sleep_until(retry_at) => None,
            };
            if let Some(message) = message {
                self.handle(message).await;
            }
            self.schedule();
        }
        self.shutdown().await;
    }

    // ── Messages ───────────────────────────────────────────────────────────

    async fn handle(&mut self, message: SchedulerMessage) {
        match message {
            SchedulerMessage::Submit(item) => self.enqueue(item, false),
            SchedulerMessage::JobDone { endpoint_id } => {
                if self.workers.contains_key(&endpoint_id) && !self.retiring.contains(&endpoint_id)
                {
                    self.idle.insert(endpoint_id);
                }
            }
            SchedulerMessage::Worker {
                endpoint_id,
                status,
            } => self.worker_status(endpoint_id, status).await,
            SchedulerMessage::Checkin {
                endpoint_id,
                next_checkin,
            } => {
                tracing::debug!(%endpoint_id, ?next_checkin, "check-in lookup finished");
                if let Some(at) = next_checkin {
                    self.checkins.insert(endpoint_id, at);
                }
            }
            SchedulerMessage::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn worker_status(&mut self, endpoint_id: String, status: WorkerStatus) {
        match status {
            WorkerStatus::Ready => {
                self.failures.remove(&endpoint_id);
                if self.workers.contains_key(&endpoint_id) {
                    self.idle.insert(endpoint_id);
                }
            }
            WorkerStatus::Error(reason) => self.spawn_failed(&endpoint_id, reason),
            WorkerStatus::Exiting => {
                self.idle.remove(&endpoint_id);
                self.retiring.remove(&endpoint_id);
                if let Some(worker) = self.workers.remove(&endpoint_id) {
                    if let Err(e) = worker.join.await {
                        tracing::error!(%endpoint_id, error = %e, "worker task failed");
                    }
                    tracing::debug!(%endpoint_id, workers = self.workers.len(), "worker joined");
                }
            }
        }
    }

    fn spawn_failed(&mut self, endpoint_id: &str, reason: String) {
        let entry = self
            .failures
            .entry(endpoint_id.to_string())
            .or_insert(SpawnFailures {
                count: 0,
                retry_at: Instant::now(),
            });
        entry.count += 1;
        let delay = spawn_backoff(self.config.spawn_backoff, entry.count);
        entry.retry_at = Instant::now() + delay;
        let count = entry.count;

        if count >= self.config.max_spawn_failures {
            tracing::error!(%endpoint_id, failures = count, %reason, "giving up on endpoint");
            self.failures.remove(endpoint_id);
            self.queued_since.remove(endpoint_id);
            for item in self.backlog.remove(endpoint_id).into_iter().flatten() {
                item.fail(CbError::WorkerUnavailable {
                    endpoint_id: endpoint_id.to_string(),
                    reason: reason.clone(),
                });
            }
        } else {
            tracing::warn!(%endpoint_id, failures = count, ?delay, %reason, "worker spawn failed, backing off");
        }
    }

    // ── Scheduling pass ────────────────────────────────────────────────────

    fn schedule(&mut self) {
        self.dispatch();

        let now = Instant::now();
        let waiting: Vec<String> = self
            .backlog
            .keys()
            .filter(|e| !self.workers.contains_key(*e))
            .filter(|e| self.failures.get(*e).is_none_or(|f| f.retry_at <= now))
            .cloned()
            .collect();
        if waiting.is_empty() {
            return;
        }

        self.retire_idle(waiting.len());

        let free = self.config.max_workers.saturating_sub(self.workers.len());
        if free == 0 {
            tracing::trace!(waiting = waiting.len(), "no worker capacity");
            return;
        }
        let mut candidates = waiting;
        if candidates.len() > free {
            self.request_checkins(&candidates);
            rank_candidates(&mut candidates, &self.checkins, &self.queued_since);
        }
        for endpoint_id in candidates.into_iter().take(free) {
            self.spawn_worker(endpoint_id);
        }

        self.dispatch();
    }

    /// Hands the next queued item to every idle worker that has one.
    fn dispatch(&mut self) {
        let ready: Vec<String> = self
            .idle
            .iter()
            .filter(|e| self.backlog.contains_key(*e))
            .cloned()
            .collect();
        for endpoint_id in ready {
            let Some(item) = self.dequeue(&endpoint_id) else {
                continue;
            };
            let Some(worker) = self.workers.get(&endpoint_id) else {
                self.enqueue(item, true);
                continue;
            };
            self.idle.remove(&endpoint_id);
            match worker.tx.send(WorkerCommand::Run(item)) {
                Ok(()) => tracing::debug!(%endpoint_id, "job dispatched"),
                Err(mpsc::error::SendError(command)) => {
                    tracing::warn!(%endpoint_id, "worker queue closed, requeueing job");
                    if let WorkerCommand::Run(item) = command {
                        self.enqueue(item, true);
                    }
                }
            }
        }
    }

    /// Asks idle workers with nothing queued to exit until `wanted` more
    /// workers would fit, counting workers already on their way out.
    fn retire_idle(&mut self, wanted: usize) {
        let free = self.config.max_workers.saturating_sub(self.workers.len());
        let shortfall = wanted
            .saturating_sub(free)
            .saturating_sub(self.retiring.len());
        if shortfall == 0 {
            return;
        }
        let victims: Vec<String> = self
            .idle
            .iter()
            .filter(|e| !self.backlog.contains_key(*e))
            .take(shortfall)
            .cloned()
            .collect();
        for endpoint_id in victims {
            self.idle.remove(&endpoint_id);
            if let Some(worker) = self.workers.get(&endpoint_id) {
                tracing::debug!(%endpoint_id, "retiring idle worker");
                let _ = worker.tx.send(WorkerCommand::Exit);
                self.retiring.insert(endpoint_id);
            }
        }
    }

    fn spawn_worker(&mut self, endpoint_id: String) {
        tracing::info!(%endpoint_id, workers = self.workers.len() + 1, "spawning worker");
        let worker = JobWorker::spawn(
            endpoint_id.clone(),
            self.backend.clone(),
            self.config.clone(),
            self.tx.clone(),
        );
        self.workers.insert(endpoint_id, worker);
    }

    /// Starts a background lookup for every candidate whose next check-in is
    /// unknown and has not been asked for yet.
    fn request_checkins(&mut self, candidates: &[String]) {
        for endpoint_id in candidates {
            if self.checkins.contains_key(endpoint_id) || !self.lookups.insert(endpoint_id.clone())
            {
                continue;
            }
            let backend = self.backend.clone();
            let tx = self.tx.clone();
            let endpoint_id = endpoint_id.clone();
            tokio::spawn(async move {
                let next_checkin = backend
                    .next_checkin(&endpoint_id)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::debug!(%endpoint_id, error = %e, "check-in lookup failed");
                        None
                    });
                let _ = tx.send(SchedulerMessage::Checkin {
                    endpoint_id,
                    next_checkin,
                });
            });
        }
    }

    // ── Backlog ────────────────────────────────────────────────────────────

    /// Queues an item; `front` puts it back at the head after a failed
    /// hand-off so per-endpoint order is kept.
    fn enqueue(&mut self, item: WorkItem, front: bool) {
        let endpoint_id = item.endpoint_id.clone();
        if let Some(at) = item.next_checkin {
            self.checkins.insert(endpoint_id.clone(), at);
        }
        let queue = self.backlog.entry(endpoint_id.clone()).or_default();
        if front {
            queue.push_front(item);
        } else {
            queue.push_back(item);
        }
        let seq = &mut self.next_seq;
        self.queued_since.entry(endpoint_id).or_insert_with(|| {
            *seq += 1;
            *seq
        });
    }

    fn dequeue(&mut self, endpoint_id: &str) -> Option<WorkItem> {
        let queue = self.backlog.get_mut(endpoint_id)?;
        let item = queue.pop_front();
        if queue.is_empty() {
            self.backlog.remove(endpoint_id);
            self.queued_since.remove(endpoint_id);
        }
        item
    }

    /// Earliest future moment a backed-off endpoint with queued work may be
    /// retried. Deadlines already past wait for the next message that frees
    /// capacity.
    fn next_retry(&self) -> Option<Instant> {
        let now = Instant::now();
        self.failures
            .iter()
            .filter(|(e, _)| self.backlog.contains_key(*e) && !self.workers.contains_key(*e))
            .map(|(_, f)| f.retry_at)
            .filter(|retry_at| *retry_at > now)
            .min()
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let mut workers: Vec<String> = self.workers.keys().cloned().collect();
        workers.sort();
        let mut idle: Vec<String> = self.idle.iter().cloned().collect();
        idle.sort();
        SchedulerSnapshot {
            workers,
            idle,
            backlog: self
                .backlog
                .iter()
                .map(|(e, q)| (e.clone(), q.len()))
                .collect(),
        }
    }

    // ── Shutdown ───────────────────────────────────────────────────────────

    async fn shutdown(mut self) {
        tracing::info!(workers = self.workers.len(), "job scheduler shutting down");
        for item in self.backlog.drain().flat_map(|(_, queue)| queue) {
            item.fail(CbError::Shutdown);
        }
        for worker in self.workers.values() {
            let _ = worker.tx.send(WorkerCommand::Exit);
        }
        for (endpoint_id, worker) in self.workers.drain() {
            if let Err(e) = worker.join.await {
                tracing::error!(%endpoint_id, error = %e, "worker task failed");
            }
        }
        self.rx.close();
        while let Ok(message) = self.rx.try_recv() {
            if let SchedulerMessage::Submit(item) = message {
                item.fail(CbError::Shutdown);
            }
        }
        tracing::info!("job scheduler stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Delay before the next spawn attempt after `failures` consecutive
/// failures: `base * 2^(failures - 1)`, capped.
pub(crate) fn spawn_backoff(base: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_SPAWN_BACKOFF)
}

/// Orders endpoints competing for worker slots: known check-ins first,
/// soonest first; unknown ones after; ties by time spent waiting.
pub(crate) fn rank_candidates(
    candidates: &mut [String],
    checkins: &HashMap<String, DateTime<Utc>>,
    queued_since: &HashMap<String, u64>,
) {
    candidates.sort_by_key(|e| {
        let checkin = checkins.get(e);
        (
            checkin.is_none(),
            checkin.copied(),
            queued_since.get(e).copied().unwrap_or(u64::MAX),
        )
    });
}
