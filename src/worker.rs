//! A job worker: one task, one endpoint, one long-lived session.
//!
//! State machine:
//!
//! ```text
//! starting ──session ok──▶ ready ⇄ busy ──Exit──▶ exiting
//!     │
//!     └──session failed──▶ error ─────────────────▶ exiting
//! ```
//!
//! Every transition the scheduler cares about is announced on the scheduler
//! queue: `Ready`, `Error`, `JobDone` after each job, and always `Exiting`
//! last, after the session has been closed.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::LrBackend;
use crate::config::LrConfig;
use crate::error::CbError;
use crate::job::WorkItem;
use crate::scheduler::SchedulerMessage;
use crate::session::LrSession;

/// Lifecycle states of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Establishing the session.
    Starting,
    /// Waiting for work.
    Ready,
    /// Running a job.
    Busy,
    /// Session could not be established.
    Error,
    /// Shutting down.
    Exiting,
}

/// Lifecycle notices a worker sends to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Session established; the worker accepts work.
    Ready,
    /// Session establishment failed with the given reason.
    Error(String),
    /// The worker has stopped and its session is closed.
    Exiting,
}

/// Messages on a worker's private queue.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Run(WorkItem),
    Exit,
}

/// The scheduler's side of a worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub(crate) tx: mpsc::UnboundedSender<WorkerCommand>,
    pub(crate) join: JoinHandle<()>,
}

pub(crate) struct JobWorker {
    endpoint_id: String,
    backend: Arc<dyn LrBackend>,
    config: Arc<LrConfig>,
    rx: mpsc::UnboundedReceiver<WorkerCommand>,
    scheduler: mpsc::UnboundedSender<SchedulerMessage>,
    state: WorkerState,
}

impl JobWorker {
    /// Spawns a worker task for `endpoint_id`.
    pub(crate) fn spawn(
        endpoint_id: String,
        backend: Arc<dyn LrBackend>,
        config: Arc<LrConfig>,
        scheduler: mpsc::UnboundedSender<SchedulerMessage>,
    ) -> WorkerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = JobWorker {
            endpoint_id,
            backend,
            config,
            rx,
            scheduler,
            state: WorkerState::Starting,
        };
        let join = tokio::spawn(worker.run());
        WorkerHandle { tx, join }
    }

    fn set_state(&mut self, state: WorkerState) {
        tracing::debug!(endpoint_id = %self.endpoint_id, from = ?self.state, to = ?state, "worker state");
        self.state = state;
    }

    fn notify(&self, message: SchedulerMessage) {
        if self.scheduler.send(message).is_err() {
            tracing::debug!(endpoint_id = %self.endpoint_id, "scheduler gone, dropping notice");
        }
    }

    fn announce(&self, status: WorkerStatus) {
        self.notify(SchedulerMessage::Worker {
            endpoint_id: self.endpoint_id.clone(),
            status,
        });
    }

    async fn run(mut self) {
        tracing::info!(endpoint_id = %self.endpoint_id, "worker starting");
        let session = match LrSession::establish(
            self.backend.clone(),
            &self.endpoint_id,
            self.config.clone(),
        )
        .await
        {
            Ok(session) => Some(Arc::new(session)),
            Err(e) => {
                tracing::warn!(endpoint_id = %self.endpoint_id, error = %e, "worker could not establish a session");
                self.set_state(WorkerState::Error);
                self.announce(WorkerStatus::Error(e.to_string()));
                None
            }
        };

        if let Some(session) = &session {
            self.set_state(WorkerState::Ready);
            self.announce(WorkerStatus::Ready);
            self.serve(session).await;
        }

        self.set_state(WorkerState::Exiting);
        self.drain();
        if let Some(session) = session {
            session.close().await;
        }
        tracing::info!(endpoint_id = %self.endpoint_id, "worker exiting");
        self.announce(WorkerStatus::Exiting);
    }

    /// Runs queued jobs one at a time until told to exit.
    async fn serve(&mut self, session: &Arc<LrSession>) {
        while let Some(command) = self.rx.recv().await {
            match command {
                WorkerCommand::Run(item) => {
                    self.set_state(WorkerState::Busy);
                    item.run(session.clone()).await;
                    self.set_state(WorkerState::Ready);
                    self.notify(SchedulerMessage::JobDone {
                        endpoint_id: self.endpoint_id.clone(),
                    });
                }
                WorkerCommand::Exit => break,
            }
        }
    }

    /// Fails anything still queued so no caller waits on a worker that is
    /// going away.
    fn drain(&mut self) {
        self.rx.close();
        while let Ok(command) = self.rx.try_recv() {
            if let WorkerCommand::Run(item) = command {
                item.fail(CbError::WorkerUnavailable {
                    endpoint_id: self.endpoint_id.clone(),
                    reason: "worker exited before running the job".to_string(),
                });
            }
        }
    }
}
