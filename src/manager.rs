//! The public entry point: [`LrManager`].
//!
//! The manager offers two ways to use live response:
//!
//! * **Direct sessions** via [`LrManager::request_session`]. With
//!   `keepalive_sessions` enabled, sessions are cached per endpoint,
//!   reference-counted through [`SessionLease`]s and kept alive by a
//!   background task that pings every cached session each
//!   `keepalive_interval`. A session whose last lease has been released is
//!   closed and evicted on the next tick, as is one whose keepalive fails.
//!   Without keepalive every lease owns a fresh session that is closed when
//!   the lease is dropped.
//! * **Jobs** via [`LrManager::submit_job`]. The job scheduler is started on
//!   the first submission and runs each job on a worker that holds its own
//!   session to the target endpoint.
//!
//! [`LrManager::shutdown`] stops both background tasks, fails queued jobs
//! with `CbError::Shutdown` and closes every session the manager owns.
//! Dropping the manager without calling it still signals the background
//! tasks to stop.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{HttpBackend, LrBackend};
use crate::client::Credentials;
use crate::config::LrConfig;
use crate::devices::JobTarget;
use crate::error::{CbError, Result};
use crate::job::{JobHandle, WorkItem};
use crate::scheduler::{JobScheduler, SchedulerHandle, SchedulerMessage, SchedulerSnapshot};
use crate::session::LrSession;

type SessionCache = Arc<tokio::sync::Mutex<HashMap<String, Arc<CachedSession>>>>;

#[derive(Debug)]
struct CachedSession {
    session: Arc<LrSession>,
    refs: AtomicUsize,
}

/// Borrowed access to a live response session.
///
/// Derefs to [`LrSession`]. Dropping the lease releases it; for uncached
/// sessions that closes the session in the background, while
/// [`close`](Self::close) does it in the foreground.
#[derive(Debug)]
pub struct SessionLease {
    session: Arc<LrSession>,
    cached: Option<Arc<CachedSession>>,
    released: bool,
}

impl SessionLease {
    fn cached(entry: Arc<CachedSession>) -> Self {
        entry.refs.fetch_add(1, Ordering::AcqRel);
        SessionLease {
            session: entry.session.clone(),
            cached: Some(entry),
            released: false,
        }
    }

    fn owned(session: LrSession) -> Self {
        SessionLease {
            session: Arc::new(session),
            cached: None,
            released: false,
        }
    }

    /// A shared handle to the underlying session.
    pub fn session(&self) -> Arc<LrSession> {
        self.session.clone()
    }

    /// Releases the lease. An uncached session is closed before this
    /// returns; a cached one stays open until the keepalive task evicts it.
    pub async fn close(mut self) {
        self.released = true;
        match &self.cached {
            Some(entry) => {
                entry.refs.fetch_sub(1, Ordering::AcqRel);
            }
            None => self.session.close().await,
        }
    }
}

impl Deref for SessionLease {
    type Target = LrSession;

    fn deref(&self) -> &LrSession {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match &self.cached {
            Some(entry) => {
                entry.refs.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                if self.session.is_closed() {
                    return;
                }
                let session = self.session.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move { session.close().await });
                    }
                    Err(_) => tracing::warn!(
                        endpoint_id = %session.endpoint_id(),
                        "session lease dropped outside a runtime, session left open"
                    ),
                }
            }
        }
    }
}

/// Facade over sessions, the session cache and the job scheduler.
pub struct LrManager {
    backend: Arc<dyn LrBackend>,
    config: Arc<LrConfig>,
    sessions: SessionCache,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    scheduler: Mutex<Option<SchedulerHandle>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for LrManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LrManager")
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl LrManager {
    /// Creates a manager over any backend. Nothing is started until first
    /// use.
    pub fn new(backend: Arc<dyn LrBackend>, config: LrConfig) -> Self {
        LrManager {
            backend,
            config: Arc::new(config),
            sessions: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            keepalive: Mutex::new(None),
            scheduler: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a manager talking REST to the server in `credentials`.
    pub fn http(credentials: &Credentials, config: LrConfig) -> Result<Self> {
        let backend = HttpBackend::from_credentials(credentials)?;
        Ok(Self::new(Arc::new(backend), config))
    }

    /// The settings this manager was built with.
    pub fn config(&self) -> &LrConfig {
        &self.config
    }

    // ── Sessions ───────────────────────────────────────────────────────────

    /// Returns a session to `endpoint_id`, establishing one if needed.
    ///
    /// With `keepalive_sessions` enabled, an open cached session is reused.
    /// The cache lock is held while a new session is established, so
    /// concurrent callers for the same endpoint share one session.
    pub async fn request_session(&self, endpoint_id: &str) -> Result<SessionLease> {
        if self.cancel.is_cancelled() {
            return Err(CbError::Shutdown);
        }
        if !self.config.keepalive_sessions {
            let session =
                LrSession::establish(self.backend.clone(), endpoint_id, self.config.clone())
                    .await?;
            return Ok(SessionLease::owned(session));
        }

        self.ensure_keepalive();
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(endpoint_id) {
            if !entry.session.is_closed() {
                tracing::debug!(endpoint_id, "reusing cached session");
                return Ok(SessionLease::cached(entry.clone()));
            }
        }
        let session =
            LrSession::establish(self.backend.clone(), endpoint_id, self.config.clone()).await?;
        let entry = Arc::new(CachedSession {
            session: Arc::new(session),
            refs: AtomicUsize::new(0),
        });
        sessions.insert(endpoint_id.to_string(), entry.clone());
        Ok(SessionLease::cached(entry))
    }

    /// Closes and forgets the cached session for `endpoint_id`, whatever its
    /// reference count. Outstanding leases see a closed session.
    pub async fn close_session(&self, endpoint_id: &str) {
        let entry = self.sessions.lock().await.remove(endpoint_id);
        if let Some(entry) = entry {
            entry.session.close().await;
        }
    }

    /// Endpoints that currently have a cached session, sorted.
    pub async fn cached_sessions(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    fn ensure_keepalive(&self) {
        let mut keepalive = self.keepalive.lock().unwrap_or_else(PoisonError::into_inner);
        if keepalive.is_some() || self.cancel.is_cancelled() {
            return;
        }
        tracing::debug!(interval = ?self.config.keepalive_interval, "starting session keepalive");
        *keepalive = Some(tokio::spawn(keepalive_loop(
            self.sessions.clone(),
            self.config.keepalive_interval,
            self.cancel.child_token(),
        )));
    }

    // ── Jobs ───────────────────────────────────────────────────────────────

    /// Queues `job` to run on a worker for `target` and returns a handle
    /// that resolves to its result.
    ///
    /// The first call starts the job scheduler, so it must be made from
    /// within a Tokio runtime.
    pub fn submit_job<F, Fut, T>(&self, target: impl Into<JobTarget>, job: F) -> JobHandle<T>
    where
        F: FnOnce(Arc<LrSession>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (item, handle) = WorkItem::new(target.into(), job);
        tracing::debug!(endpoint_id = %item.endpoint_id, "job submitted");
        let Some(tx) = self.scheduler_tx() else {
            item.fail(CbError::Shutdown);
            return handle;
        };
        if let Err(mpsc::error::SendError(SchedulerMessage::Submit(item))) =
            tx.send(SchedulerMessage::Submit(item))
        {
            item.fail(CbError::Shutdown);
        }
        handle
    }

    /// A point-in-time view of the job scheduler, or `None` if no job has
    /// been submitted yet or the manager is shut down.
    pub async fn scheduler_snapshot(&self) -> Option<SchedulerSnapshot> {
        let tx = {
            let scheduler = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
            scheduler.as_ref()?.tx.clone()
        };
        let (reply, rx) = oneshot::channel();
        tx.send(SchedulerMessage::Snapshot(reply)).ok()?;
        rx.await.ok()
    }

    fn scheduler_tx(&self) -> Option<mpsc::UnboundedSender<SchedulerMessage>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let mut scheduler = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = scheduler.get_or_insert_with(|| {
            JobScheduler::start(
                self.backend.clone(),
                self.config.clone(),
                self.cancel.child_token(),
            )
        });
        Some(handle.tx.clone())
    }

    // ── Shutdown ───────────────────────────────────────────────────────────

    /// Stops the scheduler and keepalive tasks and waits for them. Queued
    /// jobs fail with `CbError::Shutdown`; running jobs finish first. Every
    /// session the manager owns is closed. Later calls return immediately.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .and_then(|handle| handle.join.take());
        if let Some(join) = scheduler {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "job scheduler task failed");
            }
        }
        let keepalive = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = keepalive {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "keepalive task failed");
            }
        }
        let cached: Vec<Arc<CachedSession>> =
            self.sessions.lock().await.drain().map(|(_, e)| e).collect();
        for entry in cached {
            entry.session.close().await;
        }
    }
}

impl Drop for LrManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Pings every cached session each `interval`, evicting released sessions
/// and sessions whose keepalive fails.
async fn keepalive_loop(sessions: SessionCache, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let mut sessions = sessions.lock().await;
        let mut evicted = Vec::new();
        for (endpoint_id, entry) in sessions.iter() {
            if entry.refs.load(Ordering::Acquire) == 0 {
                tracing::debug!(%endpoint_id, "evicting released session");
                evicted.push(endpoint_id.clone());
                continue;
            }
            if let Err(e) = entry.session.keepalive().await {
                tracing::warn!(%endpoint_id, error = %e, "keepalive failed, evicting session");
                evicted.push(endpoint_id.clone());
            }
        }
        for endpoint_id in evicted {
            if let Some(entry) = sessions.remove(&endpoint_id) {
                entry.session.close().await;
            }
        }
    }

    let remaining: Vec<Arc<CachedSession>> =
        sessions.lock().await.drain().map(|(_, e)| e).collect();
    for entry in remaining {
        entry.session.close().await;
    }
    tracing::debug!("session keepalive stopped");
}
