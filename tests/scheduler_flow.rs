//! Scheduler properties checked against an in-memory backend.
//!
//! The fake backend activates sessions immediately and counts how many are
//! open per endpoint and in total, which is how the worker bounds are
//! observed from the outside: every worker owns exactly one session and
//! closes it before it exits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cb_lr::backend::LrBackend;
use cb_lr::config::LrConfig;
use cb_lr::devices::JobTarget;
use cb_lr::error::{CbError, Result};
use cb_lr::manager::LrManager;
use cb_lr::protocol::{CommandRequest, CommandStatus, SessionInfo};
use cb_lr::scheduler::SchedulerSnapshot;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Notify;

#[derive(Default)]
struct FakeState {
    next_session: u64,
    sessions: HashMap<String, String>,
    open: HashMap<String, usize>,
    peak_per_endpoint: HashMap<String, usize>,
    peak_total: usize,
    creates: HashMap<String, usize>,
}

#[derive(Default)]
struct FakeBackend {
    failing: HashSet<String>,
    state: Mutex<FakeState>,
}

impl FakeBackend {
    fn failing(endpoints: &[&str]) -> Self {
        FakeBackend {
            failing: endpoints.iter().map(|e| e.to_string()).collect(),
            ..FakeBackend::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn creates(&self, endpoint_id: &str) -> usize {
        self.state().creates.get(endpoint_id).copied().unwrap_or(0)
    }

    fn peak_total(&self) -> usize {
        self.state().peak_total
    }

    fn peak_for(&self, endpoint_id: &str) -> usize {
        self.state()
            .peak_per_endpoint
            .get(endpoint_id)
            .copied()
            .unwrap_or(0)
    }

    fn open_total(&self) -> usize {
        self.state().open.values().sum()
    }
}

fn active_session(id: &str, endpoint_id: &str) -> Result<SessionInfo> {
    Ok(serde_json::from_value(json!({
        "id": id,
        "status": "active",
        "sensor_id": endpoint_id,
        "os_type": "linux",
        "supported_commands": ["process list"],
    }))?)
}

#[async_trait]
impl LrBackend for FakeBackend {
    async fn create_session(&self, endpoint_id: &str) -> Result<SessionInfo> {
        let mut state = self.state();
        *state.creates.entry(endpoint_id.to_string()).or_default() += 1;
        if self.failing.contains(endpoint_id) {
            return Err(CbError::ObjectNotFound {
                uri: format!("fake://sensor/{endpoint_id}"),
                body: "sensor offline".to_string(),
            });
        }
        state.next_session += 1;
        let id = state.next_session.to_string();
        state.sessions.insert(id.clone(), endpoint_id.to_string());
        let open = {
            let open = state.open.entry(endpoint_id.to_string()).or_default();
            *open += 1;
            *open
        };
        let peak = state
            .peak_per_endpoint
            .entry(endpoint_id.to_string())
            .or_default();
        *peak = (*peak).max(open);
        let total: usize = state.open.values().sum();
        state.peak_total = state.peak_total.max(total);
        active_session(&id, endpoint_id)
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionInfo> {
        let endpoint_id = self
            .state()
            .sessions
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        active_session(session_id, &endpoint_id)
    }

    async fn close_session(&self, session_id: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(endpoint_id) = state.sessions.remove(session_id) {
            if let Some(open) = state.open.get_mut(&endpoint_id) {
                *open -= 1;
            }
        }
        Ok(())
    }

    async fn send_keepalive(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }

    async fn submit_command(
        &self,
        _session_id: &str,
        _command: &CommandRequest,
    ) -> Result<CommandStatus> {
        Ok(serde_json::from_value(json!({"id": 1, "status": "pending"}))?)
    }

    async fn command_status(
        &self,
        _session_id: &str,
        command_id: &str,
        _wait: bool,
    ) -> Result<CommandStatus> {
        Ok(serde_json::from_value(
            json!({"id": command_id, "status": "complete", "processes": [{"pid": 4}]}),
        )?)
    }

    fn command_uri(&self, session_id: &str, command_id: Option<&str>) -> String {
        format!("fake://session/{session_id}/command/{}", command_id.unwrap_or(""))
    }

    async fn download_file(&self, _session_id: &str, _file_id: &str) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    async fn upload_file(&self, _session_id: &str, _name: &str, _content: Bytes) -> Result<String> {
        Ok("1".to_string())
    }

    async fn next_checkin(&self, _endpoint_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

fn config(max_workers: usize) -> LrConfig {
    LrConfig {
        max_workers,
        spawn_backoff: Duration::from_millis(10),
        ..LrConfig::default()
    }
}

fn manager(backend: &Arc<FakeBackend>, max_workers: usize) -> LrManager {
    LrManager::new(backend.clone(), config(max_workers))
}

/// Polls the scheduler until `pred` holds, failing the test after two
/// seconds.
async fn wait_for(
    manager: &LrManager,
    pred: impl Fn(&SchedulerSnapshot) -> bool,
) -> SchedulerSnapshot {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(snapshot) = manager.scheduler_snapshot().await {
                if pred(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("scheduler did not reach the expected state")
}

#[tokio::test]
async fn jobs_for_one_endpoint_run_in_submission_order_on_one_session() {
    let backend = Arc::new(FakeBackend::default());
    let manager = manager(&backend, 4);
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..10usize)
        .map(|i| {
            let order = order.clone();
            manager.submit_job("a", move |_session| async move {
                order.lock().unwrap().push(i);
                Ok(i)
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), i);
    }

    assert_eq!(*order.lock().unwrap(), (0..10usize).collect::<Vec<_>>());
    assert_eq!(backend.creates("a"), 1, "one worker should serve the whole backlog");
    manager.shutdown().await;
}

#[tokio::test]
async fn job_sees_session_for_its_endpoint() {
    let backend = Arc::new(FakeBackend::default());
    let manager = manager(&backend, 2);

    let processes = manager
        .submit_job("host-7", |session| async move {
            assert_eq!(session.endpoint_id(), "host-7");
            session.list_processes().await
        })
        .await
        .unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].pid, 4);
    manager.shutdown().await;
}

#[tokio::test]
async fn worker_count_never_exceeds_max_workers() {
    let backend = Arc::new(FakeBackend::default());
    let manager = manager(&backend, 2);
    let running: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
    let overlap = Arc::new(Mutex::new(false));

    let mut handles = Vec::new();
    for round in 0..2 {
        for endpoint in ["a", "b", "c"] {
            let running = running.clone();
            let overlap = overlap.clone();
            handles.push(manager.submit_job(endpoint, move |session| async move {
                let endpoint = session.endpoint_id().to_string();
                {
                    let mut running = running.lock().unwrap();
                    let count = running.entry(endpoint.clone()).or_default();
                    *count += 1;
                    if *count > 1 {
                        *overlap.lock().unwrap() = true;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                *running.lock().unwrap().get_mut(&endpoint).unwrap() -= 1;
                Ok(round)
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(backend.peak_total() <= 2, "peak workers {}", backend.peak_total());
    for endpoint in ["a", "b", "c"] {
        assert_eq!(backend.peak_for(endpoint), 1, "endpoint {endpoint} had two workers");
    }
    assert!(!*overlap.lock().unwrap(), "two jobs ran at once on one endpoint");
    manager.shutdown().await;
}

#[tokio::test]
async fn endpoint_without_capacity_waits_in_backlog() {
    let backend = Arc::new(FakeBackend::default());
    let manager = manager(&backend, 1);
    let release = Arc::new(Notify::new());

    let gate = release.clone();
    let first = manager.submit_job("a", move |_session| async move {
        gate.notified().await;
        Ok("a")
    });
    let second = manager.submit_job("b", |_session| async move { Ok("b") });

    let snapshot = wait_for(&manager, |s| {
        s.workers == ["a"] && s.backlog.get("b") == Some(&1)
    })
    .await;
    assert!(snapshot.idle.is_empty(), "worker a should be busy");

    release.notify_one();
    assert_eq!(first.await.unwrap(), "a");
    assert_eq!(second.await.unwrap(), "b");
    assert!(backend.peak_total() <= 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn soonest_checkin_gets_the_next_free_slot() {
    let backend = Arc::new(FakeBackend::default());
    let manager = manager(&backend, 1);
    let started = Arc::new(Mutex::new(Vec::new()));
    let release = Arc::new(Notify::new());

    let gate = release.clone();
    let blocker = manager.submit_job("x", move |_session| async move {
        gate.notified().await;
        Ok(())
    });

    let now = Utc::now();
    let mut handles = Vec::new();
    for (endpoint, minutes) in [("late", 60), ("soon", 1)] {
        let target = JobTarget {
            endpoint_id: endpoint.to_string(),
            next_checkin: Some(now + chrono::Duration::minutes(minutes)),
        };
        let started = started.clone();
        handles.push(manager.submit_job(target, move |session| async move {
            started.lock().unwrap().push(session.endpoint_id().to_string());
            Ok(())
        }));
    }
    wait_for(&manager, |s| s.backlog.len() == 2).await;

    release.notify_one();
    blocker.await.unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*started.lock().unwrap(), vec!["soon", "late"]);
    manager.shutdown().await;
}

#[tokio::test]
async fn establishment_failures_fail_backlog_after_backoff() {
    let backend = Arc::new(FakeBackend::failing(&["offline"]));
    let manager = manager(&backend, 2);

    let doomed = manager.submit_job("offline", |_session| async move { Ok(()) });
    let healthy = manager.submit_job("online", |_session| async move { Ok(()) });

    healthy.await.unwrap();
    match doomed.await {
        Err(CbError::WorkerUnavailable {
            endpoint_id,
            reason,
        }) => {
            assert_eq!(endpoint_id, "offline");
            assert!(reason.contains("sensor offline"), "reason was {reason}");
        }
        other => panic!("expected WorkerUnavailable, got {other:?}"),
    }
    assert_eq!(backend.creates("offline"), 3, "one attempt per allowed failure");
    manager.shutdown().await;
}

#[tokio::test]
async fn job_error_is_returned_unchanged() {
    let backend = Arc::new(FakeBackend::default());
    let manager = manager(&backend, 1);

    let result: Result<()> = manager
        .submit_job("a", |_session| async move {
            Err(CbError::Config {
                message: "bad job input".to_string(),
            })
        })
        .await;
    match result {
        Err(CbError::Config { message }) => assert_eq!(message, "bad job input"),
        other => panic!("expected the job's own error, got {other:?}"),
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn panicking_job_is_reported_and_worker_keeps_serving() {
    let backend = Arc::new(FakeBackend::default());
    let manager = manager(&backend, 1);

    let panicked = manager.submit_job("a", |_session| async move {
        if true {
            panic!("job blew up");
        }
        Ok(())
    });
    let after = manager.submit_job("a", |_session| async move { Ok(5) });

    assert!(matches!(panicked.await, Err(CbError::JobPanicked { .. })));
    assert_eq!(after.await.unwrap(), 5);
    assert_eq!(backend.creates("a"), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_queued_jobs_and_closes_sessions() {
    let backend = Arc::new(FakeBackend::default());
    let manager = manager(&backend, 1);

    let running = manager.submit_job("a", |_session| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok("finished")
    });
    let queued = manager.submit_job("b", |_session| async move { Ok("never") });
    wait_for(&manager, |s| s.workers == ["a"] && s.backlog.contains_key("b")).await;

    manager.shutdown().await;

    assert_eq!(running.await.unwrap(), "finished", "running jobs finish");
    assert!(matches!(queued.await, Err(CbError::Shutdown)));
    assert_eq!(backend.open_total(), 0, "every session should be closed");

    let late = manager.submit_job("c", |_session| async move { Ok(()) });
    assert!(matches!(late.await, Err(CbError::Shutdown)));
    assert!(manager.scheduler_snapshot().await.is_none());
}

/// CPU ticks (user + system) consumed by the calling thread so far.
#[cfg(target_os = "linux")]
fn thread_cpu_ticks() -> u64 {
    let stat = std::fs::read_to_string("/proc/thread-self/stat").unwrap();
    let (_, rest) = stat.rsplit_once(')').unwrap();
    let fields: Vec<&str> = rest.split_whitespace().collect();
    fields[11].parse::<u64>().unwrap() + fields[12].parse::<u64>().unwrap()
}

// The current-thread runtime runs the scheduler on the test thread, so the
// thread's CPU time shows whether the scheduler loop is parked.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn scheduler_idles_while_expired_backoff_waits_for_capacity() {
    let backend = Arc::new(FakeBackend::failing(&["offline"]));
    let manager = LrManager::new(
        backend.clone(),
        LrConfig {
            max_spawn_failures: 1000,
            ..config(1)
        },
    );

    let _offline = manager.submit_job("offline", |_session| async move { Ok(()) });
    tokio::time::timeout(Duration::from_secs(2), async {
        while backend.creates("offline") == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("offline endpoint never attempted a session");

    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (on_start, gate) = (started.clone(), release.clone());
    let blocker = manager.submit_job("x", move |_session| async move {
        on_start.notify_one();
        gate.notified().await;
        Ok(())
    });
    tokio::time::timeout(Duration::from_secs(2), started.notified())
        .await
        .expect("blocking job never started");

    // Let every backoff deadline pass while x holds the only slot.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let creates_before = backend.creates("offline");
    let ticks_before = thread_cpu_ticks();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let spent = thread_cpu_ticks() - ticks_before;

    assert_eq!(backend.creates("offline"), creates_before, "no capacity, no spawns");
    assert!(spent < 20, "scheduler burned {spent} ticks while waiting for capacity");

    release.notify_one();
    blocker.await.unwrap();
    manager.shutdown().await;
}
