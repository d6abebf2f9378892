//! Work items and the handles callers await for their results.
//!
//! A job is any async closure taking the endpoint's session. `WorkItem`
//! erases its type so the scheduler and workers can queue jobs with
//! different result types side by side; the typed result travels back to
//! the caller over a oneshot channel wrapped in a [`JobHandle`].
//!
//! A work item is consumed exactly once: either `run` on a worker or `fail`
//! from the scheduler. If it is dropped without either, the handle resolves
//! to `CbError::JobAbandoned` instead of hanging.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use crate::devices::JobTarget;
use crate::error::{CbError, Result};
use crate::session::LrSession;

pub(crate) type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

trait ErasedJob: Send {
    fn run(self: Box<Self>, session: Arc<LrSession>) -> JobFuture;
    fn fail(self: Box<Self>, error: CbError);
}

struct TypedJob<F, T> {
    job: F,
    tx: oneshot::Sender<Result<T>>,
    endpoint_id: String,
}

impl<F, Fut, T> ErasedJob for TypedJob<F, T>
where
    F: FnOnce(Arc<LrSession>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>, session: Arc<LrSession>) -> JobFuture {
        let TypedJob {
            job,
            tx,
            endpoint_id,
        } = *self;
        Box::pin(async move {
            let outcome = AssertUnwindSafe(async move { job(session).await })
                .catch_unwind()
                .await;
            let result = outcome.unwrap_or_else(|_| {
                tracing::error!(%endpoint_id, "job panicked");
                Err(CbError::JobPanicked { endpoint_id })
            });
            // The caller may have dropped its handle; nothing to do then.
            let _ = tx.send(result);
        })
    }

    fn fail(self: Box<Self>, error: CbError) {
        let _ = self.tx.send(Err(error));
    }
}

/// A queued unit of work for one endpoint.
pub(crate) struct WorkItem {
    pub(crate) endpoint_id: String,
    pub(crate) next_checkin: Option<DateTime<Utc>>,
    job: Box<dyn ErasedJob>,
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("endpoint_id", &self.endpoint_id)
            .finish_non_exhaustive()
    }
}

impl WorkItem {
    pub(crate) fn new<F, Fut, T>(target: JobTarget, job: F) -> (WorkItem, JobHandle<T>)
    where
        F: FnOnce(Arc<LrSession>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let item = WorkItem {
            endpoint_id: target.endpoint_id.clone(),
            next_checkin: target.next_checkin,
            job: Box::new(TypedJob {
                job,
                tx,
                endpoint_id: target.endpoint_id.clone(),
            }),
        };
        let handle = JobHandle {
            endpoint_id: target.endpoint_id,
            rx,
        };
        (item, handle)
    }

    /// Runs the job against `session` and delivers its result.
    pub(crate) fn run(self, session: Arc<LrSession>) -> JobFuture {
        self.job.run(session)
    }

    /// Completes the job with `error` without running it.
    pub(crate) fn fail(self, error: CbError) {
        self.job.fail(error)
    }
}

/// Resolves to the result of a submitted job.
///
/// Awaiting the handle behaves as if the job had been called directly: its
/// `Ok` value or error comes back unchanged.
#[derive(Debug)]
pub struct JobHandle<T> {
    endpoint_id: String,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> JobHandle<T> {
    /// The endpoint the job was submitted for.
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        Pin::new(&mut this.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(CbError::JobAbandoned {
                    endpoint_id: this.endpoint_id.clone(),
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_item_resolves_handle_with_error() {
        let (item, handle) = WorkItem::new(JobTarget::from("42"), |_session| async { Ok(1u32) });
        assert_eq!(handle.endpoint_id(), "42");
        item.fail(CbError::Shutdown);
        let err = handle.await.unwrap_err();
        assert!(matches!(err, CbError::Shutdown));
    }

    #[tokio::test]
    async fn dropped_item_resolves_handle_as_abandoned() {
        let (item, handle) = WorkItem::new(JobTarget::from("7"), |_session| async { Ok(()) });
        drop(item);
        match handle.await {
            Err(CbError::JobAbandoned { endpoint_id }) => assert_eq!(endpoint_id, "7"),
            other => panic!("expected JobAbandoned, got {other:?}"),
        }
    }
}
