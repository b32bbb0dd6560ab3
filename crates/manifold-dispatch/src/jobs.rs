use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use manifold_core::{
    ApiKey, GatewayError, InferenceRequest, InferenceResponse, Result, TenantId,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::TenantResolver;

/// Runs one inference to completion under a cancellation token. Implemented
/// by the router; the indirection keeps jobs → router one-way.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        api_key: Option<ApiKey>,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<InferenceResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Owned copy of a failure for the job table.
#[derive(Debug, Clone)]
pub struct JobError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&GatewayError> for JobError {
    fn from(err: &GatewayError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.message().to_string(),
            retryable: err.retryable(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AsyncJob {
    pub job_id: Uuid,
    pub request_id: String,
    pub tenant_id: TenantId,
    pub status: JobStatus,
    pub result: Option<InferenceResponse>,
    pub error: Option<JobError>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct QueuedJob {
    job_id: Uuid,
    api_key: Option<ApiKey>,
    request: InferenceRequest,
}

struct JobsInner {
    jobs: DashMap<Uuid, AsyncJob>,
    tokens: DashMap<Uuid, CancellationToken>,
    executor: Arc<dyn JobExecutor>,
    retention: Duration,
}

impl JobsInner {
    fn finish(&self, job_id: Uuid, status: JobStatus, result: Option<InferenceResponse>, error: Option<JobError>) {
        if let Some(mut job) = self.jobs.get_mut(&job_id) {
            job.status = status;
            job.result = result;
            job.error = error;
            job.completed_at = Some(Utc::now());
        }
        self.tokens.remove(&job_id);
    }

    async fn process(&self, queued: QueuedJob) {
        let token = self
            .tokens
            .get(&queued.job_id)
            .map(|t| t.clone())
            .unwrap_or_default();
        if token.is_cancelled() {
            // cancelled while still queued; the record is already terminal
            return;
        }
        if let Some(mut job) = self.jobs.get_mut(&queued.job_id) {
            job.status = JobStatus::Running;
        } else {
            return;
        }
        debug!(job_id = %queued.job_id, "async job running");

        let outcome = self
            .executor
            .execute(queued.api_key, queued.request, token.clone())
            .await;
        match outcome {
            Ok(response) => {
                self.finish(queued.job_id, JobStatus::Completed, Some(response), None);
            }
            Err(e) if token.is_cancelled() => {
                self.finish(queued.job_id, JobStatus::Cancelled, None, Some(JobError::from(&e)));
            }
            Err(e) => {
                warn!(job_id = %queued.job_id, error = %e, "async job failed");
                self.finish(queued.job_id, JobStatus::Failed, None, Some(JobError::from(&e)));
            }
        }
    }
}

/// Fire-and-forget inference jobs over a bounded worker pool. Terminal
/// records are kept for the retention period and then garbage collected.
pub struct AsyncJobManager {
    inner: Arc<JobsInner>,
    resolver: Arc<dyn TenantResolver>,
    queue_tx: mpsc::Sender<QueuedJob>,
}

impl AsyncJobManager {
    pub fn new(
        executor: Arc<dyn JobExecutor>,
        resolver: Arc<dyn TenantResolver>,
        workers: usize,
        retention: Duration,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel::<QueuedJob>(1024);
        let inner = Arc::new(JobsInner {
            jobs: DashMap::new(),
            tokens: DashMap::new(),
            executor,
            retention,
        });
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for worker in 0..workers.max(1) {
            let inner = Arc::clone(&inner);
            let queue_rx = Arc::clone(&queue_rx);
            tokio::spawn(async move {
                debug!(worker, "async job worker started");
                loop {
                    let queued = { queue_rx.lock().await.recv().await };
                    match queued {
                        Some(queued) => inner.process(queued).await,
                        None => break,
                    }
                }
            });
        }
        Self {
            inner,
            resolver,
            queue_tx,
        }
    }

    /// Accept a job, returning its id immediately.
    pub fn submit(&self, api_key: Option<ApiKey>, request: InferenceRequest) -> Result<Uuid> {
        let tenant_id = self.resolver.resolve(api_key.as_ref())?;
        request.validate()?;

        let job_id = Uuid::new_v4();
        self.inner.jobs.insert(job_id, AsyncJob {
            job_id,
            request_id: request.request_id.clone(),
            tenant_id,
            status: JobStatus::Pending,
            result: None,
            error: None,
            submitted_at: Utc::now(),
            completed_at: None,
        });
        self.inner.tokens.insert(job_id, CancellationToken::new());

        if self
            .queue_tx
            .try_send(QueuedJob { job_id, api_key, request })
            .is_err()
        {
            self.inner.jobs.remove(&job_id);
            self.inner.tokens.remove(&job_id);
            return Err(GatewayError::internal("job queue is full"));
        }
        info!(job_id = %job_id, "async job submitted");
        Ok(job_id)
    }

    pub fn get(&self, job_id: Uuid) -> Option<AsyncJob> {
        self.inner.jobs.get(&job_id).map(|j| j.clone())
    }

    /// Cancel a job. A PENDING job terminates immediately; a RUNNING one is
    /// signalled through its cancellation token.
    pub fn cancel(&self, job_id: Uuid) -> Result<()> {
        let Some(mut job) = self.inner.jobs.get_mut(&job_id) else {
            return Err(GatewayError::from_kind(manifold_core::ErrorKind::JobNotFound)
                .with_context("job_id", job_id.to_string()));
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        if let Some(token) = self.inner.tokens.get(&job_id) {
            token.cancel();
        }
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
        }
        info!(job_id = %job_id, "async job cancelled");
        Ok(())
    }

    /// Drop terminal records older than the retention period.
    pub fn gc(&self) {
        let retention = chrono::Duration::from_std(self.inner.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let now = Utc::now();
        self.inner.jobs.retain(|_, job| {
            !(job.status.is_terminal()
                && job
                    .completed_at
                    .is_some_and(|done| now - done >= retention))
        });
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTenantResolver;
    use manifold_core::ChatMessage;

    struct StubExecutor {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl JobExecutor for StubExecutor {
        async fn execute(
            &self,
            _api_key: Option<ApiKey>,
            request: InferenceRequest,
            cancel: CancellationToken,
        ) -> Result<InferenceResponse> {
            tokio::select! {
                _ = cancel.cancelled() => Err(GatewayError::cancelled()),
                _ = tokio::time::sleep(self.delay) => {
                    if self.fail {
                        Err(GatewayError::all_runners_failed(&request.model))
                    } else {
                        Ok(InferenceResponse::new(&request.request_id, &request.model, "done"))
                    }
                }
            }
        }
    }

    fn manager(delay_ms: u64, fail: bool, workers: usize) -> AsyncJobManager {
        AsyncJobManager::new(
            Arc::new(StubExecutor {
                delay: Duration::from_millis(delay_ms),
                fail,
            }),
            Arc::new(StaticTenantResolver::new()),
            workers,
            Duration::from_secs(3600),
        )
    }

    fn request() -> InferenceRequest {
        InferenceRequest::new("m", vec![ChatMessage::user("hi")])
    }

    async fn wait_terminal(manager: &AsyncJobManager, job_id: Uuid) -> AsyncJob {
        for _ in 0..200 {
            let job = manager.get(job_id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn submit_runs_to_completion() {
        let manager = manager(1, false, 2);
        let job_id = manager.submit(None, request()).unwrap();
        let job = wait_terminal(&manager, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap().content, "done");
        assert!(job.completed_at.is_some());
        assert!(job.tenant_id.is_community());
    }

    #[tokio::test]
    async fn failures_surface_in_the_record() {
        let manager = manager(1, true, 1);
        let job_id = manager.submit(None, request()).unwrap();
        let job = wait_terminal(&manager, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        let err = job.error.unwrap();
        assert_eq!(err.code, "ROUTING_002");
    }

    #[tokio::test]
    async fn cancel_running_job() {
        let manager = manager(5_000, false, 1);
        let job_id = manager.submit(None, request()).unwrap();
        // let the worker pick it up
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.cancel(job_id).unwrap();
        let job = wait_terminal(&manager, job_id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_pending_job_never_executes() {
        // single worker busy with a slow job keeps the second queued
        let manager = manager(5_000, false, 1);
        let _busy = manager.submit(None, request()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = manager.submit(None, request()).unwrap();
        manager.cancel(queued).unwrap();
        let job = manager.get(queued).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let manager = manager(1, false, 1);
        assert!(manager.get(Uuid::new_v4()).is_none());
        let err = manager.cancel(Uuid::new_v4()).unwrap_err();
        assert_eq!(err.kind, manifold_core::ErrorKind::JobNotFound);
    }

    #[tokio::test]
    async fn gc_drops_expired_terminal_records() {
        let manager = AsyncJobManager::new(
            Arc::new(StubExecutor {
                delay: Duration::from_millis(1),
                fail: false,
            }),
            Arc::new(StaticTenantResolver::new()),
            1,
            Duration::ZERO,
        );
        let job_id = manager.submit(None, request()).unwrap();
        wait_terminal(&manager, job_id).await;
        manager.gc();
        assert!(manager.get(job_id).is_none());
    }

    #[tokio::test]
    async fn double_cancel_is_ok() {
        let manager = manager(1, false, 1);
        let job_id = manager.submit(None, request()).unwrap();
        wait_terminal(&manager, job_id).await;
        manager.cancel(job_id).unwrap();
        manager.cancel(job_id).unwrap();
        assert_eq!(manager.get(job_id).unwrap().status, JobStatus::Completed);
    }
}
