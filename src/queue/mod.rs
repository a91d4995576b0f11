//! Durable named job queues over the SQLite store.
//!
//! At-least-once delivery: a claimed job whose worker dies is requeued on the
//! next boot. Per-key dedup, bounded attempts with exponential backoff, and a
//! progress column surface the same contract the pipeline stages expect from
//! any queue substrate.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::database::{Database, EnqueueOptions, JobDisposition, JobRecord};
use crate::error::PipelineError;

/// How long an idle worker waits before polling its queue again.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The execution context a stage body sees.
///
/// Real queue jobs and the orchestrator's inline invocations both implement
/// this, so stage bodies are reusable without knowing who drives them.
pub trait StageContext: Send + Sync {
    fn id(&self) -> &str;
    fn data(&self) -> &serde_json::Value;
    fn log(&self, message: &str);
    /// Report progress 0–100; persisted progress never decreases.
    fn update_progress(&self, percent: u8);
}

/// Deserialize the job payload for a stage body.
pub fn payload<T: DeserializeOwned>(ctx: &dyn StageContext) -> Result<T, PipelineError> {
    serde_json::from_value(ctx.data().clone())
        .map_err(|e| PipelineError::Parse(format!("job payload: {e}")))
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &dyn StageContext) -> Result<(), PipelineError>;
}

/// Context backed by a persisted job row.
pub struct QueueJobContext {
    db: Arc<Database>,
    id: String,
    payload: serde_json::Value,
}

impl StageContext for QueueJobContext {
    fn id(&self) -> &str {
        &self.id
    }

    fn data(&self) -> &serde_json::Value {
        &self.payload
    }

    fn log(&self, message: &str) {
        log::info!("[job {}] {}", self.id, message);
    }

    fn update_progress(&self, percent: u8) {
        if let Err(e) = self.db.update_job_progress(&self.id, percent as i64) {
            log::warn!("Failed to update progress for job {}: {}", self.id, e);
        }
    }
}

/// Context for stage bodies invoked in-process, without a queue row.
pub struct InlineContext {
    id: String,
    payload: serde_json::Value,
}

impl InlineContext {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

impl StageContext for InlineContext {
    fn id(&self) -> &str {
        &self.id
    }

    fn data(&self) -> &serde_json::Value {
        &self.payload
    }

    fn log(&self, message: &str) {
        log::info!("[{}] {}", self.id, message);
    }

    fn update_progress(&self, percent: u8) {
        log::debug!("[{}] progress {}%", self.id, percent);
    }
}

/// Producer handle for enqueuing jobs.
#[derive(Clone)]
pub struct JobQueue {
    db: Arc<Database>,
}

impl JobQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Enqueue unless an active job with the same dedup key exists; returns
    /// the job id, or None when deduplicated.
    pub fn add(
        &self,
        queue: &str,
        name: &str,
        payload: &serde_json::Value,
        options: &EnqueueOptions,
    ) -> Result<Option<String>, PipelineError> {
        let id = self.db.enqueue_job(queue, name, payload, options)?;
        match &id {
            Some(id) => log::info!("Enqueued {queue} job {id} ({name})"),
            None => log::debug!("Deduplicated {queue} job {name}"),
        }
        Ok(id)
    }
}

/// Polls one queue and runs claimed jobs on up to `concurrency` tasks.
pub struct Worker {
    db: Arc<Database>,
    queue: String,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        db: Arc<Database>,
        queue: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            queue: queue.into(),
            handler,
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    pub async fn run(self) {
        log::info!(
            "Worker started: queue={} concurrency={}",
            self.queue,
            self.concurrency
        );
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let job = match self.db.claim_next_job(&self.queue) {
                Ok(job) => job,
                Err(e) => {
                    log::error!("Queue {} claim failed: {}", self.queue, e);
                    None
                }
            };

            match job {
                Some(record) => {
                    let db = self.db.clone();
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        run_job(db, handler, record).await;
                        drop(permit);
                    });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    }
                }
            }
        }

        log::info!("Worker stopped: queue={}", self.queue);
    }
}

async fn run_job(db: Arc<Database>, handler: Arc<dyn JobHandler>, record: JobRecord) {
    let job_id = record.id.clone();
    let queue = record.queue.clone();
    log::info!(
        "Running {} job {} ({}), attempt {}/{}",
        queue,
        job_id,
        record.name,
        record.attempts_made,
        record.max_attempts
    );

    let ctx = QueueJobContext {
        db: db.clone(),
        id: job_id.clone(),
        payload: record.payload,
    };

    match handler.handle(&ctx).await {
        Ok(()) => {
            if let Err(e) = db.complete_job(&job_id) {
                log::error!("Failed to mark job {} completed: {}", job_id, e);
            }
        }
        Err(error) => {
            let retryable = error.is_retryable();
            match db.fail_job_attempt(
                &job_id,
                &error.to_string(),
                retryable,
                error.retry_limit(),
            ) {
                Ok(JobDisposition::Retried(run_at)) => {
                    log::warn!(
                        "Job {} failed ({}), retrying at {}",
                        job_id,
                        error,
                        run_at
                    );
                }
                Ok(JobDisposition::Failed) => {
                    log::error!("Job {} failed permanently: {}", job_id, error);
                }
                Err(e) => log::error!("Failed to record failure for job {}: {}", job_id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::JobStatus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn setup() -> (Arc<Database>, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("queue.db")).unwrap();
        (Arc::new(db), temp)
    }

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, ctx: &dyn StageContext) -> Result<(), PipelineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.update_progress(50);
            if self.fail_first && call == 0 {
                return Err(PipelineError::Transport("first attempt flake".into()));
            }
            Ok(())
        }
    }

    async fn wait_for_status(db: &Database, id: &str, status: JobStatus) {
        for _ in 0..200 {
            if db.get_job(id).unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {id} never reached {status:?}");
    }

    #[tokio::test]
    async fn worker_completes_a_job() {
        let (db, _temp) = setup();
        let id = db
            .enqueue_job(
                "test",
                "noop",
                &serde_json::json!({}),
                &EnqueueOptions {
                    job_id: None,
                    max_attempts: 1,
                    backoff_delay_ms: 10,
                },
            )
            .unwrap()
            .unwrap();

        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: false,
        });
        let cancel = CancellationToken::new();
        let worker = Worker::new(db.clone(), "test", handler.clone(), 1, cancel.clone());
        let task = tokio::spawn(worker.run());

        wait_for_status(&db, &id, JobStatus::Completed).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(db.get_job(&id).unwrap().unwrap().progress, 100);
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_then_succeeds() {
        let (db, _temp) = setup();
        let id = db
            .enqueue_job(
                "test",
                "flaky",
                &serde_json::json!({}),
                &EnqueueOptions {
                    job_id: None,
                    max_attempts: 3,
                    backoff_delay_ms: 10,
                },
            )
            .unwrap()
            .unwrap();

        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: true,
        });
        let cancel = CancellationToken::new();
        let worker = Worker::new(db.clone(), "test", handler.clone(), 1, cancel.clone());
        let task = tokio::spawn(worker.run());

        wait_for_status(&db, &id, JobStatus::Completed).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let job = db.get_job(&id).unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.last_error.as_deref(), Some("transport error: first attempt flake"));
    }

    struct FatalHandler;

    #[async_trait]
    impl JobHandler for FatalHandler {
        async fn handle(&self, _ctx: &dyn StageContext) -> Result<(), PipelineError> {
            Err(PipelineError::NotFound("entity".into()))
        }
    }

    struct GarbledHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for GarbledHandler {
        async fn handle(&self, _ctx: &dyn StageContext) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::Parse("unexpected token".into()))
        }
    }

    #[tokio::test]
    async fn repeated_parse_failures_stop_after_one_retry() {
        let (db, _temp) = setup();
        let id = db
            .enqueue_job(
                "test",
                "garbled",
                &serde_json::json!({}),
                &EnqueueOptions {
                    job_id: None,
                    max_attempts: 5,
                    backoff_delay_ms: 10,
                },
            )
            .unwrap()
            .unwrap();

        let handler = Arc::new(GarbledHandler {
            calls: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();
        let worker = Worker::new(db.clone(), "test", handler.clone(), 1, cancel.clone());
        let task = tokio::spawn(worker.run());

        wait_for_status(&db, &id, JobStatus::Failed).await;
        cancel.cancel();
        task.await.unwrap();

        // Retried once, then fatal, despite three attempts remaining
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let job = db.get_job(&id).unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);
        assert!(job.attempts_made < job.max_attempts);
        assert_eq!(job.last_error.as_deref(), Some("parse error: unexpected token"));
    }

    #[tokio::test]
    async fn fatal_error_fails_without_retry() {
        let (db, _temp) = setup();
        let id = db
            .enqueue_job(
                "test",
                "fatal",
                &serde_json::json!({}),
                &EnqueueOptions {
                    job_id: None,
                    max_attempts: 3,
                    backoff_delay_ms: 10,
                },
            )
            .unwrap()
            .unwrap();

        let cancel = CancellationToken::new();
        let worker = Worker::new(db.clone(), "test", Arc::new(FatalHandler), 1, cancel.clone());
        let task = tokio::spawn(worker.run());

        wait_for_status(&db, &id, JobStatus::Failed).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(db.get_job(&id).unwrap().unwrap().attempts_made, 1);
    }

    #[test]
    fn inline_context_exposes_payload() {
        let ctx = InlineContext::new("inline-test", serde_json::json!({"digestId": "d1"}));
        assert_eq!(ctx.id(), "inline-test");
        assert_eq!(ctx.data()["digestId"], "d1");
        // No queue row behind it; progress and log must not panic
        ctx.update_progress(30);
        ctx.log("working");
    }

    #[derive(serde::Deserialize)]
    struct TestPayload {
        value: u32,
    }

    #[test]
    fn payload_helper_deserializes() {
        let ctx = InlineContext::new("t", serde_json::json!({"value": 7}));
        let parsed: TestPayload = payload(&ctx).unwrap();
        assert_eq!(parsed.value, 7);

        let bad = InlineContext::new("t", serde_json::json!({"other": 1}));
        assert!(payload::<TestPayload>(&bad).is_err());
    }
}
