use futures::FutureExt;
use log::info;
use sqlx::{Pool, Sqlite};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;

use crate::db::queries::tracker as tracker_queries;
use crate::models::tracker::{tracked_status, TrackedJob, TrackedStep};

pub mod sinks;

pub use sinks::{DatabaseSink, LogSink, StderrSink};

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Tracked job not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Step '{step}' panicked: {message}")]
    StepPanicked { step: String, message: String },

    #[error("{0}")]
    Step(String),
}

/// Parameters for starting a tracked job.
#[derive(Debug, Default, Clone)]
pub struct JobSpec {
    pub job_type: String,
    pub operation: String,
    pub owner: Option<String>,
    pub external_id: Option<String>,
    pub context_id: Option<String>,
    pub category: Option<String>,
    pub parent_job_id: Option<i64>,
}

/// Context every tracked operation runs in: the ids that correlate log
/// records to the job tree.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub job_id: Option<i64>,
    pub step_id: Option<i64>,
    pub external_id: Option<String>,
}

/// Hierarchical job/step lifecycle records with structured log fan-out.
///
/// Tracker rows are deliberately separate from backup jobs: the business
/// object models what was backed up, these rows model how the run executed
/// (steps, progress, panics) under a stable external id.
pub struct JobTracker {
    pool: Pool<Sqlite>,
    sinks: Vec<Arc<dyn LogSink>>,
}

impl JobTracker {
    pub fn new(pool: Pool<Sqlite>, sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { pool, sinks }
    }

    /// Default wiring: one sink into the relational store (records correlate
    /// to jobs and steps by foreign key) and one structured sink on stderr.
    pub fn with_default_sinks(pool: Pool<Sqlite>) -> Self {
        let sinks: Vec<Arc<dyn LogSink>> = vec![
            Arc::new(DatabaseSink::new(pool.clone())),
            Arc::new(StderrSink),
        ];
        Self::new(pool, sinks)
    }

    async fn emit(&self, ctx: &JobContext, level: &str, message: &str) {
        for sink in &self.sinks {
            sink.write(ctx, level, message).await;
        }
    }

    /// Insert a job row, attach its ids to the returned context, and emit a
    /// "started" record.
    pub async fn start_job(
        &self,
        parent: &JobContext,
        spec: JobSpec,
    ) -> Result<(JobContext, i64), TrackerError> {
        let row = tracker_queries::create_job(
            &self.pool,
            tracker_queries::NewTrackedJob {
                external_id: spec.external_id.as_deref(),
                context_id: spec.context_id.as_deref(),
                parent_job_id: spec.parent_job_id.or(parent.job_id),
                job_type: &spec.job_type,
                operation: &spec.operation,
                owner: spec.owner.as_deref(),
                category: spec.category.as_deref(),
            },
        )
        .await?;

        let ctx = JobContext {
            job_id: Some(row.id),
            step_id: None,
            external_id: row.external_id.clone(),
        };
        self.emit(
            &ctx,
            "info",
            &format!("started {} ({})", spec.operation, spec.job_type),
        )
        .await;
        Ok((ctx, row.id))
    }

    /// Terminate a job. Terminal statuses set the completion time.
    pub async fn end_job(
        &self,
        ctx: &JobContext,
        job_id: i64,
        status: &str,
        error: Option<&str>,
    ) -> Result<(), TrackerError> {
        tracker_queries::end_job(&self.pool, job_id, status, error).await?;
        let message = match error {
            Some(e) => format!("ended with status {}: {}", status, e),
            None => format!("ended with status {}", status),
        };
        self.emit(ctx, if status == tracked_status::FAILED { "error" } else { "info" }, &message)
            .await;
        Ok(())
    }

    /// Record progress, clamped to 0..100.
    pub async fn mark_job_progress(&self, job_id: i64, percent: i64) -> Result<(), TrackerError> {
        tracker_queries::set_progress(&self.pool, job_id, percent).await?;
        Ok(())
    }

    /// Start a step under the job; steps are auto-sequenced per job.
    pub async fn start_step(
        &self,
        ctx: &JobContext,
        job_id: i64,
        name: &str,
    ) -> Result<(JobContext, TrackedStep), TrackerError> {
        let step = tracker_queries::create_step(&self.pool, job_id, name).await?;
        let step_ctx = JobContext {
            job_id: Some(job_id),
            step_id: Some(step.id),
            external_id: ctx.external_id.clone(),
        };
        self.emit(&step_ctx, "info", &format!("step {} started", name))
            .await;
        Ok((step_ctx, step))
    }

    /// Terminate a step.
    pub async fn end_step(
        &self,
        ctx: &JobContext,
        step_id: i64,
        status: &str,
        error: Option<&str>,
    ) -> Result<(), TrackerError> {
        tracker_queries::end_step(&self.pool, step_id, status, error).await?;
        self.emit(ctx, "info", &format!("step ended with status {}", status))
            .await;
        Ok(())
    }

    /// Wrap a closure in a step: the step always ends, a panic becomes a
    /// failed step and an error, and errors propagate after the step record
    /// is written.
    pub async fn run_step<F, Fut, T>(
        &self,
        ctx: &JobContext,
        job_id: i64,
        name: &str,
        f: F,
    ) -> Result<T, TrackerError>
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let (step_ctx, step) = self.start_step(ctx, job_id, name).await?;

        let outcome = AssertUnwindSafe(f(step_ctx.clone())).catch_unwind().await;

        match outcome {
            Ok(Ok(value)) => {
                self.end_step(&step_ctx, step.id, tracked_status::COMPLETED, None)
                    .await?;
                Ok(value)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                self.end_step(&step_ctx, step.id, tracked_status::FAILED, Some(&message))
                    .await?;
                Err(TrackerError::Step(message))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.end_step(&step_ctx, step.id, tracked_status::FAILED, Some(&message))
                    .await?;
                Err(TrackerError::StepPanicked {
                    step: name.to_string(),
                    message,
                })
            }
        }
    }

    /// Lookup precedence: internal id, then external id, then the newest row
    /// with a matching context id.
    pub async fn find_job_by_any_id(&self, s: &str) -> Result<TrackedJob, TrackerError> {
        if let Ok(id) = s.parse::<i64>() {
            if let Some(job) = tracker_queries::get_job_by_id(&self.pool, id).await? {
                return Ok(job);
            }
        }
        if let Some(job) = tracker_queries::get_job_by_external_id(&self.pool, s).await? {
            return Ok(job);
        }
        if let Some(job) = tracker_queries::get_latest_job_by_context(&self.pool, s).await? {
            return Ok(job);
        }
        Err(TrackerError::NotFound(s.to_string()))
    }

    pub async fn steps(&self, job_id: i64) -> Result<Vec<TrackedStep>, TrackerError> {
        Ok(tracker_queries::list_steps_for_job(&self.pool, job_id).await?)
    }

    /// Structured log entry correlated to the context's job/step.
    pub async fn log(&self, ctx: &JobContext, level: &str, message: &str) {
        info!("[tracker job {:?}] {}", ctx.job_id, message);
        self.emit(ctx, level, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_manager::manager::test_pool;

    fn spec(op: &str) -> JobSpec {
        JobSpec {
            job_type: "backup".into(),
            operation: op.into(),
            owner: Some("system".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn job_lifecycle_with_steps() {
        let pool = test_pool().await;
        let tracker = JobTracker::with_default_sinks(pool.clone());

        let (ctx, job_id) = tracker
            .start_job(&JobContext::default(), spec("full-backup"))
            .await
            .unwrap();

        let result: i32 = tracker
            .run_step(&ctx, job_id, "prepare", |_ctx| async { Ok(41 + 1) })
            .await
            .unwrap();
        assert_eq!(result, 42);

        tracker.mark_job_progress(job_id, 150).await.unwrap();
        tracker
            .end_job(&ctx, job_id, tracked_status::COMPLETED, None)
            .await
            .unwrap();

        let job = tracker.find_job_by_any_id(&job_id.to_string()).await.unwrap();
        assert_eq!(job.status, tracked_status::COMPLETED);
        assert_eq!(job.percent_complete, 100);
        assert!(job.completed_at.is_some());

        let steps = tracker.steps(job_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].seq, 1);
        assert_eq!(steps[0].status, tracked_status::COMPLETED);

        // The DB sink correlated records to the job by foreign key
        let logs = crate::db::queries::tracker::list_logs_for_job(&pool, job_id)
            .await
            .unwrap();
        assert!(!logs.is_empty());
        assert!(logs.iter().all(|l| l.job_id == Some(job_id)));
    }

    #[tokio::test]
    async fn panicking_step_becomes_failed_step() {
        let pool = test_pool().await;
        let tracker = JobTracker::with_default_sinks(pool.clone());
        let (ctx, job_id) = tracker
            .start_job(&JobContext::default(), spec("export-setup"))
            .await
            .unwrap();

        let err = tracker
            .run_step::<_, _, ()>(&ctx, job_id, "explode", |_ctx| async {
                panic!("boom");
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::StepPanicked { .. }));

        let steps = tracker.steps(job_id).await.unwrap();
        assert_eq!(steps[0].status, tracked_status::FAILED);
        assert_eq!(steps[0].error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn step_sequence_is_monotonic_per_job() {
        let pool = test_pool().await;
        let tracker = JobTracker::with_default_sinks(pool.clone());
        let (ctx, job_id) = tracker
            .start_job(&JobContext::default(), spec("chained"))
            .await
            .unwrap();

        for name in ["one", "two", "three"] {
            tracker
                .run_step(&ctx, job_id, name, |_ctx| async { Ok(()) })
                .await
                .unwrap();
        }

        let steps = tracker.steps(job_id).await.unwrap();
        let seqs: Vec<i64> = steps.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn find_job_by_any_id_precedence() {
        let pool = test_pool().await;
        let tracker = JobTracker::with_default_sinks(pool.clone());

        let mut with_ids = spec("correlated");
        with_ids.external_id = Some("sched-7".into());
        with_ids.context_id = Some("vm-ctx-9".into());
        let (_ctx, job_id) = tracker
            .start_job(&JobContext::default(), with_ids)
            .await
            .unwrap();

        assert_eq!(
            tracker.find_job_by_any_id(&job_id.to_string()).await.unwrap().id,
            job_id
        );
        assert_eq!(
            tracker.find_job_by_any_id("sched-7").await.unwrap().id,
            job_id
        );
        assert_eq!(
            tracker.find_job_by_any_id("vm-ctx-9").await.unwrap().id,
            job_id
        );
        assert!(tracker.find_job_by_any_id("nope").await.is_err());
    }
}
