use crate::models::tracker::{TrackedJob, TrackedLog, TrackedStep};
use chrono::Utc;
use sqlx::{Pool, Sqlite};

/// Parameters for starting a tracked job
pub struct NewTrackedJob<'a> {
    pub external_id: Option<&'a str>,
    pub context_id: Option<&'a str>,
    pub parent_job_id: Option<i64>,
    pub job_type: &'a str,
    pub operation: &'a str,
    pub owner: Option<&'a str>,
    pub category: Option<&'a str>,
}

/// Insert a tracked job row in `running`
pub async fn create_job(
    pool: &Pool<Sqlite>,
    new: NewTrackedJob<'_>,
) -> Result<TrackedJob, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO tracker_jobs (
            external_id, context_id, parent_job_id, job_type, operation,
            owner, category, status, started_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, 'running', ?)",
    )
    .bind(new.external_id)
    .bind(new.context_id)
    .bind(new.parent_job_id)
    .bind(new.job_type)
    .bind(new.operation)
    .bind(new.owner)
    .bind(new.category)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    sqlx::query_as::<_, TrackedJob>("SELECT * FROM tracker_jobs WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_one(pool)
        .await
}

/// Terminate a tracked job
pub async fn end_job(
    pool: &Pool<Sqlite>,
    job_id: i64,
    status: &str,
    error_message: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE tracker_jobs SET status = ?, error_message = ?, completed_at = ? WHERE id = ?",
    )
    .bind(status)
    .bind(error_message)
    .bind(Utc::now())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record job progress (0..100)
pub async fn set_progress(
    pool: &Pool<Sqlite>,
    job_id: i64,
    percent: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE tracker_jobs SET percent_complete = ? WHERE id = ?")
        .bind(percent.clamp(0, 100))
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Get a tracked job by internal ID
pub async fn get_job_by_id(
    pool: &Pool<Sqlite>,
    job_id: i64,
) -> Result<Option<TrackedJob>, sqlx::Error> {
    sqlx::query_as::<_, TrackedJob>("SELECT * FROM tracker_jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Get a tracked job by caller-supplied external ID
pub async fn get_job_by_external_id(
    pool: &Pool<Sqlite>,
    external_id: &str,
) -> Result<Option<TrackedJob>, sqlx::Error> {
    sqlx::query_as::<_, TrackedJob>("SELECT * FROM tracker_jobs WHERE external_id = ?")
        .bind(external_id)
        .fetch_optional(pool)
        .await
}

/// Newest tracked job whose context id matches
pub async fn get_latest_job_by_context(
    pool: &Pool<Sqlite>,
    context_id: &str,
) -> Result<Option<TrackedJob>, sqlx::Error> {
    sqlx::query_as::<_, TrackedJob>(
        "SELECT * FROM tracker_jobs WHERE context_id = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(context_id)
    .fetch_optional(pool)
    .await
}

/// Start a step under a job, auto-sequenced by a per-job counter
pub async fn create_step(
    pool: &Pool<Sqlite>,
    job_id: i64,
    name: &str,
) -> Result<TrackedStep, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO tracker_steps (job_id, seq, name, status, started_at)
         VALUES (
            ?,
            (SELECT COALESCE(MAX(seq), 0) + 1 FROM tracker_steps WHERE job_id = ?),
            ?, 'running', ?
         )",
    )
    .bind(job_id)
    .bind(job_id)
    .bind(name)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    sqlx::query_as::<_, TrackedStep>("SELECT * FROM tracker_steps WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_one(pool)
        .await
}

/// Terminate a step
pub async fn end_step(
    pool: &Pool<Sqlite>,
    step_id: i64,
    status: &str,
    error_message: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE tracker_steps SET status = ?, error_message = ?, completed_at = ? WHERE id = ?",
    )
    .bind(status)
    .bind(error_message)
    .bind(Utc::now())
    .bind(step_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// All steps of a job in sequence order
pub async fn list_steps_for_job(
    pool: &Pool<Sqlite>,
    job_id: i64,
) -> Result<Vec<TrackedStep>, sqlx::Error> {
    sqlx::query_as::<_, TrackedStep>(
        "SELECT * FROM tracker_steps WHERE job_id = ? ORDER BY seq",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}

/// Persist a structured log record correlated to a job/step
pub async fn insert_log(
    pool: &Pool<Sqlite>,
    job_id: Option<i64>,
    step_id: Option<i64>,
    level: &str,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO tracker_logs (job_id, step_id, level, message, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(job_id)
    .bind(step_id)
    .bind(level)
    .bind(message)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Log records for a job, oldest first
pub async fn list_logs_for_job(
    pool: &Pool<Sqlite>,
    job_id: i64,
) -> Result<Vec<TrackedLog>, sqlx::Error> {
    sqlx::query_as::<_, TrackedLog>(
        "SELECT * FROM tracker_logs WHERE job_id = ? ORDER BY id",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}
