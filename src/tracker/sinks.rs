use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use sqlx::{Pool, Sqlite};

use crate::db::queries::tracker as tracker_queries;

use super::JobContext;

/// Destination for tracker log records. The tracker fans every record out to
/// all configured sinks; a sink failure must never fail the operation that
/// produced the record.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, ctx: &JobContext, level: &str, message: &str);
}

/// Persists records into the relational store so logs correlate to jobs and
/// steps by foreign key.
pub struct DatabaseSink {
    pool: Pool<Sqlite>,
}

impl DatabaseSink {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogSink for DatabaseSink {
    async fn write(&self, ctx: &JobContext, level: &str, message: &str) {
        if let Err(e) =
            tracker_queries::insert_log(&self.pool, ctx.job_id, ctx.step_id, level, message).await
        {
            warn!("Tracker DB sink write failed: {}", e);
        }
    }
}

/// Structured single-line records on stderr.
pub struct StderrSink;

#[async_trait]
impl LogSink for StderrSink {
    async fn write(&self, ctx: &JobContext, level: &str, message: &str) {
        eprintln!(
            "{} level={} job_id={} step_id={} msg={:?}",
            Utc::now().to_rfc3339(),
            level,
            ctx.job_id.map_or_else(|| "-".to_string(), |v| v.to_string()),
            ctx.step_id.map_or_else(|| "-".to_string(), |v| v.to_string()),
            message
        );
    }
}
