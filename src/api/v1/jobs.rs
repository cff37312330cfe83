use rocket::serde::json::{json, Json, Value};
use rocket::{get, State};
use std::sync::Arc;

use crate::api::auth::ApiUser;
use crate::api::error::ApiError;
use crate::tracker::JobTracker;

/// Execution-side job record by any id: internal id, external id, or
/// context id (newest wins), with its steps.
#[get("/jobs/<any_id>")]
pub async fn get_tracked_job(
    _user: ApiUser,
    tracker: &State<Arc<JobTracker>>,
    any_id: String,
) -> Result<Json<Value>, ApiError> {
    let job = tracker.find_job_by_any_id(&any_id).await?;
    let steps = tracker.steps(job.id).await?;
    Ok(Json(json!({
        "job": job,
        "steps": steps,
    })))
}
