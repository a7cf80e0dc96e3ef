use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::pin::Pin;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::{Stream, StreamExt};

use super::state::AppState;
use super::{api_error, error_response, ApiError};
use crate::app_versions::AppVersion;
use crate::appspaces::Appspace;
use crate::job::StatusEvent;
use crate::migration_jobs::MigrationJob;

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

#[derive(Debug, Deserialize)]
pub struct SubmitMigrationRequest {
    pub owner_id: i64,
    pub to_version: String,
    #[serde(default)]
    pub priority: bool,
}

/// A stored job, plus its live status while it runs
#[derive(Debug, Serialize)]
pub struct MigrationDetail {
    pub job: MigrationJob,
    pub live: Option<StatusEvent>,
}

/// POST /api/appspaces/{appspace_id}/migrations
/// Queues a migration, replacing any job still pending for the appspace.
/// Returns 202: the job runs when the scheduler claims it.
pub async fn submit_migration(
    State(state): State<AppState>,
    Path(appspace_id): Path<i64>,
    Json(req): Json<SubmitMigrationRequest>,
) -> Result<(StatusCode, Json<MigrationJob>), ApiError> {
    {
        let conn = state.db.get_connection().map_err(error_response)?;
        let appspace = Appspace::get_by_id(&conn, appspace_id)
            .map_err(error_response)?
            .ok_or_else(|| {
                api_error(
                    StatusCode::NOT_FOUND,
                    format!("Appspace {} not found", appspace_id),
                )
            })?;
        if AppVersion::get(&conn, appspace.app_id, &req.to_version)
            .map_err(error_response)?
            .is_none()
        {
            return Err(api_error(
                StatusCode::NOT_FOUND,
                format!(
                    "Version {} of app {} is not installed",
                    req.to_version, appspace.app_id
                ),
            ));
        }
    }

    let job = state
        .scheduler
        .submit(req.owner_id, appspace_id, &req.to_version, req.priority)
        .map_err(error_response)?;

    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// GET /api/appspaces/{appspace_id}/migrations
/// Newest first
pub async fn list_migrations(
    State(state): State<AppState>,
    Path(appspace_id): Path<i64>,
) -> Result<Json<Vec<MigrationJob>>, ApiError> {
    let conn = state.db.get_connection().map_err(error_response)?;
    let jobs = MigrationJob::get_for_appspace(&conn, appspace_id).map_err(error_response)?;
    Ok(Json(jobs))
}

/// GET /api/migrations/running
pub async fn running_migrations(State(state): State<AppState>) -> Json<Vec<StatusEvent>> {
    Json(state.scheduler.running_jobs())
}

/// GET /api/migrations/{job_id}
pub async fn get_migration(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Result<Json<MigrationDetail>, ApiError> {
    let conn = state.db.get_connection().map_err(error_response)?;
    let job = MigrationJob::get_by_id(&conn, job_id)
        .map_err(error_response)?
        .ok_or_else(|| job_not_found(job_id))?;

    Ok(Json(MigrationDetail {
        live: state.scheduler.job_status(job_id),
        job,
    }))
}

/// GET /api/migrations/{job_id}/events
///
/// For a running job: the current snapshot, then every status change until
/// the job finishes. Events that do not fit the client's buffer are dropped;
/// the client re-fetches the job to catch up. For any other job: one `job`
/// event with the stored record.
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let stream: EventStream = match state.scheduler.subscribe_job(job_id) {
        Some((snapshot, rx)) => Box::pin(
            tokio_stream::once(snapshot)
                .chain(ReceiverStream::new(rx))
                .map(|event| status_event(&event)),
        ),
        None => {
            let conn = state.db.get_connection().map_err(error_response)?;
            let job = MigrationJob::get_by_id(&conn, job_id)
                .map_err(error_response)?
                .ok_or_else(|| job_not_found(job_id))?;
            let json = serde_json::to_string(&job).unwrap_or_default();
            Box::pin(tokio_stream::once(Ok(Event::default().event("job").data(json))))
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /api/migrations/events
/// Status changes of every job, live only
pub async fn all_events(State(state): State<AppState>) -> impl IntoResponse {
    let stream = BroadcastStream::new(state.scheduler.subscribe()).filter_map(|result| {
        match result {
            Ok(event) => Some(status_event(&event)),
            Err(_) => None, // Skip lagged messages
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn status_event(event: &StatusEvent) -> Result<Event, Infallible> {
    let json = serde_json::to_string(event).unwrap_or_default();
    Ok(Event::default().event("status").data(json))
}

fn job_not_found(job_id: i64) -> ApiError {
    api_error(
        StatusCode::NOT_FOUND,
        format!("Migration job {} not found", job_id),
    )
}
