use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use log::info;
use serde::Deserialize;

use super::state::AppState;
use super::{error_response, ApiError};
use crate::app_versions::AppVersion;

#[derive(Debug, Deserialize)]
pub struct AddVersionRequest {
    pub version: String,
    pub schema: i64,
    pub location: String,
}

/// POST /api/apps/{app_id}/versions
/// Registers an installed app version and the schema its code expects
pub async fn add_version(
    State(state): State<AppState>,
    Path(app_id): Path<i64>,
    Json(req): Json<AddVersionRequest>,
) -> Result<(StatusCode, Json<AppVersion>), ApiError> {
    let conn = state.db.get_connection().map_err(error_response)?;
    let version = AppVersion::create(&conn, app_id, &req.version, req.schema, &req.location)
        .map_err(error_response)?;

    info!(
        "Added version {} of app {} at schema {}",
        version.version, app_id, version.schema
    );
    Ok((StatusCode::CREATED, Json(version)))
}
