use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use log::info;
use serde::{Deserialize, Serialize};

use super::state::AppState;
use super::{api_error, error_response, ApiError};
use crate::appspaces::Appspace;
use crate::database::Database;
use crate::migration_jobs::MigrationJob;

#[derive(Debug, Deserialize)]
pub struct CreateAppspaceRequest {
    pub owner_id: i64,
    pub app_id: i64,
    pub app_version: String,
    pub data_location: String,
}

/// A new appspace and the priority job that initializes its data
#[derive(Debug, Serialize)]
pub struct CreateAppspaceResponse {
    pub appspace: Appspace,
    pub job: MigrationJob,
}

/// POST /api/appspaces
pub async fn create_appspace(
    State(state): State<AppState>,
    Json(req): Json<CreateAppspaceRequest>,
) -> Result<(StatusCode, Json<CreateAppspaceResponse>), ApiError> {
    let appspace = {
        let conn = state.db.get_connection().map_err(error_response)?;
        Appspace::create_for_version(
            &conn,
            req.owner_id,
            req.app_id,
            &req.app_version,
            &req.data_location,
        )
        .map_err(error_response)?
    };

    let job = state
        .scheduler
        .submit(req.owner_id, appspace.appspace_id, &req.app_version, true)
        .map_err(error_response)?;

    info!(
        "Created appspace {} for owner {} on app {} version {}",
        appspace.appspace_id, req.owner_id, req.app_id, req.app_version
    );
    Ok((
        StatusCode::CREATED,
        Json(CreateAppspaceResponse { appspace, job }),
    ))
}

/// DELETE /api/appspaces/{appspace_id}
/// Refused with 409 while the appspace is paused, e.g. mid-migration
pub async fn delete_appspace(
    State(state): State<AppState>,
    Path(appspace_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let Some(_closed) = state.pause.lock_closed(appspace_id) else {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("Appspace {} is busy; try again later", appspace_id),
        ));
    };

    let conn = state.db.get_connection().map_err(error_response)?;
    Database::immediate_transaction(&conn, |c| {
        MigrationJob::delete_for_appspace(c, appspace_id)?;
        Appspace::delete(c, appspace_id)
    })
    .map_err(error_response)?;

    info!("Deleted appspace {}", appspace_id);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pause::PauseCoordinator;
    use crate::test_support::{seed_appspace, seed_versions, test_state, TestDb};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_create_appspace_queues_priority_job() {
        let test_db = TestDb::new();
        let (state, _) = test_state(&test_db);
        seed_versions(&test_db.conn());
        let data_root = tempfile::TempDir::new().unwrap();
        let data = data_root.path().join("new");

        let (status, Json(created)) = create_appspace(
            State(state),
            Json(CreateAppspaceRequest {
                owner_id: 7,
                app_id: 1,
                app_version: "2.0.0".into(),
                data_location: data.to_string_lossy().into_owned(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.appspace.app_version, "2.0.0");
        assert_eq!(created.job.appspace_id, created.appspace.appspace_id);
        assert_eq!(created.job.to_version, "2.0.0");
        assert!(created.job.priority);
        assert!(created.job.is_pending());
        assert!(data.is_dir());

        let conn = test_db.conn();
        assert_eq!(
            Appspace::get_schema(&conn, created.appspace.appspace_id).unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_create_appspace_unknown_version() {
        let test_db = TestDb::new();
        let (state, _) = test_state(&test_db);

        let (status, _) = create_appspace(
            State(state),
            Json(CreateAppspaceRequest {
                owner_id: 7,
                app_id: 1,
                app_version: "2.0.0".into(),
                data_location: "/data/new".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_refused_while_paused() {
        let test_db = TestDb::new();
        let (state, locks) = test_state(&test_db);
        let appspace = seed_appspace(&test_db.conn(), "1.0.0", 1);
        MigrationJob::create(&test_db.conn(), 1, appspace.appspace_id, "2.0.0", false).unwrap();

        let pause = locks.wait_temp_paused(appspace.appspace_id, "backup");
        let (status, _) = delete_appspace(State(state.clone()), Path(appspace.appspace_id))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);
        drop(pause);

        let status = delete_appspace(State(state.clone()), Path(appspace.appspace_id))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let conn = test_db.conn();
        assert_eq!(Appspace::get_by_id(&conn, appspace.appspace_id).unwrap(), None);
        assert!(MigrationJob::get_for_appspace(&conn, appspace.appspace_id)
            .unwrap()
            .is_empty());
        assert!(!locks.is_paused(appspace.appspace_id));

        let (status, _) = delete_appspace(State(state), Path(appspace.appspace_id))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
