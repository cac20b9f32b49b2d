use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use stowage_core::{CreateBackupRequest, Runtime};
use stowage_object_storage::BackupSummary;
use utoipa::{IntoParams, ToSchema};

use crate::error::{ApiResult, ErrorBody};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct BackupCreated {
    pub url: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, IntoParams)]
pub struct ListBackupsQuery {
    /// Destination URL
    pub dest: String,
    /// Volume name, identifier or identifier prefix. Unknown values are used as a raw volume id.
    pub volume: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, IntoParams)]
pub struct BackupQuery {
    /// Backup URL as returned by create
    pub url: String,
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "backups",
    post,
    path = "/backups/create",
    request_body = CreateBackupRequest,
    responses(
        (status = 200, description = "URL of the new backup", body = BackupCreated),
        (status = 409, description = "Snapshot is already the last backup", body = ErrorBody),
        (status = 501, description = "Driver cannot back up", body = ErrorBody),
        (status = 502, description = "Destination failed", body = ErrorBody)
    )
)]
pub(crate) async fn create_backup(
    State(state): State<Arc<Runtime>>,
    Json(request): Json<CreateBackupRequest>,
) -> ApiResult<Json<BackupCreated>> {
    let url = state.create_backup(request).await?;
    Ok(Json(BackupCreated { url }))
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "backups",
    get,
    path = "/backups/list",
    params(ListBackupsQuery),
    responses((status = 200, description = "Backups at the destination", body = Vec<BackupSummary>))
)]
pub(crate) async fn list_backups(
    State(state): State<Arc<Runtime>>,
    Query(query): Query<ListBackupsQuery>,
) -> ApiResult<Json<Vec<BackupSummary>>> {
    Ok(Json(
        state
            .list_backups(&query.dest, query.volume.as_deref())
            .await?,
    ))
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "backups",
    get,
    path = "/backups/inspect",
    params(BackupQuery),
    responses(
        (status = 200, description = "The backup", body = BackupSummary),
        (status = 404, description = "Unknown backup", body = ErrorBody)
    )
)]
pub(crate) async fn inspect_backup(
    State(state): State<Arc<Runtime>>,
    Query(query): Query<BackupQuery>,
) -> ApiResult<Json<BackupSummary>> {
    Ok(Json(state.inspect_backup(&query.url).await?))
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "backups",
    delete,
    path = "/backups",
    params(BackupQuery),
    responses(
        (status = 204, description = "Backup deleted"),
        (status = 409, description = "Another backup depends on it", body = ErrorBody)
    )
)]
pub(crate) async fn delete_backup(
    State(state): State<Arc<Runtime>>,
    Query(query): Query<BackupQuery>,
) -> ApiResult<StatusCode> {
    state.delete_backup(&query.url).await?;
    Ok(StatusCode::NO_CONTENT)
}
