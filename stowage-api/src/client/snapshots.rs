use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use stowage_common::Snapshot;
use stowage_core::{CreateSnapshotRequest, Runtime};
use utoipa::ToSchema;

use crate::error::{ApiResult, ErrorBody};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct ActivateResponse {
    pub device: String,
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "snapshots",
    post,
    path = "/snapshots/create",
    request_body = CreateSnapshotRequest,
    responses(
        (status = 200, description = "The created snapshot", body = Snapshot),
        (status = 409, description = "Name already used", body = ErrorBody)
    )
)]
pub(crate) async fn create_snapshot(
    State(state): State<Arc<Runtime>>,
    Json(request): Json<CreateSnapshotRequest>,
) -> ApiResult<Json<Snapshot>> {
    Ok(Json(state.create_snapshot(request).await?))
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "snapshots",
    get,
    path = "/snapshots/{id}",
    params(("id" = String, Path, description = "Snapshot name, identifier or identifier prefix")),
    responses(
        (status = 200, description = "The snapshot", body = Snapshot),
        (status = 404, description = "Unknown snapshot", body = ErrorBody)
    )
)]
pub(crate) async fn inspect_snapshot(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Snapshot>> {
    Ok(Json(state.inspect_snapshot(&id).await?))
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "snapshots",
    delete,
    path = "/snapshots/{id}",
    params(("id" = String, Path, description = "Snapshot name, identifier or identifier prefix")),
    responses(
        (status = 204, description = "Snapshot deleted"),
        (status = 409, description = "Snapshot is activated", body = ErrorBody)
    )
)]
pub(crate) async fn delete_snapshot(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.delete_snapshot(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "snapshots",
    post,
    path = "/snapshots/{id}/activate",
    params(("id" = String, Path, description = "Snapshot name, identifier or identifier prefix")),
    responses((status = 200, description = "Device node of the snapshot", body = ActivateResponse))
)]
pub(crate) async fn activate_snapshot(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ActivateResponse>> {
    let path = state.activate_snapshot(&id).await?;
    Ok(Json(ActivateResponse {
        device: path.display().to_string(),
    }))
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "snapshots",
    post,
    path = "/snapshots/{id}/deactivate",
    params(("id" = String, Path, description = "Snapshot name, identifier or identifier prefix")),
    responses((status = 204, description = "Snapshot deactivated"))
)]
pub(crate) async fn deactivate_snapshot(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.deactivate_snapshot(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
