use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use stowage_common::Volume;
use stowage_core::{CreateVolumeRequest, Runtime};
use utoipa::{IntoParams, ToSchema};

use crate::error::{ApiResult, ErrorBody};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct VolumeReference {
    /// Name, identifier or identifier prefix of the volume.
    pub volume: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct MountResponse {
    pub mountpoint: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, IntoParams)]
pub struct DeleteVolumeQuery {
    /// Only forget the volume, leaving its storage in place.
    #[serde(default)]
    pub reference_only: bool,
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "volumes",
    get,
    path = "/volumes",
    responses((status = 200, description = "All volumes with their snapshots", body = Vec<Volume>))
)]
pub(crate) async fn list_volumes(State(state): State<Arc<Runtime>>) -> ApiResult<Json<Vec<Volume>>> {
    Ok(Json(state.list_volumes().await?))
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "volumes",
    post,
    path = "/volumes/create",
    request_body = CreateVolumeRequest,
    responses(
        (status = 200, description = "The created volume", body = Volume),
        (status = 409, description = "Name already used", body = ErrorBody),
        (status = 501, description = "Driver cannot restore backups", body = ErrorBody)
    )
)]
pub(crate) async fn create_volume(
    State(state): State<Arc<Runtime>>,
    Json(request): Json<CreateVolumeRequest>,
) -> ApiResult<Json<Volume>> {
    Ok(Json(state.create_volume(request).await?))
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "volumes",
    get,
    path = "/volumes/{id}",
    params(("id" = String, Path, description = "Volume name, identifier or identifier prefix")),
    responses(
        (status = 200, description = "The volume", body = Volume),
        (status = 400, description = "Ambiguous identifier prefix", body = ErrorBody),
        (status = 404, description = "Unknown volume", body = ErrorBody)
    )
)]
pub(crate) async fn inspect_volume(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Volume>> {
    Ok(Json(state.inspect_volume(&id).await?))
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "volumes",
    delete,
    path = "/volumes/{id}",
    params(
        ("id" = String, Path, description = "Volume name, identifier or identifier prefix"),
        DeleteVolumeQuery
    ),
    responses(
        (status = 204, description = "Volume deleted"),
        (status = 409, description = "Volume is mounted or has activated snapshots", body = ErrorBody)
    )
)]
pub(crate) async fn delete_volume(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
    Query(query): Query<DeleteVolumeQuery>,
) -> ApiResult<StatusCode> {
    state.delete_volume(&id, query.reference_only).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "volumes",
    post,
    path = "/volumes/mount",
    request_body = VolumeReference,
    responses((status = 200, description = "Where the volume is exposed", body = MountResponse))
)]
pub(crate) async fn mount_volume(
    State(state): State<Arc<Runtime>>,
    Json(request): Json<VolumeReference>,
) -> ApiResult<Json<MountResponse>> {
    let path = state.mount_volume(&request.volume).await?;
    Ok(Json(MountResponse {
        mountpoint: path.display().to_string(),
    }))
}

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "volumes",
    post,
    path = "/volumes/umount",
    request_body = VolumeReference,
    responses((status = 204, description = "Volume unmounted"))
)]
pub(crate) async fn umount_volume(
    State(state): State<Arc<Runtime>>,
    Json(request): Json<VolumeReference>,
) -> ApiResult<StatusCode> {
    state.umount_volume(&request.volume).await?;
    Ok(StatusCode::NO_CONTENT)
}
