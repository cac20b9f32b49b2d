use std::sync::Arc;

use axum::{extract::State, Json};
use stowage_core::{Runtime, SystemInfo};

use crate::error::ApiResult;

#[tracing::instrument(level = "info", skip(state))]
#[utoipa::path(
    tag = "system",
    get,
    path = "/info",
    responses((status = 200, description = "Version, drivers and record counts", body = SystemInfo))
)]
pub(crate) async fn system_info(State(state): State<Arc<Runtime>>) -> ApiResult<Json<SystemInfo>> {
    Ok(Json(state.info().await?))
}
