use std::sync::Arc;

use axum::Router;
use stowage_core::Runtime;
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};

mod backups;
mod info;
mod snapshots;
mod volumes;

#[derive(utoipa::OpenApi)]
#[openapi()]
pub struct ClientApiDoc;

pub(crate) fn setup_client_router() -> (Router<Arc<Runtime>>, utoipa::openapi::OpenApi) {
    let (client_router, client_api) = OpenApiRouter::with_openapi(ClientApiDoc::openapi())
        .routes(routes!(info::system_info))
        .routes(routes!(volumes::list_volumes))
        .routes(routes!(volumes::create_volume))
        .routes(routes!(volumes::inspect_volume, volumes::delete_volume))
        .routes(routes!(volumes::mount_volume))
        .routes(routes!(volumes::umount_volume))
        .routes(routes!(snapshots::create_snapshot))
        .routes(routes!(snapshots::inspect_snapshot, snapshots::delete_snapshot))
        .routes(routes!(snapshots::activate_snapshot))
        .routes(routes!(snapshots::deactivate_snapshot))
        .routes(routes!(backups::create_backup))
        .routes(routes!(backups::list_backups))
        .routes(routes!(backups::inspect_backup))
        .routes(routes!(backups::delete_backup))
        .split_for_parts();

    (client_router, client_api)
}
