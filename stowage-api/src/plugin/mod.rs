//! Volume plugin protocol subset.
//!
//! Requests are JSON objects carrying the volume `Name` and optional `Opts`. Every reply is
//! `200 OK` with an `Err` field that is empty on success.

use std::{collections::BTreeMap, sync::Arc};

use axum::{body::Bytes, extract::State, routing::post, Json, Router};
use serde::de::DeserializeOwned;
use stowage_common::{StowageError, StowageResult};
use stowage_core::{CreateVolumeRequest, Runtime};

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PluginRequest {
    name: String,
    #[serde(default)]
    opts: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct PluginResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    mountpoint: Option<String>,
    err: String,
}

impl PluginResponse {
    fn from_result(result: StowageResult<Option<String>>) -> Json<Self> {
        Json(match result {
            Ok(mountpoint) => Self {
                mountpoint,
                err: String::new(),
            },
            Err(e) => {
                tracing::warn!(kind = ?e.kind(), error = %e, "Plugin request failed");
                Self {
                    mountpoint: None,
                    err: e.to_string(),
                }
            }
        })
    }
}

pub(crate) fn setup_plugin_router() -> Router<Arc<Runtime>> {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/VolumeDriver.Create", post(create))
        .route("/VolumeDriver.Remove", post(remove))
        .route("/VolumeDriver.Mount", post(mount))
        .route("/VolumeDriver.Unmount", post(unmount))
        .route("/VolumeDriver.Path", post(path))
}

// Plugin clients send their own content type, so bodies are decoded by hand.
fn decode<T: DeserializeOwned + Default>(body: &Bytes) -> StowageResult<T> {
    if body.is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

/// Map plugin options onto a create request. Unknown options are handed to the driver.
pub(crate) fn create_request(
    name: String,
    opts: BTreeMap<String, String>,
) -> StowageResult<CreateVolumeRequest> {
    let mut request = CreateVolumeRequest {
        name: Some(name),
        ..Default::default()
    };
    for (key, value) in opts {
        match key.as_str() {
            "size" => {
                let size = value.parse::<u64>().map_err(|_| {
                    StowageError::InvalidState(format!("Invalid size option {value}"))
                })?;
                request.size = Some(size);
            }
            "driver" => request.driver = Some(value),
            "backup" => request.backup = Some(value),
            "filesystem" => request.filesystem = Some(value),
            _ => {
                request.driver_opts.insert(key, value);
            }
        }
    }
    Ok(request)
}

#[tracing::instrument(level = "info")]
async fn activate() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "Implements": ["VolumeDriver"] }))
}

#[tracing::instrument(level = "info", skip(state))]
async fn create(State(state): State<Arc<Runtime>>, body: Bytes) -> Json<PluginResponse> {
    let result = async {
        let request: PluginRequest = decode(&body)?;
        let request = create_request(request.name, request.opts.unwrap_or_default())?;
        state.create_volume(request).await?;
        Ok::<_, StowageError>(None)
    };
    PluginResponse::from_result(result.await)
}

#[tracing::instrument(level = "info", skip(state))]
async fn remove(State(state): State<Arc<Runtime>>, body: Bytes) -> Json<PluginResponse> {
    let result = async {
        let request: PluginRequest = decode(&body)?;
        state.delete_volume(&request.name, false).await?;
        Ok::<_, StowageError>(None)
    };
    PluginResponse::from_result(result.await)
}

#[tracing::instrument(level = "info", skip(state))]
async fn mount(State(state): State<Arc<Runtime>>, body: Bytes) -> Json<PluginResponse> {
    let result = async {
        let request: PluginRequest = decode(&body)?;
        let path = state.mount_volume(&request.name).await?;
        Ok::<_, StowageError>(Some(path.display().to_string()))
    };
    PluginResponse::from_result(result.await)
}

#[tracing::instrument(level = "info", skip(state))]
async fn unmount(State(state): State<Arc<Runtime>>, body: Bytes) -> Json<PluginResponse> {
    let result = async {
        let request: PluginRequest = decode(&body)?;
        state.umount_volume(&request.name).await?;
        Ok::<_, StowageError>(None)
    };
    PluginResponse::from_result(result.await)
}

#[tracing::instrument(level = "info", skip(state))]
async fn path(State(state): State<Arc<Runtime>>, body: Bytes) -> Json<PluginResponse> {
    let result = async {
        let request: PluginRequest = decode(&body)?;
        let volume = state.inspect_volume(&request.name).await?;
        Ok::<_, StowageError>(Some(
            volume
                .mount_point
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ))
    };
    PluginResponse::from_result(result.await)
}
