use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use stowage_common::{ErrorKind, StowageError};

#[derive(Debug, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError(StowageError);

impl From<StowageError> for ApiError {
    fn from(err: StowageError) -> Self {
        ApiError(err)
    }
}

pub(crate) fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::AmbiguousIdentifier => StatusCode::BAD_REQUEST,
        ErrorKind::UnsupportedCapability => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::DriverError | ErrorKind::IoError => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::RemoteStoreError => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_of(kind);
        if status.is_server_error() {
            tracing::error!(?kind, error = %self.0, "Request failed");
        } else {
            tracing::debug!(?kind, error = %self.0, "Request rejected");
        }
        (
            status,
            Json(ErrorBody {
                kind,
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub(crate) type ApiResult<T> = Result<T, ApiError>;
