use std::fmt::Display;

pub type StowageResult<T> = Result<T, StowageError>;

/// Coarse classification of a [`StowageError`]. Context wrapping never changes the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    AmbiguousIdentifier,
    UnsupportedCapability,
    InvalidState,
    DriverError,
    IoError,
    RemoteStoreError,
}

#[derive(Debug, thiserror::Error)]
pub enum StowageError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Identifier prefix {0} matches more than one identifier")]
    AmbiguousIdentifier(String),
    #[error("Driver {driver} does not support {capability} operations")]
    UnsupportedCapability { driver: String, capability: String },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Driver error: {0}")]
    Driver(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to (de)serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Remote store error: {0}")]
    RemoteStore(String),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<Self>,
    },
}

impl StowageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StowageError::NotFound(_) => ErrorKind::NotFound,
            StowageError::Conflict(_) => ErrorKind::Conflict,
            StowageError::AmbiguousIdentifier(_) => ErrorKind::AmbiguousIdentifier,
            StowageError::UnsupportedCapability { .. } => ErrorKind::UnsupportedCapability,
            StowageError::InvalidState(_) => ErrorKind::InvalidState,
            StowageError::Driver(_) => ErrorKind::DriverError,
            StowageError::Io(_) | StowageError::Serialization(_) => ErrorKind::IoError,
            StowageError::RemoteStore(_) => ErrorKind::RemoteStoreError,
            StowageError::ObjectStore(object_store::Error::NotFound { .. }) => ErrorKind::NotFound,
            StowageError::ObjectStore(_) => ErrorKind::RemoteStoreError,
            StowageError::Context { source, .. } => source.kind(),
        }
    }

    /// Wrap the error with the operation it happened in. The kind is preserved.
    pub fn context(self, context: impl Display) -> Self {
        StowageError::Context {
            context: context.to_string(),
            source: Box::new(self),
        }
    }

    pub fn driver(message: impl Display) -> Self {
        StowageError::Driver(message.to_string())
    }
}

pub trait ResultExt<T> {
    fn context(self, context: impl Display) -> StowageResult<T>;

    fn with_context<C: Display, F: FnOnce() -> C>(self, f: F) -> StowageResult<T>;
}

impl<T, E: Into<StowageError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Display) -> StowageResult<T> {
        self.map_err(|e| {
            let err: StowageError = e.into();
            err.context(context)
        })
    }

    fn with_context<C: Display, F: FnOnce() -> C>(self, f: F) -> StowageResult<T> {
        self.map_err(|e| {
            let err: StowageError = e.into();
            err.context(f())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_kind() {
        let err = StowageError::InvalidState("snapshot is activated".to_string())
            .context("delete volume v1")
            .context("request");
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(
            err.to_string(),
            "request: delete volume v1: Invalid state: snapshot is activated"
        );
    }

    #[test]
    fn io_errors_map_to_io_kind() {
        let result: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let err = result.context("read block").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
    }

    #[test]
    fn object_store_not_found_is_not_found() {
        let err = StowageError::from(object_store::Error::NotFound {
            path: "a/b".to_string(),
            source: "missing".into(),
        });
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
