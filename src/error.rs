use crate::models::BackendId;
use thiserror::Error;
use uuid::Uuid;

/// Result type for storage backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Result type for copy and export operations
pub type ReplResult<T> = std::result::Result<T, ReplError>;

/// Failure reported by a storage backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{path} not found on {backend}")]
    NotFound { backend: BackendId, path: String },

    #[error("{path} already exists on {backend}")]
    AlreadyExists { backend: BackendId, path: String },

    #[error("I/O error on {backend} at {path}: {source}")]
    Io {
        backend: BackendId,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no backend registered for {0}")]
    UnknownBackend(BackendId),

    #[error("invalid storage location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },
}

impl BackendError {
    pub fn io(backend: &BackendId, path: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return BackendError::NotFound {
                backend: backend.clone(),
                path: path.into(),
            };
        }
        BackendError::Io {
            backend: backend.clone(),
            path: path.into(),
            source,
        }
    }

    pub fn invalid_location(location: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::InvalidLocation {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// Failure reported by a delegated bulk-copy job
#[derive(Debug, Error)]
pub enum BulkCopyError {
    #[error("failed to launch bulk copy program {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bulk copy exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("bulk copy rejected the request: {0}")]
    Rejected(String),
}

/// Errors raised by the copy selector and the export planner
#[derive(Debug, Error)]
pub enum ReplError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to resolve backend: {0}")]
    Resolve(#[from] BackendError),

    #[error("failed to evaluate copy policy for {path} on {backend}: {source}")]
    PolicyEvaluation {
        backend: BackendId,
        path: String,
        #[source]
        source: BackendError,
    },

    #[error("failed to copy {source_uri} to {destination}: {source}")]
    CopyExecution {
        source_uri: String,
        destination: String,
        #[source]
        source: BackendError,
    },

    #[error("bulk copy job {job_id} from {backend} to {destination} failed: {source}")]
    BulkCopy {
        job_id: Uuid,
        backend: BackendId,
        destination: String,
        #[source]
        source: BulkCopyError,
    },

    #[error("{manifest} already exists and cannot export data from {source_root}")]
    ManifestConflict { manifest: String, source_root: String },

    #[error("failed to enumerate {path} on {backend}: {source}")]
    Enumeration {
        backend: BackendId,
        path: String,
        #[source]
        source: BackendError,
    },

    #[error("failed to checksum {uri}: {source}")]
    Checksum {
        uri: String,
        #[source]
        source: BackendError,
    },

    #[error("malformed manifest line {line_number}: {reason}")]
    MalformedManifestLine { line_number: usize, reason: String },
}

impl ReplError {
    /// Whether re-running the whole operation may succeed. Caller state
    /// errors such as exporting into an existing manifest never will.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            ReplError::InvalidArgument(_)
                | ReplError::ManifestConflict { .. }
                | ReplError::MalformedManifestLine { .. }
                | ReplError::Resolve(BackendError::UnknownBackend(_))
                | ReplError::Resolve(BackendError::InvalidLocation { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err = BackendError::io(
            &BackendId::local(),
            "/missing",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(err, BackendError::NotFound { .. }));
    }

    #[test]
    fn test_manifest_conflict_is_not_retriable() {
        let err = ReplError::ManifestConflict {
            manifest: "file:///out/_files".to_string(),
            source_root: "file:///data".to_string(),
        };
        assert!(!err.is_retriable());

        let err = ReplError::Enumeration {
            backend: BackendId::local(),
            path: "/data".to_string(),
            source: BackendError::io(
                &BackendId::local(),
                "/data",
                std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            ),
        };
        assert!(err.is_retriable());
    }
}
