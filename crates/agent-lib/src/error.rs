//! Error taxonomy for the profiling pipeline
//!
//! Every failure of a Profile call is one of these variants. The mapping onto
//! gRPC status codes lives here so the service only ever returns `?`.

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;
use tonic::{Code, Status};

pub type Result<T, E = ProfilerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ProfilerError {
    /// Malformed or missing request field
    #[error("{0}")]
    InvalidArgument(String),

    /// The runtime reports the container in a state other than running
    #[error("{container_id:?} container is not running")]
    NotRunning { container_id: String },

    /// The raw trace holds none of the expected cpu sampling events
    #[error("profile data does not contain cpu samples: {}", path.display())]
    NoSamples { path: PathBuf },

    /// The runtime returned a pid that cannot belong to a live process
    #[error("invalid PID is returned from container runtime: {pid} (container {container_id})")]
    InvalidPid { container_id: String, pid: i64 },

    /// The runtime status payload could not be decoded
    #[error("failed to parse runtime info for container {container_id}: {source}")]
    RuntimeInfo {
        container_id: String,
        #[source]
        source: serde_json::Error,
    },

    /// Error returned by the container runtime API, forwarded unchanged
    #[error(transparent)]
    Runtime(#[from] Status),

    /// The sampling tool exited unsuccessfully
    #[error("perf {subcommand} failed with {status}: {stderr}")]
    ToolFailed {
        subcommand: &'static str,
        status: ExitStatus,
        stderr: String,
    },

    /// The sampling tool could not be started at all
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem error around an artifact
    #[error("{context} {}: {source}", path.display())]
    Artifact {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The call was cancelled before the work finished
    #[error("profile call cancelled")]
    Cancelled,

    /// A worker task died without producing a result
    #[error("profile worker failed: {0}")]
    Worker(String),
}

impl ProfilerError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ProfilerError::InvalidArgument(message.into())
    }

    pub(crate) fn artifact(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ProfilerError::Artifact {
            context,
            path: path.into(),
            source,
        }
    }

    /// gRPC status code this error is reported with
    pub fn code(&self) -> Code {
        match self {
            ProfilerError::InvalidArgument(_) => Code::InvalidArgument,
            ProfilerError::NotRunning { .. } | ProfilerError::NoSamples { .. } => {
                Code::FailedPrecondition
            }
            ProfilerError::Runtime(status) => status.code(),
            ProfilerError::Cancelled => Code::Cancelled,
            ProfilerError::InvalidPid { .. }
            | ProfilerError::RuntimeInfo { .. }
            | ProfilerError::ToolFailed { .. }
            | ProfilerError::Spawn { .. }
            | ProfilerError::Artifact { .. }
            | ProfilerError::Worker(_) => Code::Internal,
        }
    }
}

impl From<ProfilerError> for Status {
    fn from(err: ProfilerError) -> Self {
        match err {
            ProfilerError::Runtime(status) => status,
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_running_maps_to_failed_precondition() {
        let status: Status = ProfilerError::NotRunning {
            container_id: "c1".to_string(),
        }
        .into();

        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(status.message(), "\"c1\" container is not running");
    }

    #[test]
    fn test_runtime_status_is_forwarded_unchanged() {
        let original = Status::not_found("container \"c9\" not found");
        let status: Status = ProfilerError::Runtime(original).into();

        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "container \"c9\" not found");
    }

    #[test]
    fn test_no_samples_is_distinct_from_internal() {
        let err = ProfilerError::NoSamples {
            path: PathBuf::from("/var/perfscope/profile/x.data"),
        };
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert!(err.to_string().contains("does not contain cpu samples"));

        let err = ProfilerError::InvalidPid {
            container_id: "c1".to_string(),
            pid: 0,
        };
        assert_eq!(err.code(), Code::Internal);
    }
}
