// Error taxonomy shared by the capture, upload and history layers.
// Each stage has its own enum; `PipelineError` wraps them and decides the
// process exit code.

use std::path::PathBuf;

use thiserror::Error;

use crate::api::UploadResult;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture tool `{0}` is not available")]
    Unavailable(String),

    #[error("capture tool `{tool}` does not support {mode} capture")]
    Unsupported { tool: String, mode: String },

    #[error("capture failed: {0}")]
    Failed(String),

    #[error("capture produced no image data")]
    Empty,

    #[error("could not read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum UploadError {
    /// Credentials were rejected, locally or by the server. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server answered with something we cannot interpret. Never retried.
    #[error("unexpected server response: {0}")]
    Protocol(String),

    /// Transient failure, retried with backoff until the limit is reached.
    #[error("network error after {attempts} attempt(s): {reason}")]
    Network { reason: String, attempts: u32 },

    #[error("artifact is empty")]
    InvalidArtifact,

    #[error("upload cancelled")]
    Cancelled,
}

impl UploadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::Network { .. })
    }

    pub(crate) fn network(reason: impl Into<String>) -> Self {
        UploadError::Network {
            reason: reason.into(),
            attempts: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("history file {} is not writable: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("history file {} could not be read: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("history file {} is corrupt at line {line}: {reason}", .path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("could not encode history record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    /// The upload itself went through; only the bookkeeping failed.
    #[error("uploaded to {} but history was not saved: {source}", .upload.url())]
    Storage {
        upload: UploadResult,
        #[source]
        source: StorageError,
    },
}

impl PipelineError {
    /// Process exit code for this failure. Zero is reserved for success.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Capture(_) => 2,
            PipelineError::Upload(UploadError::Auth(_)) => 3,
            PipelineError::Upload(UploadError::Protocol(_))
            | PipelineError::Upload(UploadError::InvalidArtifact) => 4,
            PipelineError::Upload(UploadError::Network { .. }) => 5,
            PipelineError::Upload(UploadError::Cancelled) => 130,
            PipelineError::Storage { .. } => 6,
        }
    }

    /// URL of an upload that succeeded before the pipeline failed, if any.
    pub fn uploaded_url(&self) -> Option<&str> {
        match self {
            PipelineError::Storage { upload, .. } => Some(upload.url()),
            _ => None,
        }
    }
}

/// Exit code for any error that reaches `main`. Pipeline failures keep their
/// own code even under added context; everything else is a usage or config
/// problem.
pub fn exit_code_of(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<PipelineError>()
        .map_or(1, PipelineError::exit_code)
}
