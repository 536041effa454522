#![forbid(unsafe_code)]

use jv_storage::StoreError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Execution fault raised by a handler, or synthesized from a panic or a
/// crashed worker. Persisted as `error.json` / `error.txt`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub trace: Vec<String>,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }
}

/// Handler parameter validation failure. Surfaces as `validation_error`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub field: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    pub fn for_field(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job type identifier must not be empty")]
    EmptyJobType,
    #[error("Unknown job_type: {0}")]
    UnknownJobType(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("io ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid artifact name: {0}")]
    InvalidName(String),
}

impl ArtifactError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of a capability call made by a running handler.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("invalid progress: {0}")]
    InvalidProgress(f64),
}

impl From<ContextError> for Fault {
    fn from(err: ContextError) -> Self {
        let kind = match &err {
            ContextError::Store(_) => "ContextStoreError",
            ContextError::Artifact(_) => "ContextArtifactError",
            ContextError::InvalidProgress(_) => "ContextInvalidProgress",
        };
        Fault::new(kind, err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Admission refused. The job is still recorded, as REJECTED.
    #[error("rejected ({code}): {message}")]
    Rejected {
        code: String,
        message: String,
        job_id: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SubmitError {
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => Some(code),
            Self::Store(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to spawn worker for {job_id}: {source}")]
    Spawn {
        job_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker process io: {0}")]
    Io(#[from] std::io::Error),
}
