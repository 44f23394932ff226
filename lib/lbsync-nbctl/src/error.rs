use lbsync_core::CoreError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NbctlError>;

#[derive(Error, Debug)]
pub enum NbctlError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Command '{args}' failed: {stderr}")]
    Failed { args: String, stderr: String },

    #[error("Unable to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NbctlError {
    pub fn parse(what: &'static str, detail: impl Into<String>) -> Self {
        NbctlError::Parse {
            what,
            detail: detail.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        NbctlError::NotFound {
            kind,
            name: name.into(),
        }
    }
}

impl From<NbctlError> for CoreError {
    fn from(err: NbctlError) -> Self {
        match err {
            NbctlError::NotFound { kind, name } => CoreError::NotFound { kind, name },
            NbctlError::Parse { .. } | NbctlError::Json(_) => {
                CoreError::MalformedResponse(err.to_string())
            }
            other => CoreError::Backend(other.to_string()),
        }
    }
}
