use lbsync_api::Protocol;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid port {port} for protocol {protocol:?}: {reason}")]
    Validation {
        protocol: String,
        port: i32,
        reason: String,
    },

    #[error("Protocol {protocol} is unsupported by the backend (service {service})")]
    UnsupportedProtocol { protocol: Protocol, service: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("Backend call failed: {0}")]
    Backend(String),

    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("Invalid VIP key: {0}")]
    InvalidVip(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }
}

/// Keeps the first failure of a loop that continues past errors
#[derive(Debug, Default)]
pub(crate) struct FirstError(Option<CoreError>);

impl FirstError {
    pub(crate) fn record(&mut self, err: CoreError) {
        if self.0.is_none() {
            self.0 = Some(err);
        }
    }

    pub(crate) fn into_result(self) -> Result<()> {
        match self.0 {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
