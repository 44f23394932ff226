//! Audit events attached to Services

use async_trait::async_trait;
use lbsync_api::ServiceKey;
use tracing::warn;

#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Record a warning event against a Service. Delivery is best effort.
    async fn warning(&self, service: &ServiceKey, reason: &str, message: &str);
}

/// Recorder that only writes to the log
#[derive(Clone, Debug, Default)]
pub struct LogRecorder;

#[async_trait]
impl EventRecorder for LogRecorder {
    async fn warning(&self, service: &ServiceKey, reason: &str, message: &str) {
        warn!(service = %service, reason, "{}", message);
    }
}
