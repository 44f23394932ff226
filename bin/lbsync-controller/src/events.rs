//! Warning events posted against Services

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::PostParams;
use kube::{Api, Client};
use lbsync_api::ServiceKey;
use lbsync_core::EventRecorder;
use tracing::{debug, warn};

const COMPONENT: &str = "lbsync-controller";

/// [`EventRecorder`] that creates core/v1 Events through the API server
pub struct KubeEventRecorder {
    client: Client,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn warning_event(service: &ServiceKey, reason: &str, message: &str) -> Event {
    let now = Time(chrono::Utc::now());
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}.", service.name)),
            namespace: Some(service.namespace.clone()),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Service".to_string()),
            name: Some(service.name.clone()),
            namespace: Some(service.namespace.clone()),
            ..Default::default()
        },
        type_: Some("Warning".to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        count: Some(1),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        source: Some(EventSource {
            component: Some(COMPONENT.to_string()),
            ..Default::default()
        }),
        reporting_component: Some(COMPONENT.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn warning(&self, service: &ServiceKey, reason: &str, message: &str) {
        let events: Api<Event> = Api::namespaced(self.client.clone(), &service.namespace);
        let event = warning_event(service, reason, message);
        match events.create(&PostParams::default(), &event).await {
            Ok(_) => debug!("Recorded {} event for {}", reason, service),
            Err(e) => warn!("Failed to record {} event for {}: {}", reason, service, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_event_refers_to_service() {
        let event = warning_event(
            &ServiceKey::new("ns1", "svc1"),
            "UnsupportedProtocol",
            "SCTP protocol is unsupported",
        );

        assert_eq!(event.metadata.namespace.as_deref(), Some("ns1"));
        assert_eq!(event.involved_object.kind.as_deref(), Some("Service"));
        assert_eq!(event.involved_object.name.as_deref(), Some("svc1"));
        assert_eq!(event.type_.as_deref(), Some("Warning"));
        assert_eq!(event.reason.as_deref(), Some("UnsupportedProtocol"));
    }
}
