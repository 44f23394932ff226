use k8s_openapi::api::core::v1 as corev1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation set by the idler on services scaled to zero
pub const IDLED_AT_ANNOTATION: &str = "k8s.ovn.org/idled-at";

/// Cluster IP value Kubernetes uses for headless services
const HEADLESS_CLUSTER_IP: &str = "None";

/// Identity of a Service: namespace and name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Service type, as far as it influences which addresses a Service exposes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

impl ServiceType {
    fn from_k8s(type_: Option<&str>) -> Self {
        match type_ {
            Some("NodePort") => ServiceType::NodePort,
            Some("LoadBalancer") => ServiceType::LoadBalancer,
            Some("ExternalName") => ServiceType::ExternalName,
            _ => ServiceType::ClusterIP,
        }
    }
}

/// One port of a Service
///
/// `protocol` is kept as the raw string from the object so that validation
/// can reject values the backend has no load balancer for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(default)]
    pub name: String,
    pub protocol: String,
    pub port: i32,
    /// Zero when no node port is allocated
    #[serde(default)]
    pub node_port: i32,
}

impl ServicePort {
    pub fn tcp(port: i32) -> Self {
        Self {
            name: String::new(),
            protocol: "TCP".to_string(),
            port,
            node_port: 0,
        }
    }
}

/// Immutable snapshot of a Service taken from a watch event
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub service_type: ServiceType,
    #[serde(default)]
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub external_ips: Vec<String>,
    /// Cloud load-balancer ingress addresses from the Service status
    #[serde(default)]
    pub ingress_ips: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Service {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.name.clone())
    }

    /// The cluster IP, if one is allocated (headless services have none)
    pub fn cluster_ip(&self) -> Option<&str> {
        self.cluster_ip
            .as_deref()
            .filter(|ip| !ip.is_empty() && *ip != HEADLESS_CLUSTER_IP)
    }

    /// Every type except ExternalName gets a cluster IP
    pub fn has_cluster_ip_type(&self) -> bool {
        self.service_type != ServiceType::ExternalName
    }

    pub fn has_node_port(&self) -> bool {
        matches!(
            self.service_type,
            ServiceType::NodePort | ServiceType::LoadBalancer
        )
    }

    pub fn is_idled(&self) -> bool {
        self.annotations.contains_key(IDLED_AT_ANNOTATION)
    }

    /// Port traffic is routed on: the node port when the service has one
    pub fn routing_port(&self, port: &ServicePort) -> i32 {
        if self.has_node_port() {
            port.node_port
        } else {
            port.port
        }
    }

    /// Whether any field that decides VIP or reject-rule placement differs
    pub fn placement_changed(&self, other: &Service) -> bool {
        self.ports != other.ports
            || self.external_ips != other.external_ips
            || self.cluster_ip != other.cluster_ip
            || self.service_type != other.service_type
            || self.ingress_ips != other.ingress_ips
    }
}

impl From<&corev1::Service> for Service {
    fn from(svc: &corev1::Service) -> Self {
        let spec = svc.spec.clone().unwrap_or_default();

        let ports = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| ServicePort {
                name: p.name.unwrap_or_default(),
                protocol: p.protocol.unwrap_or_else(|| "TCP".to_string()),
                port: p.port,
                node_port: p.node_port.unwrap_or(0),
            })
            .collect();

        let ingress_ips = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|ingress| {
                ingress
                    .iter()
                    .filter_map(|i| i.ip.clone())
                    .filter(|ip| !ip.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            namespace: svc
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: svc.metadata.name.clone().unwrap_or_default(),
            service_type: ServiceType::from_k8s(spec.type_.as_deref()),
            cluster_ip: spec.cluster_ip,
            ports,
            external_ips: spec.external_ips.unwrap_or_default(),
            ingress_ips,
            annotations: svc.metadata.annotations.clone().unwrap_or_default(),
        }
    }
}
