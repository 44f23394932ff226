//! Endpoints backing a Service

use crate::service::{ServiceKey, ServicePort};
use k8s_openapi::api::core::v1 as corev1;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: String,
    pub port: i32,
    pub protocol: String,
}

/// A group of ready addresses sharing the same set of ports
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoints {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

impl ServiceEndpoints {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.name.clone())
    }

    /// True when at least one address is ready to receive traffic
    pub fn has_ready_addresses(&self) -> bool {
        self.subsets.iter().any(|s| !s.addresses.is_empty())
    }

    /// Ready addresses and their target port for one service port
    ///
    /// Endpoint ports are matched by name and protocol. Returns one entry per
    /// target port, since subsets may expose the same named port on
    /// different numbers.
    pub fn targets_for(&self, port: &ServicePort) -> Vec<(i32, Vec<String>)> {
        let mut targets: Vec<(i32, Vec<String>)> = Vec::new();
        for subset in &self.subsets {
            if subset.addresses.is_empty() {
                continue;
            }
            for ep_port in &subset.ports {
                if ep_port.name != port.name || ep_port.protocol != port.protocol {
                    continue;
                }
                match targets.iter_mut().find(|(p, _)| *p == ep_port.port) {
                    Some((_, addrs)) => addrs.extend(subset.addresses.iter().cloned()),
                    None => targets.push((ep_port.port, subset.addresses.clone())),
                }
            }
        }
        targets
    }
}

impl From<&corev1::Endpoints> for ServiceEndpoints {
    fn from(ep: &corev1::Endpoints) -> Self {
        let subsets = ep
            .subsets
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|s| EndpointSubset {
                addresses: s
                    .addresses
                    .unwrap_or_default()
                    .into_iter()
                    .map(|a| a.ip)
                    .collect(),
                ports: s
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| EndpointPort {
                        name: p.name.unwrap_or_default(),
                        port: p.port,
                        protocol: p.protocol.unwrap_or_else(|| "TCP".to_string()),
                    })
                    .collect(),
            })
            .collect();

        Self {
            namespace: ep
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: ep.metadata.name.clone().unwrap_or_default(),
            subsets,
        }
    }
}
