//! Endpoint readiness and the endpoints-driven VIP path
//!
//! The projector only decides *whether* a VIP should carry traffic. When a
//! Service has ready endpoints it hands the VIP over to [`EndpointSync`],
//! which writes the targets.

use crate::addressing::vip_key;
use crate::error::FirstError;
use crate::rules::BackendOps;
use crate::store::{BackendStore, GatewaySet};
use crate::validation::validate_port;
use crate::{Result, SyncMetrics};
use async_trait::async_trait;
use lbsync_api::{Protocol, Service, ServiceEndpoints, ServiceKey};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Endpoint readiness of a Service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
    /// No Endpoints object is known for the Service
    Unknown,
}

impl Readiness {
    pub fn is_ready(self) -> bool {
        self == Readiness::Ready
    }

    pub fn of(endpoints: Option<&ServiceEndpoints>) -> Self {
        match endpoints {
            Some(eps) if eps.has_ready_addresses() => Readiness::Ready,
            Some(_) => Readiness::NotReady,
            None => Readiness::Unknown,
        }
    }
}

#[async_trait]
pub trait EndpointSource: Send + Sync {
    async fn endpoints(&self, key: &ServiceKey) -> Option<ServiceEndpoints>;

    async fn readiness(&self, key: &ServiceKey) -> Readiness {
        Readiness::of(self.endpoints(key).await.as_ref())
    }
}

/// Writes VIPs for a Service that has ready endpoints
#[async_trait]
pub trait EndpointSync: Send + Sync {
    async fn add_endpoints(&self, service: &Service) -> Result<()>;
}

/// [`EndpointSync`] that writes VIP targets straight into the backend store
pub struct EndpointVipWriter {
    ops: BackendOps,
    gateways: Arc<dyn GatewaySet>,
    source: Arc<dyn EndpointSource>,
}

impl EndpointVipWriter {
    pub fn new(
        store: Arc<dyn BackendStore>,
        gateways: Arc<dyn GatewaySet>,
        source: Arc<dyn EndpointSource>,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            ops: BackendOps::new(store, metrics),
            gateways,
            source,
        }
    }

    /// Map `source_port` on each source address to `target_port` on every
    /// target of the same address family, and drop the reject rule of each
    /// VIP written
    async fn write_vips(
        &self,
        lb: &str,
        sources: &[String],
        source_port: i32,
        targets: &[String],
        target_port: i32,
        errors: &mut FirstError,
    ) {
        for source in sources {
            let is_ipv6 = source.contains(':');
            let vip_targets: Vec<String> = targets
                .iter()
                .filter(|t| t.contains(':') == is_ipv6)
                .map(|t| vip_key(t, target_port))
                .collect();

            let vip = vip_key(source, source_port);
            debug!("Setting {} on {} to {:?}", vip, lb, vip_targets);
            if let Err(e) = self.ops.set_vip(lb, &vip, &vip_targets).await {
                warn!("Failed to set VIP {} on {}: {}", vip, lb, e);
                errors.record(e);
                continue;
            }
            if let Err(e) = self
                .ops
                .remove_reject_rule(lb, source, source_port, "endpoints")
                .await
            {
                warn!("Failed to remove reject rule for {} on {}: {}", vip, lb, e);
                errors.record(e);
            }
        }
    }

    async fn write_gateway_vips(
        &self,
        service: &Service,
        protocol: Protocol,
        port: i32,
        node_port: Option<i32>,
        targets: &[String],
        target_port: i32,
        errors: &mut FirstError,
    ) {
        let external: Vec<String> = service
            .external_ips
            .iter()
            .chain(service.ingress_ips.iter())
            .cloned()
            .collect();
        if node_port.is_none() && external.is_empty() {
            return;
        }

        let gateways = match self.gateways.list_gateways().await {
            Ok(gateways) => gateways,
            Err(e) => {
                warn!("Unable to list gateways for {}: {}", service.key(), e);
                errors.record(e);
                return;
            }
        };

        for gateway in gateways {
            let lb = match self.gateways.gateway_load_balancer(&gateway, protocol).await {
                Ok(lb) => lb,
                Err(e) => {
                    warn!("Gateway {} has no {} load balancer: {}", gateway, protocol, e);
                    continue;
                }
            };

            if let Some(node_port) = node_port {
                match self.gateways.physical_addresses(&gateway).await {
                    Ok(physical) => {
                        self.write_vips(&lb.id, &physical, node_port, targets, target_port, errors)
                            .await
                    }
                    Err(e) => warn!("Gateway {} has no physical addresses: {}", gateway, e),
                }
            }

            if service.has_cluster_ip_type() && !external.is_empty() {
                self.write_vips(&lb.id, &external, port, targets, target_port, errors)
                    .await;
            }
        }
    }
}

#[async_trait]
impl EndpointSync for EndpointVipWriter {
    async fn add_endpoints(&self, service: &Service) -> Result<()> {
        let key = service.key();
        let Some(cluster_ip) = service.cluster_ip() else {
            return Ok(());
        };
        let Some(endpoints) = self.source.endpoints(&key).await else {
            debug!("No endpoints known for {}", key);
            return Ok(());
        };

        info!("Writing endpoint VIPs for service {}", key);
        let mut errors = FirstError::default();

        for svc_port in &service.ports {
            let protocol = match validate_port(&svc_port.protocol, svc_port.port) {
                Ok(protocol) => protocol,
                Err(e) => {
                    warn!("Skipping endpoints for port {:?} of {}: {}", svc_port.name, key, e);
                    continue;
                }
            };

            let node_port = (service.has_node_port() && svc_port.node_port > 0)
                .then_some(svc_port.node_port);

            for (target_port, targets) in endpoints.targets_for(svc_port) {
                if service.has_cluster_ip_type() {
                    match self.ops.store().find_cluster_load_balancer(protocol).await {
                        Ok(lb) => {
                            self.write_vips(
                                &lb.id,
                                &[cluster_ip.to_string()],
                                svc_port.port,
                                &targets,
                                target_port,
                                &mut errors,
                            )
                            .await
                        }
                        Err(e) => {
                            warn!("No cluster load balancer for {}: {}", protocol, e);
                            errors.record(e);
                        }
                    }
                }

                self.write_gateway_vips(
                    service,
                    protocol,
                    svc_port.port,
                    node_port,
                    &targets,
                    target_port,
                    &mut errors,
                )
                .await;
            }
        }

        errors.into_result()
    }
}
