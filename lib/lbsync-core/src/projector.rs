//! Per-Service projection onto load-balancer VIPs and reject rules
//!
//! Each Service port lands on the cluster load balancer of its protocol and,
//! for node ports and external addresses, on every gateway load balancer.
//! A VIP that already has targets is left to the endpoints path. A Service
//! with ready endpoints is handed to [`EndpointSync`]. Anything else gets a
//! reject rule unless the Service is idled and idle events are enabled.

use crate::addressing::vip_key;
use crate::endpoints::{EndpointSync, Readiness};
use crate::error::FirstError;
use crate::events::EventRecorder;
use crate::rules::BackendOps;
use crate::store::{BackendStore, GatewaySet, LoadBalancerRef};
use crate::validation::validate_port;
use crate::{CoreError, Result, SyncMetrics};
use lbsync_api::{Protocol, Service, ServicePort};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Behavior switches for the projector
#[derive(Clone, Debug)]
pub struct ProjectorConfig {
    /// Backend can load-balance SCTP
    pub sctp_supported: bool,
    /// Idled Services emit events on traffic instead of rejecting it
    pub idle_events_enabled: bool,
    /// Log packets matched by reject rules
    pub reject_rule_logging: bool,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            sctp_supported: true,
            idle_events_enabled: false,
            reject_rule_logging: false,
        }
    }
}

/// What to do with one VIP of a Service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Placement {
    AlreadyPopulated,
    Delegate,
    Reject,
    Skip,
}

pub struct ServiceProjector {
    ops: BackendOps,
    gateways: Arc<dyn GatewaySet>,
    endpoints: Arc<dyn EndpointSync>,
    recorder: Arc<dyn EventRecorder>,
    config: ProjectorConfig,
}

/// Per-call state of a create
struct CreatePass<'a> {
    service: &'a Service,
    ready: bool,
    qualifies: bool,
    delegated: bool,
    errors: FirstError,
}

impl ServiceProjector {
    pub fn new(
        store: Arc<dyn BackendStore>,
        gateways: Arc<dyn GatewaySet>,
        endpoints: Arc<dyn EndpointSync>,
        recorder: Arc<dyn EventRecorder>,
        config: ProjectorConfig,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            ops: BackendOps::new(store, metrics),
            gateways,
            endpoints,
            recorder,
            config,
        }
    }

    pub fn config(&self) -> &ProjectorConfig {
        &self.config
    }

    /// A Service without endpoints gets reject rules unless it is idled and
    /// idle events are enabled
    pub fn qualifies_for_reject(&self, service: &Service) -> bool {
        !(service.is_idled() && self.config.idle_events_enabled)
    }

    /// Apply every VIP and reject rule `service` implies
    ///
    /// Port-level failures are logged and skipped. Only an SCTP port on a
    /// backend without SCTP support aborts the whole Service.
    pub async fn create(&self, service: &Service, readiness: Readiness) -> Result<()> {
        let key = service.key();
        let Some(cluster_ip) = service.cluster_ip() else {
            debug!("Skipping service create: no cluster IP for {}", key);
            return Ok(());
        };
        if service.ports.is_empty() {
            debug!("Skipping service create: no ports for {}", key);
            return Ok(());
        }

        info!("Creating service {}", key);
        let mut pass = CreatePass {
            service,
            ready: readiness.is_ready(),
            qualifies: self.qualifies_for_reject(service),
            delegated: false,
            errors: FirstError::default(),
        };

        for svc_port in &service.ports {
            let port = service.routing_port(svc_port);
            let protocol = match validate_port(&svc_port.protocol, port) {
                Ok(protocol) => protocol,
                Err(e) => {
                    warn!("Skipping port {:?} of {}: {}", svc_port.name, key, e);
                    self.ops.metrics().ports_skipped_total.inc();
                    continue;
                }
            };

            if protocol == Protocol::Sctp && !self.config.sctp_supported {
                self.recorder
                    .warning(
                        &key,
                        "UnsupportedProtocol",
                        "SCTP protocol is unsupported by the load-balancing backend",
                    )
                    .await;
                return Err(CoreError::UnsupportedProtocol {
                    protocol,
                    service: key.to_string(),
                });
            }

            if service.has_node_port() {
                self.create_node_port(&mut pass, protocol, port).await;
            }
            if service.has_cluster_ip_type() {
                self.create_cluster(&mut pass, cluster_ip, protocol, svc_port)
                    .await;
            }
        }

        pass.errors.into_result()
    }

    /// Delete then create when a placement field changed
    pub async fn update(&self, old: &Service, new: &Service, readiness: Readiness) -> Result<()> {
        if !old.placement_changed(new) {
            debug!("Skipping service update for {}: placement unchanged", new.key());
            return Ok(());
        }

        info!("Updating service {}", new.key());
        let removed = self.delete(old).await;
        if let Err(e) = &removed {
            warn!("Failed to fully delete old state of {}: {}", old.key(), e);
        }
        self.create(new, readiness).await.and(removed)
    }

    /// Remove every VIP and reject rule `service` implies
    pub async fn delete(&self, service: &Service) -> Result<()> {
        let key = service.key();
        let Some(cluster_ip) = service.cluster_ip() else {
            return Ok(());
        };

        info!("Deleting service {}", key);
        let mut errors = FirstError::default();
        let gateways = match self.ops.track(self.gateways.list_gateways().await) {
            Ok(gateways) => gateways,
            Err(e) => {
                warn!("Unable to list gateways while deleting {}: {}", key, e);
                errors.record(e);
                Vec::new()
            }
        };

        for svc_port in &service.ports {
            let port = service.routing_port(svc_port);
            let protocol = match validate_port(&svc_port.protocol, port) {
                Ok(protocol) => protocol,
                Err(e) => {
                    warn!("Skipping delete for port {:?} of {}: {}", svc_port.name, key, e);
                    self.ops.metrics().ports_skipped_total.inc();
                    continue;
                }
            };

            if service.has_node_port() {
                self.delete_gateway_vips(&gateways, None, port, &mut errors)
                    .await;
            }

            if service.has_cluster_ip_type() {
                match self.ops.store().find_cluster_load_balancer(protocol).await {
                    Ok(lb) => {
                        if let Err(e) = self
                            .ops
                            .remove_vip_and_rule(&lb.id, cluster_ip, svc_port.port, "delete")
                            .await
                        {
                            warn!("Failed to remove cluster VIP of {}: {}", key, e);
                            errors.record(e);
                        }
                    }
                    Err(e) => {
                        warn!("No cluster load balancer for {}: {}", protocol, e);
                        if !e.is_not_found() {
                            errors.record(e);
                        }
                    }
                }

                let cluster = [cluster_ip.to_string()];
                self.delete_gateway_vips(&gateways, Some(&cluster), svc_port.port, &mut errors)
                    .await;

                let external: Vec<String> = service
                    .ingress_ips
                    .iter()
                    .chain(service.external_ips.iter())
                    .cloned()
                    .collect();
                if !external.is_empty() {
                    for (_, lb) in self.gateway_load_balancers(&gateways, protocol).await {
                        for address in &external {
                            if let Err(e) = self
                                .ops
                                .remove_vip_and_rule(&lb.id, address, svc_port.port, "delete")
                                .await
                            {
                                warn!("Failed to remove VIP {} of {}: {}", address, key, e);
                                errors.record(e);
                            }
                        }
                    }
                }
            }
        }

        errors.into_result()
    }

    async fn create_node_port(&self, pass: &mut CreatePass<'_>, protocol: Protocol, port: i32) {
        let gateways = match self.ops.track(self.gateways.list_gateways().await) {
            Ok(gateways) => gateways,
            Err(e) => {
                warn!("Unable to list gateways for {}: {}", pass.service.key(), e);
                pass.errors.record(e);
                return;
            }
        };

        for (gateway, lb) in self.gateway_load_balancers(&gateways, protocol).await {
            let physical = match self.gateways.physical_addresses(&gateway).await {
                Ok(physical) => physical,
                Err(e) => {
                    warn!("Gateway router {} does not have physical ip ({})", gateway, e);
                    continue;
                }
            };
            for address in &physical {
                self.place(pass, &lb, address, port).await;
            }
        }
    }

    async fn create_cluster(
        &self,
        pass: &mut CreatePass<'_>,
        cluster_ip: &str,
        protocol: Protocol,
        svc_port: &ServicePort,
    ) {
        let lb = match self.ops.store().find_cluster_load_balancer(protocol).await {
            Ok(lb) => lb,
            Err(e) => {
                warn!("Failed to get load balancer for {} ({})", protocol, e);
                if !e.is_not_found() {
                    pass.errors.record(e);
                }
                return;
            }
        };

        if self.place(pass, &lb, cluster_ip, svc_port.port).await != Placement::Reject {
            return;
        }

        let gateways = match self.ops.track(self.gateways.list_gateways().await) {
            Ok(gateways) => gateways,
            Err(e) => {
                warn!("Unable to list gateways for {}: {}", pass.service.key(), e);
                pass.errors.record(e);
                return;
            }
        };
        let service = pass.service;
        let external: Vec<&String> = service
            .ingress_ips
            .iter()
            .chain(service.external_ips.iter())
            .collect();
        if external.is_empty() {
            return;
        }
        for (_, gateway_lb) in self.gateway_load_balancers(&gateways, protocol).await {
            for address in &external {
                self.place(pass, &gateway_lb, address, svc_port.port).await;
            }
        }
    }

    /// Decide and apply the placement of `address:port` on `lb`
    async fn place(
        &self,
        pass: &mut CreatePass<'_>,
        lb: &LoadBalancerRef,
        address: &str,
        port: i32,
    ) -> Placement {
        let vip = vip_key(address, port);
        let populated = match self.ops.vip_populated(&lb.id, &vip).await {
            Ok(populated) => populated,
            Err(e) => {
                warn!("Failed to read VIPs of {}: {}", lb.id, e);
                pass.errors.record(e);
                return Placement::Skip;
            }
        };

        let placement = if populated {
            Placement::AlreadyPopulated
        } else if pass.ready {
            Placement::Delegate
        } else if pass.qualifies {
            Placement::Reject
        } else {
            Placement::Skip
        };

        match placement {
            Placement::AlreadyPopulated => {
                debug!("Load balancer already configured for {}, {}", lb.id, vip)
            }
            Placement::Delegate => {
                if !pass.delegated {
                    pass.delegated = true;
                    if let Err(e) = self.endpoints.add_endpoints(pass.service).await {
                        warn!("Endpoints path failed for {}: {}", pass.service.key(), e);
                        pass.errors.record(e);
                    }
                }
            }
            Placement::Reject => {
                match self
                    .ops
                    .ensure_reject_rule(
                        &lb.id,
                        address,
                        port,
                        lb.protocol,
                        self.config.reject_rule_logging,
                    )
                    .await
                {
                    Ok(id) => info!(
                        "Reject rule for {} on {} in place for service {} ({})",
                        vip,
                        lb.id,
                        pass.service.key(),
                        id
                    ),
                    Err(e) => {
                        warn!("Failed to create reject rule for {} on {}: {}", vip, lb.id, e);
                        pass.errors.record(e);
                    }
                }
            }
            Placement::Skip => debug!("Leaving {} on {} unconfigured", vip, lb.id),
        }
        placement
    }

    /// Load balancer of `protocol` on each gateway, skipping gateways without one
    async fn gateway_load_balancers(
        &self,
        gateways: &[String],
        protocol: Protocol,
    ) -> Vec<(String, LoadBalancerRef)> {
        let mut lbs = Vec::with_capacity(gateways.len());
        for gateway in gateways {
            match self.gateways.gateway_load_balancer(gateway, protocol).await {
                Ok(lb) => lbs.push((gateway.clone(), lb)),
                Err(e) => warn!("Gateway router {} does not have load balancer ({})", gateway, e),
            }
        }
        lbs
    }

    /// Remove `address:port` VIPs and their reject rules from the gateway load
    /// balancers of every protocol. `None` means each gateway's physical addresses.
    async fn delete_gateway_vips(
        &self,
        gateways: &[String],
        addresses: Option<&[String]>,
        port: i32,
        errors: &mut FirstError,
    ) {
        for gateway in gateways {
            let physical;
            let addresses = match addresses {
                Some(addresses) => addresses,
                None => match self.gateways.physical_addresses(gateway).await {
                    Ok(found) => {
                        physical = found;
                        physical.as_slice()
                    }
                    Err(e) => {
                        warn!("Gateway router {} does not have physical ip ({})", gateway, e);
                        continue;
                    }
                },
            };

            for protocol in Protocol::ALL {
                let lb = match self.gateways.gateway_load_balancer(gateway, protocol).await {
                    Ok(lb) => lb,
                    Err(e) => {
                        debug!(
                            "Gateway router {} has no {} load balancer: {}",
                            gateway, protocol, e
                        );
                        continue;
                    }
                };
                for address in addresses {
                    if let Err(e) = self
                        .ops
                        .remove_vip_and_rule(&lb.id, address, port, "delete")
                        .await
                    {
                        warn!("Failed to remove {} from {}: {}", vip_key(address, port), lb.id, e);
                        errors.record(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::EndpointVipWriter;
    use crate::memory::{MemoryEndpoints, MemoryRecorder, MemoryStore};
    use lbsync_api::{
        EndpointPort, EndpointSubset, ServiceEndpoints, ServiceType, IDLED_AT_ANNOTATION,
    };

    struct Fixture {
        store: MemoryStore,
        source: MemoryEndpoints,
        recorder: MemoryRecorder,
        metrics: SyncMetrics,
        projector: ServiceProjector,
    }

    async fn fixture(config: ProjectorConfig) -> Fixture {
        let store = MemoryStore::new();
        store.add_cluster_load_balancer(Protocol::Tcp, "cluster-tcp").await;
        store.add_cluster_load_balancer(Protocol::Udp, "cluster-udp").await;
        store.add_cluster_load_balancer(Protocol::Sctp, "cluster-sctp").await;
        store.add_gateway("GR_node1", &["172.18.0.2"]).await;
        store
            .add_gateway_load_balancer("GR_node1", Protocol::Tcp, "gw1-tcp")
            .await;
        store
            .add_gateway_load_balancer("GR_node1", Protocol::Udp, "gw1-udp")
            .await;

        let source = MemoryEndpoints::new();
        let recorder = MemoryRecorder::new();
        let metrics = SyncMetrics::new().unwrap();
        let writer = EndpointVipWriter::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(source.clone()),
            metrics.clone(),
        );
        let projector = ServiceProjector::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(writer),
            Arc::new(recorder.clone()),
            config,
            metrics.clone(),
        );

        Fixture {
            store,
            source,
            recorder,
            metrics,
            projector,
        }
    }

    fn svc1() -> Service {
        Service {
            namespace: "ns1".to_string(),
            name: "svc1".to_string(),
            cluster_ip: Some("10.0.0.5".to_string()),
            ports: vec![ServicePort::tcp(80)],
            ..Default::default()
        }
    }

    fn svc1_endpoints() -> ServiceEndpoints {
        ServiceEndpoints {
            namespace: "ns1".to_string(),
            name: "svc1".to_string(),
            subsets: vec![EndpointSubset {
                addresses: vec!["10.1.0.9".to_string()],
                ports: vec![EndpointPort {
                    name: String::new(),
                    port: 8080,
                    protocol: "TCP".to_string(),
                }],
            }],
        }
    }

    #[tokio::test]
    async fn test_create_without_endpoints_adds_cluster_reject_rule() {
        let f = fixture(ProjectorConfig::default()).await;

        f.projector.create(&svc1(), Readiness::Unknown).await.unwrap();

        assert_eq!(f.store.rule_names().await, vec!["cluster-tcp-10.0.0.5:80"]);
        assert_eq!(
            f.store.group_rule_names("cluster-tcp").await,
            vec!["cluster-tcp-10.0.0.5:80"]
        );
        assert!(!f.store.vips("cluster-tcp").await.contains_key("10.0.0.5:80"));
    }

    #[tokio::test]
    async fn test_create_twice_is_idempotent() {
        let f = fixture(ProjectorConfig::default()).await;

        f.projector.create(&svc1(), Readiness::NotReady).await.unwrap();
        let rules = f.store.rule_names().await;
        let vips = f.store.vips("cluster-tcp").await;

        f.projector.create(&svc1(), Readiness::NotReady).await.unwrap();
        assert_eq!(f.store.rule_names().await, rules);
        assert_eq!(f.store.vips("cluster-tcp").await, vips);
    }

    #[tokio::test]
    async fn test_ready_endpoints_replace_reject_rule() {
        let f = fixture(ProjectorConfig::default()).await;
        f.projector.create(&svc1(), Readiness::NotReady).await.unwrap();

        f.source.set(svc1_endpoints()).await;
        f.projector.create(&svc1(), Readiness::Ready).await.unwrap();

        assert!(f.store.rule_names().await.is_empty());
        assert_eq!(
            f.store.vips("cluster-tcp").await.get("10.0.0.5:80"),
            Some(&vec!["10.1.0.9:8080".to_string()])
        );
    }

    #[tokio::test]
    async fn test_populated_vip_is_left_alone() {
        let f = fixture(ProjectorConfig::default()).await;
        f.store
            .set_vip("cluster-tcp", "10.0.0.5:80", &["10.1.0.9:8080".to_string()])
            .await
            .unwrap();

        f.projector.create(&svc1(), Readiness::NotReady).await.unwrap();

        assert!(f.store.rule_names().await.is_empty());
        assert_eq!(f.metrics.reject_rules_ensured_total.get(), 0);
    }

    #[tokio::test]
    async fn test_sctp_without_support_aborts_with_event() {
        let f = fixture(ProjectorConfig {
            sctp_supported: false,
            ..Default::default()
        })
        .await;
        let service = Service {
            ports: vec![ServicePort {
                protocol: "SCTP".to_string(),
                ..ServicePort::tcp(9000)
            }],
            ..svc1()
        };

        let err = f
            .projector
            .create(&service, Readiness::NotReady)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoreError::UnsupportedProtocol {
                protocol: Protocol::Sctp,
                ..
            }
        ));
        let events = f.recorder.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0.to_string(), "ns1/svc1");
        assert_eq!(events[0].1, "UnsupportedProtocol");
        assert!(f.store.rule_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_port_is_skipped() {
        let f = fixture(ProjectorConfig::default()).await;
        let service = Service {
            ports: vec![ServicePort::tcp(0), ServicePort::tcp(80)],
            ..svc1()
        };

        f.projector.create(&service, Readiness::NotReady).await.unwrap();

        assert_eq!(f.store.rule_names().await, vec!["cluster-tcp-10.0.0.5:80"]);
        assert_eq!(f.metrics.ports_skipped_total.get(), 1);
    }

    #[tokio::test]
    async fn test_idled_service_with_idle_events_is_not_rejected() {
        let f = fixture(ProjectorConfig {
            idle_events_enabled: true,
            ..Default::default()
        })
        .await;
        let mut service = svc1();
        service
            .annotations
            .insert(IDLED_AT_ANNOTATION.to_string(), "2021-01-01T00:00:00Z".to_string());

        assert!(!f.projector.qualifies_for_reject(&service));
        f.projector.create(&service, Readiness::NotReady).await.unwrap();
        assert!(f.store.rule_names().await.is_empty());

        assert!(f.projector.qualifies_for_reject(&svc1()));
    }

    #[tokio::test]
    async fn test_idled_service_without_idle_events_is_rejected() {
        let f = fixture(ProjectorConfig::default()).await;
        let mut service = svc1();
        service
            .annotations
            .insert(IDLED_AT_ANNOTATION.to_string(), "2021-01-01T00:00:00Z".to_string());

        f.projector.create(&service, Readiness::NotReady).await.unwrap();
        assert_eq!(f.store.rule_names().await.len(), 1);
    }

    #[tokio::test]
    async fn test_node_port_and_external_addresses_rejected_on_gateways() {
        let f = fixture(ProjectorConfig::default()).await;
        let service = Service {
            namespace: "ns1".to_string(),
            name: "web".to_string(),
            service_type: ServiceType::LoadBalancer,
            cluster_ip: Some("10.0.0.7".to_string()),
            ports: vec![ServicePort {
                node_port: 30080,
                ..ServicePort::tcp(80)
            }],
            external_ips: vec!["192.0.2.10".to_string()],
            ingress_ips: vec!["203.0.113.7".to_string()],
            ..Default::default()
        };

        f.projector.create(&service, Readiness::NotReady).await.unwrap();

        let mut gateway_rules = f.store.group_rule_names("gw1-tcp").await;
        gateway_rules.sort();
        assert_eq!(
            gateway_rules,
            vec![
                "gw1-tcp-172.18.0.2:30080",
                "gw1-tcp-192.0.2.10:80",
                "gw1-tcp-203.0.113.7:80",
            ]
        );
        assert_eq!(
            f.store.group_rule_names("cluster-tcp").await,
            vec!["cluster-tcp-10.0.0.7:80"]
        );
    }

    #[tokio::test]
    async fn test_node_port_placed_past_incomplete_gateways() {
        let f = fixture(ProjectorConfig::default()).await;
        // sorted before and after GR_node1
        f.store.add_gateway("GR_node0", &[]).await;
        f.store
            .add_gateway_load_balancer("GR_node0", Protocol::Tcp, "gw0-tcp")
            .await;
        f.store.add_gateway("GR_node2", &["172.18.0.4"]).await;
        let service = Service {
            namespace: "ns1".to_string(),
            name: "web".to_string(),
            service_type: ServiceType::NodePort,
            cluster_ip: Some("10.0.0.7".to_string()),
            ports: vec![ServicePort {
                node_port: 30080,
                ..ServicePort::tcp(80)
            }],
            ..Default::default()
        };

        f.projector.create(&service, Readiness::NotReady).await.unwrap();

        assert_eq!(
            f.store.group_rule_names("gw1-tcp").await,
            vec!["gw1-tcp-172.18.0.2:30080"]
        );
        assert!(f.store.group_rule_names("gw0-tcp").await.is_empty());
        assert_eq!(
            f.store.group_rule_names("cluster-tcp").await,
            vec!["cluster-tcp-10.0.0.7:80"]
        );
    }

    #[tokio::test]
    async fn test_headless_service_is_ignored() {
        let f = fixture(ProjectorConfig::default()).await;
        let service = Service {
            cluster_ip: Some("None".to_string()),
            ..svc1()
        };

        f.projector.create(&service, Readiness::NotReady).await.unwrap();
        f.projector.delete(&service).await.unwrap();
        assert!(f.store.rule_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_without_placement_change_is_noop() {
        let f = fixture(ProjectorConfig::default()).await;
        let old = svc1();
        f.projector.create(&old, Readiness::NotReady).await.unwrap();

        let mut new = old.clone();
        new.annotations
            .insert("example.com/owner".to_string(), "team-a".to_string());
        f.projector.update(&old, &new, Readiness::NotReady).await.unwrap();

        assert_eq!(
            f.metrics
                .vips_removed_total
                .with_label_values(&["delete"])
                .get(),
            0
        );
        assert_eq!(f.store.rule_names().await, vec!["cluster-tcp-10.0.0.5:80"]);
    }

    #[tokio::test]
    async fn test_update_moves_reject_rule_to_new_port() {
        let f = fixture(ProjectorConfig::default()).await;
        let old = svc1();
        f.projector.create(&old, Readiness::NotReady).await.unwrap();

        let new = Service {
            ports: vec![ServicePort::tcp(8443)],
            ..old.clone()
        };
        f.projector.update(&old, &new, Readiness::NotReady).await.unwrap();

        assert_eq!(f.store.rule_names().await, vec!["cluster-tcp-10.0.0.5:8443"]);
    }

    #[tokio::test]
    async fn test_delete_removes_vip_and_reject_rule() {
        let f = fixture(ProjectorConfig::default()).await;
        f.source.set(svc1_endpoints()).await;
        f.projector.create(&svc1(), Readiness::Ready).await.unwrap();
        assert!(f.store.vips("cluster-tcp").await.contains_key("10.0.0.5:80"));

        f.projector.delete(&svc1()).await.unwrap();
        assert!(f.store.vips("cluster-tcp").await.is_empty());

        f.projector.create(&svc1(), Readiness::NotReady).await.unwrap();
        assert_eq!(f.store.rule_names().await.len(), 1);
        f.projector.delete(&svc1()).await.unwrap();
        assert!(f.store.rule_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_node_port_sweeps_every_protocol() {
        let f = fixture(ProjectorConfig::default()).await;
        f.store
            .set_vip("gw1-udp", "172.18.0.2:30080", &[])
            .await
            .unwrap();
        let service = Service {
            service_type: ServiceType::NodePort,
            ports: vec![ServicePort {
                node_port: 30080,
                ..ServicePort::tcp(80)
            }],
            ..svc1()
        };

        f.projector.delete(&service).await.unwrap();
        assert!(f.store.vips("gw1-udp").await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_continues_past_backend_failure() {
        let f = fixture(ProjectorConfig::default()).await;
        f.projector.create(&svc1(), Readiness::NotReady).await.unwrap();
        f.store.fail_on("list_gateways").await;

        let err = f.projector.delete(&svc1()).await.unwrap_err();
        assert!(matches!(err, CoreError::Backend(_)));
        assert!(f.store.rule_names().await.is_empty());
    }
}
