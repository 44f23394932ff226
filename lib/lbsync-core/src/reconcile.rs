//! Full-cluster anti-entropy pass
//!
//! Rebuilds the desired VIP and reject-rule sets from the complete Service
//! list and deletes whatever the backend holds outside them. The pass only
//! ever deletes; creating missing state is left to the projector.

use crate::addressing::{rule_name, split_rule_name, split_vip_key, vip_key};
use crate::endpoints::EndpointSource;
use crate::error::FirstError;
use crate::rules::{
    BackendOps, EXTERNAL_SWITCH_PREFIX, GATEWAY_ROUTER_PREFIX, JOIN_SWITCH_PREFIX,
};
use crate::store::{BackendStore, GatewaySet, LoadBalancerRef, RejectRuleQuery, RejectRuleRecord};
use crate::validation::validate_port;
use crate::{CoreError, Result, SyncMetrics};
use lbsync_api::{Protocol, Service};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What the backend should hold according to the current Services
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesiredState {
    /// VIP keys on the cluster load balancer of each protocol
    pub cluster_vips: HashMap<Protocol, BTreeSet<String>>,
    /// Node ports served on every gateway load balancer of each protocol
    pub node_ports: HashMap<Protocol, BTreeSet<i32>>,
    /// External and ingress VIP keys on every gateway load balancer
    pub external_vips: HashMap<Protocol, BTreeSet<String>>,
    /// Reject rule name to load balancer id to whether the Service has ready endpoints
    pub reject_rules: BTreeMap<String, BTreeMap<String, bool>>,
}

impl DesiredState {
    pub fn wants_cluster_vip(&self, protocol: Protocol, vip: &str) -> bool {
        self.cluster_vips
            .get(&protocol)
            .is_some_and(|vips| vips.contains(vip))
    }

    /// A gateway VIP is wanted when its port is a node port or the full key
    /// is an external or ingress address
    pub fn wants_gateway_vip(&self, protocol: Protocol, vip: &str, port: i32) -> bool {
        self.node_ports
            .get(&protocol)
            .is_some_and(|ports| ports.contains(&port))
            || self
                .external_vips
                .get(&protocol)
                .is_some_and(|vips| vips.contains(vip))
    }

    fn add_reject_rule(&mut self, lb: &str, address: &str, port: i32, has_endpoints: bool) {
        if address.is_empty() {
            return;
        }
        self.reject_rules
            .entry(rule_name(lb, address, port))
            .or_default()
            .insert(lb.to_string(), has_endpoints);
    }
}

/// Outcome of one reconcile pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub stale_rules_detached: usize,
    pub cluster_vips_deleted: usize,
    pub gateway_vips_deleted: usize,
    /// The reject-rule listing could not be read or decoded
    pub rule_phase_skipped: bool,
    /// Gateways could not be listed
    pub gateway_phase_skipped: bool,
}

struct GatewayInfo {
    name: String,
    physical_addresses: Vec<String>,
    /// False when the physical address lookup failed, so node-port rules on
    /// this gateway cannot be derived
    addresses_known: bool,
    load_balancers: HashMap<Protocol, LoadBalancerRef>,
}

/// Load balancers known at the start of a pass
#[derive(Default)]
struct Topology {
    cluster: HashMap<Protocol, LoadBalancerRef>,
    /// `None` when gateways could not be listed
    gateways: Option<Vec<GatewayInfo>>,
}

impl Topology {
    fn gateway_load_balancers(&self, protocol: Protocol) -> impl Iterator<Item = &LoadBalancerRef> {
        self.gateways
            .iter()
            .flatten()
            .filter_map(move |gw| gw.load_balancers.get(&protocol))
    }

    /// Load balancers whose full set of implied rule names is known
    fn sweepable_load_balancer_ids(&self) -> BTreeSet<&str> {
        self.cluster
            .values()
            .chain(
                self.gateways
                    .iter()
                    .flatten()
                    .filter(|gw| gw.addresses_known)
                    .flat_map(|gw| gw.load_balancers.values()),
            )
            .map(|lb| lb.id.as_str())
            .collect()
    }
}

pub struct Reconciler {
    ops: BackendOps,
    gateways: Arc<dyn GatewaySet>,
    source: Arc<dyn EndpointSource>,
}

impl Reconciler {
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

    /// Delete every VIP and reject rule that no Service in `services` implies
    ///
    /// Safe to run at any time. Returns the first backend failure after the
    /// whole pass has run.
    pub async fn sync_services(&self, services: &[Service]) -> Result<SyncReport> {
        let timer = self.ops.metrics().sync_duration_seconds.start_timer();
        info!("Syncing {} services with the backend", services.len());

        let mut errors = FirstError::default();
        let mut report = SyncReport::default();

        let topology = self.topology(&mut errors).await;
        let desired = self.desired_state(services, &topology).await;

        self.remove_stale_rules(&desired, &topology, &mut report, &mut errors)
            .await;
        self.remove_stale_cluster_vips(&desired, &topology, &mut report, &mut errors)
            .await;
        match &topology.gateways {
            Some(gateways) => {
                self.remove_stale_gateway_vips(&desired, gateways, &mut report, &mut errors)
                    .await
            }
            None => {
                warn!("Not syncing gateway load balancers: gateways unavailable");
                report.gateway_phase_skipped = true;
            }
        }

        self.ops.metrics().sync_passes_total.inc();
        timer.observe_duration();
        info!(
            stale_rules = report.stale_rules_detached,
            cluster_vips = report.cluster_vips_deleted,
            gateway_vips = report.gateway_vips_deleted,
            "Service sync complete"
        );

        errors.into_result().map(|_| report)
    }

    async fn topology(&self, errors: &mut FirstError) -> Topology {
        let mut topology = Topology::default();

        for protocol in Protocol::ALL {
            match self.ops.store().find_cluster_load_balancer(protocol).await {
                Ok(lb) => {
                    topology.cluster.insert(protocol, lb);
                }
                Err(e) if e.is_not_found() => {
                    warn!("No cluster load balancer for {}: {}", protocol, e)
                }
                Err(e) => {
                    error!("Failed to get load balancer for {} ({})", protocol, e);
                    errors.record(e);
                }
            }
        }

        let names = match self.ops.track(self.gateways.list_gateways().await) {
            Ok(names) => names,
            Err(e) => {
                error!("Failed to get gateways: {}", e);
                errors.record(e);
                return topology;
            }
        };

        let mut gateways = Vec::with_capacity(names.len());
        for name in names {
            let (physical_addresses, addresses_known) =
                match self.gateways.physical_addresses(&name).await {
                    Ok(addresses) => (addresses, true),
                    Err(e) if e.is_not_found() => {
                        warn!("Gateway router {} does not have physical ips: {}", name, e);
                        (Vec::new(), true)
                    }
                    Err(e) => {
                        error!("Failed to get physical ips of gateway router {}: {}", name, e);
                        self.ops.metrics().backend_errors_total.inc();
                        errors.record(e);
                        (Vec::new(), false)
                    }
                };
            let mut load_balancers = HashMap::new();
            for protocol in Protocol::ALL {
                match self.gateways.gateway_load_balancer(&name, protocol).await {
                    Ok(lb) => {
                        load_balancers.insert(protocol, lb);
                    }
                    Err(e) => debug!(
                        "Gateway router {} has no {} load balancer: {}",
                        name, protocol, e
                    ),
                }
            }
            gateways.push(GatewayInfo {
                name,
                physical_addresses,
                addresses_known,
                load_balancers,
            });
        }
        topology.gateways = Some(gateways);
        topology
    }

    async fn desired_state(&self, services: &[Service], topology: &Topology) -> DesiredState {
        let mut desired = DesiredState::default();

        for service in services {
            if !service.has_cluster_ip_type() {
                continue;
            }
            let Some(cluster_ip) = service.cluster_ip() else {
                debug!("Skipping service {}: no cluster IP", service.key());
                continue;
            };

            let has_endpoints = self.source.readiness(&service.key()).await.is_ready();

            for svc_port in &service.ports {
                let protocol = match validate_port(&svc_port.protocol, svc_port.port) {
                    Ok(protocol) => protocol,
                    Err(e) => {
                        warn!(
                            "Error validating port {:?} of {}: {}",
                            svc_port.name,
                            service.key(),
                            e
                        );
                        continue;
                    }
                };

                if service.has_node_port() && svc_port.node_port > 0 {
                    desired
                        .node_ports
                        .entry(protocol)
                        .or_default()
                        .insert(svc_port.node_port);
                    for gateway in topology.gateways.iter().flatten() {
                        let Some(lb) = gateway.load_balancers.get(&protocol) else {
                            continue;
                        };
                        for address in &gateway.physical_addresses {
                            desired.add_reject_rule(
                                &lb.id,
                                address,
                                svc_port.node_port,
                                has_endpoints,
                            );
                        }
                    }
                }

                desired
                    .cluster_vips
                    .entry(protocol)
                    .or_default()
                    .insert(vip_key(cluster_ip, svc_port.port));
                match topology.cluster.get(&protocol) {
                    Some(lb) => {
                        desired.add_reject_rule(&lb.id, cluster_ip, svc_port.port, has_endpoints)
                    }
                    None => warn!(
                        "No cluster load balancer for {}. Reject rules may not be synced",
                        protocol
                    ),
                }

                for address in service.ingress_ips.iter().chain(service.external_ips.iter()) {
                    desired
                        .external_vips
                        .entry(protocol)
                        .or_default()
                        .insert(vip_key(address, svc_port.port));
                    for lb in topology.gateway_load_balancers(protocol) {
                        desired.add_reject_rule(&lb.id, address, svc_port.port, has_endpoints);
                    }
                }
            }
        }

        desired
    }

    /// Detach reject rules whose Service has endpoints, and rules of known
    /// load balancers that no Service implies anymore
    async fn remove_stale_rules(
        &self,
        desired: &DesiredState,
        topology: &Topology,
        report: &mut SyncReport,
        errors: &mut FirstError,
    ) {
        let rules = match self
            .ops
            .track(self.ops.store().find_reject_rules(&RejectRuleQuery::All).await)
        {
            Ok(rules) => rules,
            Err(e) => {
                error!("Unable to get current reject rules, not syncing them: {}", e);
                if !matches!(e, CoreError::MalformedResponse(_)) {
                    errors.record(e);
                }
                report.rule_phase_skipped = true;
                return;
            }
        };
        if rules.is_empty() {
            info!("No reject rules currently configured");
            return;
        }

        let known = topology.sweepable_load_balancer_ids();
        for rule in &rules {
            match desired.reject_rules.get(&rule.name) {
                Some(lbs) => {
                    for (lb, has_endpoints) in lbs {
                        if *has_endpoints {
                            info!("Removing stale reject rule {}", rule.name);
                            self.detach_stale_rule(lb, rule, report, errors).await;
                        }
                    }
                }
                None => {
                    let Some(lb) = owning_load_balancer(&rule.name, &known) else {
                        debug!(
                            "Reject rule {} does not belong to a known load balancer",
                            rule.name
                        );
                        continue;
                    };
                    info!("Removing reject rule {} of a deleted service", rule.name);
                    self.detach_stale_rule(lb, rule, report, errors).await;
                }
            }
        }
    }

    async fn detach_stale_rule(
        &self,
        lb: &str,
        rule: &RejectRuleRecord,
        report: &mut SyncReport,
        errors: &mut FirstError,
    ) {
        if let Err(e) = self.ops.detach_from_group(lb, rule, "stale").await {
            warn!("Failed to detach reject rule {} from {}: {}", rule.name, lb, e);
            errors.record(e);
            return;
        }
        report.stale_rules_detached += 1;

        let switches = self.legacy_switches(lb).await;
        if switches.is_empty() {
            return;
        }
        debug!(
            "Removing stale reject rule {} from switches holding {}: {:?}",
            rule.name, lb, switches
        );
        if let Err(e) = self
            .ops
            .track(
                self.ops
                    .store()
                    .detach_reject_rule_from_switches(&switches, &rule.id)
                    .await,
            )
        {
            warn!("Failed to detach reject rule {} from switches: {}", rule.name, e);
            errors.record(e);
        }
    }

    /// Switches a reject rule may sit on from before port groups: node
    /// switches holding `lb`, plus the external and join switch of every
    /// gateway router holding it
    async fn legacy_switches(&self, lb: &str) -> Vec<String> {
        let mut switches = match self.ops.store().find_switches_referencing(lb).await {
            Ok(switches) => switches,
            Err(e) => {
                warn!("Error finding logical switches for load balancer {}: {}", lb, e);
                Vec::new()
            }
        };

        match self.ops.store().find_routers_referencing(lb).await {
            Ok(routers) => {
                for router in routers {
                    if let Some(node) = router.strip_prefix(GATEWAY_ROUTER_PREFIX) {
                        switches.push(format!("{}{}", EXTERNAL_SWITCH_PREFIX, node));
                        switches.push(format!("{}{}", JOIN_SWITCH_PREFIX, node));
                    }
                }
            }
            Err(e) => warn!("Error finding gateway routers for load balancer {}: {}", lb, e),
        }

        switches.sort();
        switches.dedup();
        switches
    }

    async fn remove_stale_cluster_vips(
        &self,
        desired: &DesiredState,
        topology: &Topology,
        report: &mut SyncReport,
        errors: &mut FirstError,
    ) {
        for protocol in Protocol::ALL {
            let Some(lb) = topology.cluster.get(&protocol) else {
                continue;
            };
            let vips = match self.ops.track(self.ops.store().get_vips(&lb.id).await) {
                Ok(vips) => vips,
                Err(e) => {
                    error!("Failed to get load balancer vips for {} ({})", lb.id, e);
                    errors.record(e);
                    continue;
                }
            };
            for vip in vips.keys() {
                if desired.wants_cluster_vip(protocol, vip) {
                    continue;
                }
                debug!("Deleting stale cluster vip {} in load balancer {}", vip, lb.id);
                match self.ops.remove_vip(&lb.id, vip, "stale").await {
                    Ok(()) => report.cluster_vips_deleted += 1,
                    Err(e) => {
                        error!("Failed to delete {} from {}: {}", vip, lb.id, e);
                        errors.record(e);
                    }
                }
            }
        }
    }

    async fn remove_stale_gateway_vips(
        &self,
        desired: &DesiredState,
        gateways: &[GatewayInfo],
        report: &mut SyncReport,
        errors: &mut FirstError,
    ) {
        for gateway in gateways {
            for protocol in Protocol::ALL {
                let Some(lb) = gateway.load_balancers.get(&protocol) else {
                    continue;
                };
                let vips = match self.ops.track(self.ops.store().get_vips(&lb.id).await) {
                    Ok(vips) => vips,
                    Err(e) => {
                        error!("Failed to get load balancer vips for {} ({})", lb.id, e);
                        errors.record(e);
                        continue;
                    }
                };
                for vip in vips.keys() {
                    let port = match split_vip_key(vip) {
                        Ok((_, port)) => port,
                        Err(e) => {
                            error!("Skipping VIP on {} of {}: {}", lb.id, gateway.name, e);
                            continue;
                        }
                    };
                    if desired.wants_gateway_vip(protocol, vip, port) {
                        continue;
                    }
                    debug!("Deleting stale nodeport vip {} in load balancer {}", vip, lb.id);
                    match self.ops.remove_vip(&lb.id, vip, "stale").await {
                        Ok(()) => report.gateway_vips_deleted += 1,
                        Err(e) => {
                            error!("Failed to delete {} from {}: {}", vip, lb.id, e);
                            errors.record(e);
                        }
                    }
                }
            }
        }
    }
}

/// The known load balancer a reject rule name was generated for
fn owning_load_balancer<'a>(name: &str, known: &BTreeSet<&'a str>) -> Option<&'a str> {
    let (_, address, port) = split_rule_name(name)?;
    known
        .iter()
        .copied()
        .find(|lb| rule_name(lb, address, port) == name)
}
