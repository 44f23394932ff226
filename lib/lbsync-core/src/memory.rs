//! In-memory backend store, gateway set, endpoint source and event recorder
//!
//! Used to run the projector and the reconcile pass without a real backend.
//! Reject rules behave like non-root rows: once a rule is no longer attached
//! to any port group or switch it disappears.

use crate::endpoints::EndpointSource;
use crate::events::EventRecorder;
use crate::store::{
    BackendStore, GatewaySet, LoadBalancerRef, RejectRuleQuery, RejectRuleRecord,
    RejectRuleSpec, VipMap,
};
use crate::{CoreError, Result};
use async_trait::async_trait;
use lbsync_api::{Protocol, ServiceEndpoints, ServiceKey};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct GatewayEntry {
    physical_addresses: Vec<String>,
    load_balancers: HashMap<Protocol, String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    cluster_lbs: HashMap<Protocol, String>,
    vips: HashMap<String, VipMap>,
    gateways: BTreeMap<String, GatewayEntry>,
    rules: BTreeMap<String, RejectRuleSpec>,
    // lb id -> rule ids
    group_rules: BTreeMap<String, BTreeSet<String>>,
    // switch -> rule ids
    switch_rules: BTreeMap<String, BTreeSet<String>>,
    switch_lbs: BTreeMap<String, BTreeSet<String>>,
    router_lbs: BTreeMap<String, BTreeSet<String>>,
    failing: HashSet<&'static str>,
    malformed_listing: bool,
}

impl MemoryState {
    fn check(&self, op: &'static str) -> Result<()> {
        if self.failing.contains(op) {
            return Err(CoreError::Backend(format!("injected failure in {}", op)));
        }
        Ok(())
    }

    fn collect_unattached(&mut self) {
        let attached: BTreeSet<&String> = self
            .group_rules
            .values()
            .chain(self.switch_rules.values())
            .flatten()
            .collect();
        let orphaned: Vec<String> = self
            .rules
            .keys()
            .filter(|id| !attached.contains(id))
            .cloned()
            .collect();
        for id in orphaned {
            debug!("Dropping unattached reject rule {}", id);
            self.rules.remove(&id);
        }
    }
}

/// Backend store and gateway set held in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_cluster_load_balancer(&self, protocol: Protocol, id: &str) {
        let mut state = self.state.write().await;
        state.cluster_lbs.insert(protocol, id.to_string());
        state.vips.entry(id.to_string()).or_default();
    }

    pub async fn add_gateway(&self, gateway: &str, physical_addresses: &[&str]) {
        let mut state = self.state.write().await;
        let entry = state.gateways.entry(gateway.to_string()).or_default();
        entry.physical_addresses = physical_addresses.iter().map(|a| a.to_string()).collect();
    }

    pub async fn add_gateway_load_balancer(&self, gateway: &str, protocol: Protocol, id: &str) {
        let mut state = self.state.write().await;
        state
            .gateways
            .entry(gateway.to_string())
            .or_default()
            .load_balancers
            .insert(protocol, id.to_string());
        state.vips.entry(id.to_string()).or_default();
        state
            .router_lbs
            .entry(gateway.to_string())
            .or_default()
            .insert(id.to_string());
    }

    /// Reference `lb` from a logical switch
    pub async fn add_switch_load_balancer(&self, switch: &str, lb: &str) {
        let mut state = self.state.write().await;
        state
            .switch_lbs
            .entry(switch.to_string())
            .or_default()
            .insert(lb.to_string());
    }

    /// Reference `lb` from a router without making it a gateway
    pub async fn add_router_load_balancer(&self, router: &str, lb: &str) {
        let mut state = self.state.write().await;
        state
            .router_lbs
            .entry(router.to_string())
            .or_default()
            .insert(lb.to_string());
    }

    /// Make every call to `op` fail with a backend error
    pub async fn fail_on(&self, op: &'static str) {
        self.state.write().await.failing.insert(op);
    }

    pub async fn clear_failures(&self) {
        self.state.write().await.failing.clear();
    }

    /// Make listing all reject rules return an undecodable response
    pub async fn set_malformed_listing(&self, malformed: bool) {
        self.state.write().await.malformed_listing = malformed;
    }

    pub async fn vips(&self, lb: &str) -> VipMap {
        self.state
            .read()
            .await
            .vips
            .get(lb)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn rule_names(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.rules.values().map(|r| r.name.clone()).collect()
    }

    /// Names of the rules attached to the port group of `lb`
    pub async fn group_rule_names(&self, lb: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .group_rules
            .get(lb)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.rules.get(id))
                    .map(|r| r.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of the rules attached directly to `switch`
    pub async fn switch_rule_names(&self, switch: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .switch_rules
            .get(switch)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.rules.get(id))
                    .map(|r| r.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn rule_spec(&self, name: &str) -> Option<RejectRuleSpec> {
        let state = self.state.read().await;
        state.rules.values().find(|r| r.name == name).cloned()
    }
}

#[async_trait]
impl BackendStore for MemoryStore {
    async fn find_cluster_load_balancer(&self, protocol: Protocol) -> Result<LoadBalancerRef> {
        let state = self.state.read().await;
        state.check("find_cluster_load_balancer")?;
        state
            .cluster_lbs
            .get(&protocol)
            .map(|id| LoadBalancerRef::cluster(id.clone(), protocol))
            .ok_or_else(|| CoreError::not_found("cluster load balancer", protocol.as_str()))
    }

    async fn get_vips(&self, lb: &str) -> Result<VipMap> {
        let state = self.state.read().await;
        state.check("get_vips")?;
        Ok(state.vips.get(lb).cloned().unwrap_or_default())
    }

    async fn remove_vip(&self, lb: &str, vip: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("remove_vip")?;
        if let Some(vips) = state.vips.get_mut(lb) {
            vips.remove(vip);
        }
        Ok(())
    }

    async fn set_vip(&self, lb: &str, vip: &str, targets: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("set_vip")?;
        state
            .vips
            .entry(lb.to_string())
            .or_default()
            .insert(vip.to_string(), targets.to_vec());
        Ok(())
    }

    async fn find_switches_referencing(&self, lb: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        state.check("find_switches_referencing")?;
        Ok(state
            .switch_lbs
            .iter()
            .filter(|(_, lbs)| lbs.contains(lb))
            .map(|(switch, _)| switch.clone())
            .collect())
    }

    async fn find_routers_referencing(&self, lb: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        state.check("find_routers_referencing")?;
        Ok(state
            .router_lbs
            .iter()
            .filter(|(_, lbs)| lbs.contains(lb))
            .map(|(router, _)| router.clone())
            .collect())
    }

    async fn find_reject_rules(&self, query: &RejectRuleQuery) -> Result<Vec<RejectRuleRecord>> {
        let state = self.state.read().await;
        state.check("find_reject_rules")?;
        if *query == RejectRuleQuery::All && state.malformed_listing {
            return Err(CoreError::MalformedResponse(
                "reject rule listing is not valid JSON".to_string(),
            ));
        }
        Ok(state
            .rules
            .iter()
            .filter(|(_, spec)| match query {
                RejectRuleQuery::All => true,
                RejectRuleQuery::Named(name) => spec.name == *name,
            })
            .map(|(id, spec)| RejectRuleRecord {
                name: spec.name.clone(),
                id: id.clone(),
            })
            .collect())
    }

    async fn create_reject_rule(&self, spec: &RejectRuleSpec) -> Result<String> {
        let mut state = self.state.write().await;
        state.check("create_reject_rule")?;
        let id = Uuid::new_v4().to_string();
        state.rules.insert(id.clone(), spec.clone());
        state
            .group_rules
            .entry(spec.lb_id.clone())
            .or_default()
            .insert(id.clone());
        Ok(id)
    }

    async fn attach_reject_rule_to_group(&self, lb: &str, rule_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("attach_reject_rule_to_group")?;
        if !state.rules.contains_key(rule_id) {
            return Err(CoreError::not_found("reject rule", rule_id));
        }
        state
            .group_rules
            .entry(lb.to_string())
            .or_default()
            .insert(rule_id.to_string());
        Ok(())
    }

    async fn attach_reject_rule_to_switches(
        &self,
        switches: &[String],
        rule_id: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("attach_reject_rule_to_switches")?;
        if !state.rules.contains_key(rule_id) {
            return Err(CoreError::not_found("reject rule", rule_id));
        }
        for switch in switches {
            state
                .switch_rules
                .entry(switch.clone())
                .or_default()
                .insert(rule_id.to_string());
        }
        Ok(())
    }

    async fn detach_reject_rule_from_group(&self, lb: &str, rule_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("detach_reject_rule_from_group")?;
        if let Some(ids) = state.group_rules.get_mut(lb) {
            ids.remove(rule_id);
        }
        state.collect_unattached();
        Ok(())
    }

    async fn detach_reject_rule_from_switches(
        &self,
        switches: &[String],
        rule_id: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("detach_reject_rule_from_switches")?;
        for switch in switches {
            if let Some(ids) = state.switch_rules.get_mut(switch) {
                ids.remove(rule_id);
            }
        }
        state.collect_unattached();
        Ok(())
    }
}

#[async_trait]
impl GatewaySet for MemoryStore {
    async fn list_gateways(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        state.check("list_gateways")?;
        Ok(state.gateways.keys().cloned().collect())
    }

    async fn physical_addresses(&self, gateway: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        state.check("physical_addresses")?;
        match state.gateways.get(gateway) {
            Some(entry) if !entry.physical_addresses.is_empty() => {
                Ok(entry.physical_addresses.clone())
            }
            _ => Err(CoreError::not_found("gateway physical address", gateway)),
        }
    }

    async fn gateway_load_balancer(
        &self,
        gateway: &str,
        protocol: Protocol,
    ) -> Result<LoadBalancerRef> {
        let state = self.state.read().await;
        state.check("gateway_load_balancer")?;
        state
            .gateways
            .get(gateway)
            .and_then(|entry| entry.load_balancers.get(&protocol))
            .map(|id| LoadBalancerRef::gateway(id.clone(), gateway, protocol))
            .ok_or_else(|| {
                CoreError::not_found("gateway load balancer", format!("{} {}", gateway, protocol))
            })
    }
}

/// Endpoint source backed by a map, fed by a watcher or by tests
#[derive(Clone, Default)]
pub struct MemoryEndpoints {
    endpoints: Arc<RwLock<HashMap<ServiceKey, ServiceEndpoints>>>,
}

impl MemoryEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, endpoints: ServiceEndpoints) {
        self.endpoints
            .write()
            .await
            .insert(endpoints.key(), endpoints);
    }

    pub async fn remove(&self, key: &ServiceKey) {
        self.endpoints.write().await.remove(key);
    }

    /// Replace the whole map, returning the keys whose endpoints changed
    pub async fn replace_all(&self, endpoints: Vec<ServiceEndpoints>) -> Vec<ServiceKey> {
        let mut map = self.endpoints.write().await;
        let fresh: HashMap<ServiceKey, ServiceEndpoints> =
            endpoints.into_iter().map(|eps| (eps.key(), eps)).collect();
        let mut changed: Vec<ServiceKey> = fresh
            .iter()
            .filter(|(key, eps)| map.get(*key) != Some(*eps))
            .map(|(key, _)| key.clone())
            .collect();
        changed.extend(map.keys().filter(|key| !fresh.contains_key(*key)).cloned());
        *map = fresh;
        changed
    }
}

#[async_trait]
impl EndpointSource for MemoryEndpoints {
    async fn endpoints(&self, key: &ServiceKey) -> Option<ServiceEndpoints> {
        self.endpoints.read().await.get(key).cloned()
    }
}

/// Recorder that keeps every event for inspection
#[derive(Clone, Default)]
pub struct MemoryRecorder {
    events: Arc<RwLock<Vec<(ServiceKey, String, String)>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<(ServiceKey, String, String)> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn warning(&self, service: &ServiceKey, reason: &str, message: &str) {
        self.events
            .write()
            .await
            .push((service.clone(), reason.to_string(), message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, lb: &str) -> RejectRuleSpec {
        RejectRuleSpec {
            name: name.to_string(),
            lb_id: lb.to_string(),
            address: "10.0.0.5".to_string(),
            port: 80,
            protocol: Protocol::Tcp,
            log: false,
        }
    }

    #[tokio::test]
    async fn test_remove_absent_vip_is_ok() {
        let store = MemoryStore::new();
        store.add_cluster_load_balancer(Protocol::Tcp, "lb1").await;
        assert!(store.remove_vip("lb1", "10.0.0.5:80").await.is_ok());
        assert!(store.remove_vip("unknown", "10.0.0.5:80").await.is_ok());
    }

    #[tokio::test]
    async fn test_set_vip_replaces_targets() {
        let store = MemoryStore::new();
        store
            .set_vip("lb1", "10.0.0.5:80", &["10.1.0.1:80".to_string()])
            .await
            .unwrap();
        store
            .set_vip("lb1", "10.0.0.5:80", &[])
            .await
            .unwrap();
        assert_eq!(store.get_vips("lb1").await.unwrap().get("10.0.0.5:80"), Some(&vec![]));
    }

    #[tokio::test]
    async fn test_rule_dropped_once_fully_detached() {
        let store = MemoryStore::new();
        let id = store.create_reject_rule(&spec("lb1-10.0.0.5:80", "lb1")).await.unwrap();
        store
            .attach_reject_rule_to_switches(&["node1".to_string()], &id)
            .await
            .unwrap();

        store.detach_reject_rule_from_group("lb1", &id).await.unwrap();
        assert_eq!(store.rule_names().await, vec!["lb1-10.0.0.5:80"]);

        store
            .detach_reject_rule_from_switches(&["node1".to_string()], &id)
            .await
            .unwrap();
        assert!(store.rule_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_find_reject_rules_by_name() {
        let store = MemoryStore::new();
        store.create_reject_rule(&spec("a", "lb1")).await.unwrap();
        store.create_reject_rule(&spec("b", "lb1")).await.unwrap();

        let found = store
            .find_reject_rules(&RejectRuleQuery::Named("b".to_string()))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "b");
        assert_eq!(store.find_reject_rules(&RejectRuleQuery::All).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        store.fail_on("list_gateways").await;
        assert!(matches!(store.list_gateways().await, Err(CoreError::Backend(_))));
        store.clear_failures().await;
        assert!(store.list_gateways().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_all_reports_changes() {
        let source = MemoryEndpoints::new();
        let eps = |name: &str, address: &str| ServiceEndpoints {
            namespace: "ns1".to_string(),
            name: name.to_string(),
            subsets: vec![lbsync_api::EndpointSubset {
                addresses: vec![address.to_string()],
                ports: vec![],
            }],
        };
        source.set(eps("kept", "10.1.0.1")).await;
        source.set(eps("moved", "10.1.0.2")).await;
        source.set(eps("gone", "10.1.0.3")).await;

        let mut changed = source
            .replace_all(vec![eps("kept", "10.1.0.1"), eps("moved", "10.1.0.4")])
            .await;
        changed.sort();

        assert_eq!(
            changed,
            vec![ServiceKey::new("ns1", "gone"), ServiceKey::new("ns1", "moved")]
        );
        assert!(source.endpoints(&ServiceKey::new("ns1", "gone")).await.is_none());
    }

    #[tokio::test]
    async fn test_gateway_lookups() {
        let store = MemoryStore::new();
        store.add_gateway("GR_node1", &["172.18.0.2"]).await;
        store
            .add_gateway_load_balancer("GR_node1", Protocol::Udp, "gw1-udp")
            .await;

        let lb = store.gateway_load_balancer("GR_node1", Protocol::Udp).await.unwrap();
        assert_eq!(lb, LoadBalancerRef::gateway("gw1-udp", "GR_node1", Protocol::Udp));
        assert!(store
            .gateway_load_balancer("GR_node1", Protocol::Tcp)
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(
            store.find_routers_referencing("gw1-udp").await.unwrap(),
            vec!["GR_node1"]
        );
    }
}
