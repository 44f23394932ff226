//! Backend store and gateway set contracts
//!
//! The core never holds backend state across calls. Every operation here is
//! a single blocking call that either succeeds or fails; retries are left to
//! the next projector call or reconcile pass.

use crate::Result;
use async_trait::async_trait;
use lbsync_api::Protocol;
use std::collections::BTreeMap;

/// VIP key to ordered target list. An empty list is a VIP with no backends.
pub type VipMap = BTreeMap<String, Vec<String>>;

/// Where a load balancer sits
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LbRole {
    /// Shared by every Service of one protocol, serves cluster IPs
    Cluster,
    /// Attached to one gateway router, serves node ports and external addresses
    Gateway(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LoadBalancerRef {
    pub id: String,
    pub role: LbRole,
    pub protocol: Protocol,
}

impl LoadBalancerRef {
    pub fn cluster(id: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            id: id.into(),
            role: LbRole::Cluster,
            protocol,
        }
    }

    pub fn gateway(id: impl Into<String>, gateway: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            id: id.into(),
            role: LbRole::Gateway(gateway.into()),
            protocol,
        }
    }
}

/// Which reject rules to list
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectRuleQuery {
    All,
    Named(String),
}

/// A reject rule as reported by the backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectRuleRecord {
    pub name: String,
    pub id: String,
}

/// Everything needed to create a reject rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectRuleSpec {
    /// Unescaped name from [`crate::addressing::rule_name`]
    pub name: String,
    /// Load balancer whose port group the rule is attached to
    pub lb_id: String,
    pub address: String,
    pub port: i32,
    pub protocol: Protocol,
    pub log: bool,
}

#[async_trait]
pub trait BackendStore: Send + Sync {
    async fn find_cluster_load_balancer(&self, protocol: Protocol) -> Result<LoadBalancerRef>;

    /// Configured VIPs, or an empty map when the load balancer has none
    async fn get_vips(&self, lb: &str) -> Result<VipMap>;

    /// Removing an absent key succeeds
    async fn remove_vip(&self, lb: &str, vip: &str) -> Result<()>;

    /// Upsert; replaces the full target list of `vip`
    async fn set_vip(&self, lb: &str, vip: &str, targets: &[String]) -> Result<()>;

    /// Switches holding `lb` directly (deployments without port groups)
    async fn find_switches_referencing(&self, lb: &str) -> Result<Vec<String>>;

    /// Names of routers holding `lb`
    async fn find_routers_referencing(&self, lb: &str) -> Result<Vec<String>>;

    async fn find_reject_rules(&self, query: &RejectRuleQuery) -> Result<Vec<RejectRuleRecord>>;

    /// Create a rule and attach it to the port group of `spec.lb_id`, returning its id
    async fn create_reject_rule(&self, spec: &RejectRuleSpec) -> Result<String>;

    async fn attach_reject_rule_to_group(&self, lb: &str, rule_id: &str) -> Result<()>;

    async fn attach_reject_rule_to_switches(
        &self,
        switches: &[String],
        rule_id: &str,
    ) -> Result<()>;

    async fn detach_reject_rule_from_group(&self, lb: &str, rule_id: &str) -> Result<()>;

    async fn detach_reject_rule_from_switches(
        &self,
        switches: &[String],
        rule_id: &str,
    ) -> Result<()>;
}

/// Gateway routers and their per-protocol load balancers
#[async_trait]
pub trait GatewaySet: Send + Sync {
    async fn list_gateways(&self) -> Result<Vec<String>>;

    async fn physical_addresses(&self, gateway: &str) -> Result<Vec<String>>;

    async fn gateway_load_balancer(
        &self,
        gateway: &str,
        protocol: Protocol,
    ) -> Result<LoadBalancerRef>;
}
