//! VIP and reject-rule writes shared by the projector, the endpoints path and
//! the reconcile pass

use crate::addressing::{rule_name, vip_key};
use crate::store::{BackendStore, RejectRuleQuery, RejectRuleRecord, RejectRuleSpec};
use crate::{Result, SyncMetrics};
use lbsync_api::Protocol;
use std::sync::Arc;
use tracing::debug;

/// Gateway router and switch name prefixes used by deployments that attached
/// reject rules to switches before port groups existed
pub(crate) const GATEWAY_ROUTER_PREFIX: &str = "GR_";
pub(crate) const EXTERNAL_SWITCH_PREFIX: &str = "ext_";
pub(crate) const JOIN_SWITCH_PREFIX: &str = "join_";

#[derive(Clone)]
pub(crate) struct BackendOps {
    store: Arc<dyn BackendStore>,
    metrics: SyncMetrics,
}

impl BackendOps {
    pub(crate) fn new(store: Arc<dyn BackendStore>, metrics: SyncMetrics) -> Self {
        Self { store, metrics }
    }

    pub(crate) fn store(&self) -> &dyn BackendStore {
        self.store.as_ref()
    }

    pub(crate) fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Count a failed backend call and pass the result through
    pub(crate) fn track<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.metrics.backend_errors_total.inc();
        }
        result
    }

    /// Whether `vip` on `lb` already has targets
    pub(crate) async fn vip_populated(&self, lb: &str, vip: &str) -> Result<bool> {
        let vips = self.track(self.store.get_vips(lb).await)?;
        Ok(vips.get(vip).is_some_and(|targets| !targets.is_empty()))
    }

    /// Create the reject rule for `address:port` on `lb`, or re-attach it if it exists
    pub(crate) async fn ensure_reject_rule(
        &self,
        lb: &str,
        address: &str,
        port: i32,
        protocol: Protocol,
        log: bool,
    ) -> Result<String> {
        let name = rule_name(lb, address, port);
        let existing = self.track(
            self.store
                .find_reject_rules(&RejectRuleQuery::Named(name.clone()))
                .await,
        )?;

        let id = match existing.into_iter().next() {
            Some(rule) => {
                debug!("Reject rule {} already exists as {}", name, rule.id);
                self.track(self.store.attach_reject_rule_to_group(lb, &rule.id).await)?;
                rule.id
            }
            None => {
                let spec = RejectRuleSpec {
                    name,
                    lb_id: lb.to_string(),
                    address: address.to_string(),
                    port,
                    protocol,
                    log,
                };
                self.track(self.store.create_reject_rule(&spec).await)?
            }
        };

        self.metrics.reject_rules_ensured_total.inc();
        Ok(id)
    }

    /// Detach the reject rule for `address:port` from the port group of `lb`
    pub(crate) async fn remove_reject_rule(
        &self,
        lb: &str,
        address: &str,
        port: i32,
        reason: &str,
    ) -> Result<()> {
        let name = rule_name(lb, address, port);
        let rules = self.track(
            self.store
                .find_reject_rules(&RejectRuleQuery::Named(name))
                .await,
        )?;
        for rule in rules {
            self.detach_from_group(lb, &rule, reason).await?;
        }
        Ok(())
    }

    pub(crate) async fn detach_from_group(
        &self,
        lb: &str,
        rule: &RejectRuleRecord,
        reason: &str,
    ) -> Result<()> {
        self.track(self.store.detach_reject_rule_from_group(lb, &rule.id).await)?;
        debug!("Detached reject rule {} ({}) from {}", rule.name, rule.id, lb);
        self.metrics
            .reject_rules_detached_total
            .with_label_values(&[reason])
            .inc();
        Ok(())
    }

    /// Remove a VIP and the reject rule keyed to it
    ///
    /// The rule is left alone when the VIP removal fails.
    pub(crate) async fn remove_vip_and_rule(
        &self,
        lb: &str,
        address: &str,
        port: i32,
        reason: &str,
    ) -> Result<()> {
        let vip = vip_key(address, port);
        self.remove_vip(lb, &vip, reason).await?;
        self.remove_reject_rule(lb, address, port, reason).await
    }

    pub(crate) async fn remove_vip(&self, lb: &str, vip: &str, reason: &str) -> Result<()> {
        self.track(self.store.remove_vip(lb, vip).await)?;
        self.metrics
            .vips_removed_total
            .with_label_values(&[reason])
            .inc();
        Ok(())
    }

    pub(crate) async fn set_vip(&self, lb: &str, vip: &str, targets: &[String]) -> Result<()> {
        self.track(self.store.set_vip(lb, vip, targets).await)?;
        self.metrics.vips_set_total.inc();
        Ok(())
    }
}
