//! Backend store and gateway set over northbound commands

use crate::client::CommandRunner;
use crate::error::NbctlError;
use crate::parse::{format_targets, parse_address_list, parse_lines, parse_rule_listing, parse_vips};
use async_trait::async_trait;
use lbsync_api::Protocol;
use lbsync_core::addressing::escape_rule_name;
use lbsync_core::{
    BackendStore, GatewaySet, LoadBalancerRef, RejectRuleQuery, RejectRuleRecord, RejectRuleSpec,
    Result, VipMap,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Priority of reject rules, shared with default-deny network policy rules
pub const REJECT_RULE_PRIORITY: u32 = 1000;

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn cluster_lb_key(protocol: Protocol) -> String {
    format!("external_ids:k8s-cluster-lb-{}=yes", protocol.as_lower())
}

fn gateway_lb_key(protocol: Protocol, gateway: &str) -> String {
    format!("external_ids:{}_lb_gateway_router={}", protocol.as_str(), gateway)
}

/// Match expression of a reject rule: destination address, protocol and port
pub fn reject_match(address: &str, port: i32, protocol: Protocol) -> String {
    let l3 = if address.contains(':') { "ip6" } else { "ip4" };
    let l4 = protocol.as_lower();
    format!("{}.dst=={} && {} && {}.dst=={}", l3, address, l4, l4, port)
}

pub struct NbctlStore {
    runner: Arc<dyn CommandRunner>,
    port_group: String,
}

impl NbctlStore {
    /// `port_group` is the group every reject rule is attached to
    pub fn new(runner: Arc<dyn CommandRunner>, port_group: impl Into<String>) -> Self {
        Self {
            runner,
            port_group: port_group.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> std::result::Result<String, NbctlError> {
        self.runner.run(&args).await
    }

    async fn find_uuid(
        &self,
        table: &str,
        condition: &str,
    ) -> std::result::Result<Option<String>, NbctlError> {
        let out = self
            .run(args([
                "--data=bare",
                "--no-heading",
                "--columns=_uuid",
                "find",
                table,
                condition,
            ]))
            .await?;
        Ok(parse_lines(&out).into_iter().next())
    }

    async fn find_names_referencing(&self, table: &str, lb: &str) -> Result<Vec<String>> {
        let condition = format!("load_balancer{{>=}}{}", lb);
        let out = self
            .run(args([
                "--data=bare",
                "--no-heading",
                "--columns=name",
                "find",
                table,
                &condition,
            ]))
            .await?;
        Ok(parse_lines(&out))
    }

    /// Chain one command per switch with `--`
    fn per_switch(verb: &[&str], switches: &[String], rule_id: &str) -> Vec<String> {
        let mut cmd = Vec::new();
        for (i, switch) in switches.iter().enumerate() {
            if i > 0 {
                cmd.push("--".to_string());
            }
            cmd.extend(verb.iter().map(|v| v.to_string()));
            cmd.extend([
                "logical_switch".to_string(),
                switch.clone(),
                "acls".to_string(),
                rule_id.to_string(),
            ]);
        }
        cmd
    }
}

#[async_trait]
impl BackendStore for NbctlStore {
    async fn find_cluster_load_balancer(&self, protocol: Protocol) -> Result<LoadBalancerRef> {
        let id = self
            .find_uuid("load_balancer", &cluster_lb_key(protocol))
            .await?
            .ok_or_else(|| NbctlError::not_found("cluster load balancer", protocol.as_str()))?;
        Ok(LoadBalancerRef::cluster(id, protocol))
    }

    async fn get_vips(&self, lb: &str) -> Result<VipMap> {
        let out = self
            .run(args(["--if-exists", "get", "load_balancer", lb, "vips"]))
            .await?;
        Ok(parse_vips(&out)?)
    }

    async fn remove_vip(&self, lb: &str, vip: &str) -> Result<()> {
        let key = format!("\"{}\"", vip);
        self.run(args(["--if-exists", "remove", "load_balancer", lb, "vips", &key]))
            .await?;
        Ok(())
    }

    async fn set_vip(&self, lb: &str, vip: &str, targets: &[String]) -> Result<()> {
        let entry = format!("vips:\"{}\"=\"{}\"", vip, format_targets(targets));
        self.run(args(["set", "load_balancer", lb, &entry])).await?;
        Ok(())
    }

    async fn find_switches_referencing(&self, lb: &str) -> Result<Vec<String>> {
        self.find_names_referencing("logical_switch", lb).await
    }

    async fn find_routers_referencing(&self, lb: &str) -> Result<Vec<String>> {
        self.find_names_referencing("logical_router", lb).await
    }

    async fn find_reject_rules(&self, query: &RejectRuleQuery) -> Result<Vec<RejectRuleRecord>> {
        match query {
            RejectRuleQuery::All => {
                let out = self
                    .run(args([
                        "--columns=name,_uuid",
                        "--format=json",
                        "find",
                        "acl",
                        "action=reject",
                    ]))
                    .await?;
                Ok(parse_rule_listing(&out)?)
            }
            RejectRuleQuery::Named(name) => {
                let condition = format!("name={}", escape_rule_name(name));
                let out = self
                    .run(args([
                        "--data=bare",
                        "--no-heading",
                        "--columns=_uuid",
                        "find",
                        "acl",
                        &condition,
                    ]))
                    .await?;
                Ok(parse_lines(&out)
                    .into_iter()
                    .map(|id| RejectRuleRecord {
                        name: name.clone(),
                        id,
                    })
                    .collect())
            }
        }
    }

    async fn create_reject_rule(&self, spec: &RejectRuleSpec) -> Result<String> {
        let priority = format!("priority={}", REJECT_RULE_PRIORITY);
        let matcher = format!(
            "match=\"{}\"",
            reject_match(&spec.address, spec.port, spec.protocol)
        );
        let log = format!("log={}", spec.log);
        let name = format!("name={}", escape_rule_name(&spec.name));
        let out = self
            .run(args([
                "--id=@reject-acl",
                "create",
                "acl",
                "direction=from-lport",
                &priority,
                &matcher,
                "action=reject",
                &log,
                "severity=info",
                "meter=acl-logging",
                &name,
                "--",
                "add",
                "port_group",
                &self.port_group,
                "acls",
                "@reject-acl",
            ]))
            .await?;

        let id = parse_lines(&out)
            .into_iter()
            .next()
            .ok_or_else(|| NbctlError::parse("created reject rule", "no uuid returned"))?;
        info!("Created reject rule {} ({}) on {}", spec.name, id, spec.lb_id);
        Ok(id)
    }

    async fn attach_reject_rule_to_group(&self, _lb: &str, rule_id: &str) -> Result<()> {
        self.run(args(["add", "port_group", &self.port_group, "acls", rule_id]))
            .await?;
        Ok(())
    }

    async fn attach_reject_rule_to_switches(
        &self,
        switches: &[String],
        rule_id: &str,
    ) -> Result<()> {
        if switches.is_empty() {
            return Ok(());
        }
        self.run(Self::per_switch(&["add"], switches, rule_id)).await?;
        Ok(())
    }

    async fn detach_reject_rule_from_group(&self, _lb: &str, rule_id: &str) -> Result<()> {
        self.run(args([
            "--if-exists",
            "remove",
            "port_group",
            &self.port_group,
            "acls",
            rule_id,
        ]))
        .await?;
        Ok(())
    }

    async fn detach_reject_rule_from_switches(
        &self,
        switches: &[String],
        rule_id: &str,
    ) -> Result<()> {
        if switches.is_empty() {
            return Ok(());
        }
        self.run(Self::per_switch(&["--if-exists", "remove"], switches, rule_id))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl GatewaySet for NbctlStore {
    async fn list_gateways(&self) -> Result<Vec<String>> {
        let out = self
            .run(args([
                "--data=bare",
                "--no-heading",
                "--columns=name",
                "find",
                "logical_router",
                "options:chassis!=null",
            ]))
            .await?;
        Ok(parse_lines(&out))
    }

    async fn physical_addresses(&self, gateway: &str) -> Result<Vec<String>> {
        let listed = self
            .run(args(["get", "logical_router", gateway, "external_ids:physical_ips"]))
            .await
            .map(|out| parse_address_list(&out));
        match listed {
            Ok(addresses) if !addresses.is_empty() => return Ok(addresses),
            Ok(_) => debug!("Gateway {} has no physical_ips, trying physical_ip", gateway),
            Err(e) => debug!("Gateway {} physical_ips lookup failed: {}", gateway, e),
        }

        let out = self
            .run(args(["get", "logical_router", gateway, "external_ids:physical_ip"]))
            .await?;
        let addresses = parse_address_list(&out);
        if addresses.is_empty() {
            return Err(NbctlError::not_found("gateway physical ip", gateway).into());
        }
        Ok(addresses)
    }

    async fn gateway_load_balancer(
        &self,
        gateway: &str,
        protocol: Protocol,
    ) -> Result<LoadBalancerRef> {
        let id = self
            .find_uuid("load_balancer", &gateway_lb_key(protocol, gateway))
            .await?
            .ok_or_else(|| {
                NbctlError::not_found("gateway load balancer", format!("{} {}", gateway, protocol))
            })?;
        Ok(LoadBalancerRef::gateway(id, gateway, protocol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbsync_core::CoreError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Replies by joined argument list and records every call
    #[derive(Default)]
    struct FakeRunner {
        replies: HashMap<String, std::result::Result<String, String>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn reply(mut self, cmd: &str, out: &str) -> Self {
            self.replies.insert(cmd.to_string(), Ok(out.to_string()));
            self
        }

        fn fail(mut self, cmd: &str, stderr: &str) -> Self {
            self.replies.insert(cmd.to_string(), Err(stderr.to_string()));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, args: &[String]) -> crate::Result<String> {
            let cmd = args.join(" ");
            self.calls.lock().unwrap().push(cmd.clone());
            match self.replies.get(&cmd) {
                Some(Ok(out)) => Ok(out.clone()),
                Some(Err(stderr)) => Err(NbctlError::Failed {
                    args: cmd,
                    stderr: stderr.clone(),
                }),
                None => Ok(String::new()),
            }
        }
    }

    fn store(runner: FakeRunner) -> (Arc<FakeRunner>, NbctlStore) {
        let runner = Arc::new(runner);
        let store = NbctlStore::new(runner.clone(), "clusterPortGroup");
        (runner, store)
    }

    #[test]
    fn test_reject_match() {
        assert_eq!(
            reject_match("10.0.0.5", 80, Protocol::Tcp),
            "ip4.dst==10.0.0.5 && tcp && tcp.dst==80"
        );
        assert_eq!(
            reject_match("fd00::5", 53, Protocol::Udp),
            "ip6.dst==fd00::5 && udp && udp.dst==53"
        );
    }

    #[tokio::test]
    async fn test_find_cluster_load_balancer() {
        let (_, store) = store(FakeRunner::default().reply(
            "--data=bare --no-heading --columns=_uuid find load_balancer external_ids:k8s-cluster-lb-tcp=yes",
            "a08ea426-2288-11eb-a30b-a8a1590cda29\n",
        ));

        let lb = store.find_cluster_load_balancer(Protocol::Tcp).await.unwrap();
        assert_eq!(
            lb,
            LoadBalancerRef::cluster("a08ea426-2288-11eb-a30b-a8a1590cda29", Protocol::Tcp)
        );
        assert!(store
            .find_cluster_load_balancer(Protocol::Udp)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_vip_commands() {
        let (runner, store) = store(FakeRunner::default().reply(
            "--if-exists get load_balancer lb1 vips",
            r#"{"10.0.0.5:80"="10.1.0.9:8080"}"#,
        ));

        let vips = store.get_vips("lb1").await.unwrap();
        assert_eq!(vips["10.0.0.5:80"], vec!["10.1.0.9:8080".to_string()]);

        store
            .set_vip(
                "lb1",
                "[fd00::5]:80",
                &["[fd00::9]:8080".to_string(), "[fd00::a]:8080".to_string()],
            )
            .await
            .unwrap();
        store.remove_vip("lb1", "10.0.0.5:80").await.unwrap();

        let calls = runner.calls();
        assert_eq!(
            calls[1],
            r#"set load_balancer lb1 vips:"[fd00::5]:80"="[fd00::9]:8080,[fd00::a]:8080""#
        );
        assert_eq!(
            calls[2],
            r#"--if-exists remove load_balancer lb1 vips "10.0.0.5:80""#
        );
    }

    #[tokio::test]
    async fn test_malformed_rule_listing_is_malformed_response() {
        let (_, store) = store(FakeRunner::default().reply(
            "--columns=name,_uuid --format=json find acl action=reject",
            "{\"data\": [",
        ));

        let err = store.find_reject_rules(&RejectRuleQuery::All).await.unwrap_err();
        assert!(matches!(err, CoreError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_find_named_rule_uses_escaped_name() {
        let (_, store) = store(FakeRunner::default().reply(
            r"--data=bare --no-heading --columns=_uuid find acl name=lb1-10.0.0.5\:80",
            "6f1e0c52-0000-0000-0000-000000000001",
        ));

        let rules = store
            .find_reject_rules(&RejectRuleQuery::Named("lb1-10.0.0.5:80".to_string()))
            .await
            .unwrap();
        assert_eq!(
            rules,
            vec![RejectRuleRecord {
                name: "lb1-10.0.0.5:80".to_string(),
                id: "6f1e0c52-0000-0000-0000-000000000001".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_create_reject_rule_attaches_to_port_group() {
        let create = concat!(
            "--id=@reject-acl create acl direction=from-lport priority=1000 ",
            r#"match="ip4.dst==10.0.0.5 && tcp && tcp.dst==80" action=reject log=true "#,
            r"severity=info meter=acl-logging name=lb1-10.0.0.5\:80 ",
            "-- add port_group clusterPortGroup acls @reject-acl",
        );
        let (_, store) = store(FakeRunner::default().reply(create, "6f1e0c52\n"));

        let id = store
            .create_reject_rule(&RejectRuleSpec {
                name: "lb1-10.0.0.5:80".to_string(),
                lb_id: "lb1".to_string(),
                address: "10.0.0.5".to_string(),
                port: 80,
                protocol: Protocol::Tcp,
                log: true,
            })
            .await
            .unwrap();
        assert_eq!(id, "6f1e0c52");
    }

    #[tokio::test]
    async fn test_detach_from_switches_chains_commands() {
        let (runner, store) = store(FakeRunner::default());

        store
            .detach_reject_rule_from_switches(
                &["ext_node1".to_string(), "join_node1".to_string()],
                "r1",
            )
            .await
            .unwrap();
        store.detach_reject_rule_from_switches(&[], "r1").await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![concat!(
                "--if-exists remove logical_switch ext_node1 acls r1 -- ",
                "--if-exists remove logical_switch join_node1 acls r1"
            )]
        );
    }

    #[tokio::test]
    async fn test_physical_addresses_fall_back_to_single_ip() {
        let (_, store) = store(
            FakeRunner::default()
                .reply(
                    "get logical_router GR_node1 external_ids:physical_ips",
                    "\"172.18.0.2,fd00::2\"",
                )
                .fail(
                    "get logical_router GR_node2 external_ids:physical_ips",
                    "no key \"physical_ips\" in logical_router record",
                )
                .reply(
                    "get logical_router GR_node2 external_ids:physical_ip",
                    "\"172.18.0.3\"",
                ),
        );

        assert_eq!(
            store.physical_addresses("GR_node1").await.unwrap(),
            vec!["172.18.0.2", "fd00::2"]
        );
        assert_eq!(
            store.physical_addresses("GR_node2").await.unwrap(),
            vec!["172.18.0.3"]
        );
        assert!(store
            .physical_addresses("GR_node3")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_gateway_discovery() {
        let (_, store) = store(
            FakeRunner::default()
                .reply(
                    "--data=bare --no-heading --columns=name find logical_router options:chassis!=null",
                    "GR_node1\nGR_node2\n",
                )
                .reply(
                    "--data=bare --no-heading --columns=_uuid find load_balancer external_ids:UDP_lb_gateway_router=GR_node1",
                    "gw1-udp",
                ),
        );

        assert_eq!(store.list_gateways().await.unwrap(), vec!["GR_node1", "GR_node2"]);
        assert_eq!(
            store.gateway_load_balancer("GR_node1", Protocol::Udp).await.unwrap(),
            LoadBalancerRef::gateway("gw1-udp", "GR_node1", Protocol::Udp)
        );
        assert!(store
            .gateway_load_balancer("GR_node2", Protocol::Udp)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_command_failure_is_backend_error() {
        let (_, store) = store(FakeRunner::default().fail(
            "--data=bare --no-heading --columns=name find logical_switch load_balancer{>=}lb1",
            "database connection failed",
        ));

        let err = store.find_switches_referencing("lb1").await.unwrap_err();
        assert!(matches!(err, CoreError::Backend(_)));
    }
}
