use glue_cni_common::{MANAGED_LINK, NetworkTopology};
use tracing::{debug, info};

use crate::reconcile::HostKernel;
use crate::reconcile::command::run;
use crate::{Error, Result};

pub const NAT_TABLE: &str = "nat";
pub const GLUE_CHAIN: &str = "GLUE-PREROUTING";
pub const PREROUTING_CHAIN: &str = "PREROUTING";
/// Chain kube-proxy marks packets in for masquerading.
pub const MASQUERADE_MARK_CHAIN: &str = "KUBE-MARK-MASQ";

pub trait RuleOps {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool>;
    fn new_chain(&self, table: &str, chain: &str) -> Result<()>;
    fn append_rule(&self, table: &str, chain: &str, rule: &[String]) -> Result<()>;
    fn insert_rule(&self, table: &str, chain: &str, position: u32, rule: &[String]) -> Result<()>;
    /// Deletes a rule. A rule or chain that does not exist is already deleted.
    fn delete_rule(&self, table: &str, chain: &str, rule: &[String]) -> Result<()>;
    fn flush_chain(&self, table: &str, chain: &str) -> Result<()>;
    fn delete_chain(&self, table: &str, chain: &str) -> Result<()>;
}

/// Rule marking traffic from the node range to the service network that
/// enters through the managed link.
pub fn masquerade_rule(topology: &NetworkTopology) -> Result<Vec<String>> {
    let service_cidr = topology
        .service_cidr
        .ok_or_else(|| Error::InvalidTopology("service cidr is required for nat".into()))?;
    Ok(vec![
        "-s".into(),
        topology.node_cidr.to_string(),
        "-d".into(),
        service_cidr.to_string(),
        "-i".into(),
        MANAGED_LINK.into(),
        "-j".into(),
        MASQUERADE_MARK_CHAIN.into(),
    ])
}

pub fn jump_rule() -> Vec<String> {
    vec!["-j".into(), GLUE_CHAIN.into()]
}

/// Installs the masquerade chain and the jump to it once. An existing chain is
/// left untouched.
pub fn converge(ops: &impl RuleOps, topology: &NetworkTopology) -> Result<()> {
    let rule = masquerade_rule(topology)?;
    if ops.chain_exists(NAT_TABLE, GLUE_CHAIN)? {
        debug!(chain = GLUE_CHAIN, "nat chain already present");
        return Ok(());
    }
    ops.new_chain(NAT_TABLE, GLUE_CHAIN)?;
    ops.append_rule(NAT_TABLE, GLUE_CHAIN, &rule)?;
    ops.insert_rule(NAT_TABLE, PREROUTING_CHAIN, 1, &jump_rule())?;
    info!(chain = GLUE_CHAIN, rule = %rule.join(" "), "nat chain installed");
    Ok(())
}

pub fn teardown(ops: &impl RuleOps) -> Result<()> {
    ops.delete_rule(NAT_TABLE, PREROUTING_CHAIN, &jump_rule())?;
    if !ops.chain_exists(NAT_TABLE, GLUE_CHAIN)? {
        return Ok(());
    }
    ops.flush_chain(NAT_TABLE, GLUE_CHAIN)?;
    ops.delete_chain(NAT_TABLE, GLUE_CHAIN)
}

fn iptables(args: &[&str], rule: &[String]) -> Result<()> {
    let mut argv: Vec<&str> = vec!["-w"];
    argv.extend_from_slice(args);
    argv.extend(rule.iter().map(String::as_str));
    run("iptables", &argv).map_err(Error::RuleOp)?;
    Ok(())
}

impl RuleOps for HostKernel {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        match run("iptables", &["-w", "-t", table, "-n", "-L", chain]) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(Error::RuleOp(e)),
        }
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        iptables(&["-t", table, "-N", chain], &[])
    }

    fn append_rule(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        iptables(&["-t", table, "-A", chain], rule)
    }

    fn insert_rule(&self, table: &str, chain: &str, position: u32, rule: &[String]) -> Result<()> {
        let position = position.to_string();
        iptables(&["-t", table, "-I", chain, &position], rule)
    }

    fn delete_rule(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        match iptables(&["-t", table, "-D", chain], rule) {
            Err(Error::RuleOp(e)) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<()> {
        iptables(&["-t", table, "-F", chain], &[])
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        iptables(&["-t", table, "-X", chain], &[])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reconcile::test::topology;

    #[test]
    fn test_masquerade_rule() {
        let rule = masquerade_rule(&topology("macvlan")).unwrap();
        assert_eq!(
            rule.join(" "),
            "-s 172.24.7.0/24 -d 172.23.0.0/24 -i glue -j KUBE-MARK-MASQ"
        );
    }

    #[test]
    fn test_masquerade_rule_requires_service_cidr() {
        let mut topology = topology("macvlan");
        topology.service_cidr = None;
        assert!(matches!(
            masquerade_rule(&topology),
            Err(Error::InvalidTopology(_))
        ));
    }
}
