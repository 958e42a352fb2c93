use glue_cni_common::{MANAGED_LINK, MasterKind, NetworkTopology};
use tracing::{debug, info};

use crate::reconcile::HostKernel;
use crate::reconcile::command::run;
use crate::{Error, Result};

pub const FILTER_PRIORITY: u32 = 40000;
pub const FILTER_PROTOCOL: &str = "ip";
/// Offset of the destination address in the IPv4 header.
pub const DESTINATION_OFFSET: i32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U32Key {
    pub val: u32,
    pub mask: u32,
    pub off: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct U32Filter {
    pub pref: u32,
    pub protocol: String,
    /// Kernel assigned handle, unset for filters not yet installed.
    pub handle: Option<String>,
    pub keys: Vec<U32Key>,
}

impl U32Filter {
    /// Two filters match when they select the same packets, regardless of
    /// priority or handle.
    pub fn matches(&self, other: &U32Filter) -> bool {
        self.protocol == other.protocol && self.keys == other.keys
    }
}

pub trait FilterOps {
    fn has_clsact(&self, dev: &str) -> Result<bool>;
    fn add_clsact(&self, dev: &str) -> Result<()>;
    fn egress_filters(&self, dev: &str) -> Result<Vec<U32Filter>>;
    /// Deletes a filter. A filter that does not exist is already deleted.
    fn delete_filter(&self, dev: &str, filter: &U32Filter) -> Result<()>;
    fn add_redirect(&self, dev: &str, filter: &U32Filter, target: &str) -> Result<()>;
}

/// Filter selecting IPv4 packets headed for the service network.
pub fn redirect_filter(topology: &NetworkTopology) -> Result<U32Filter> {
    let service_cidr = topology
        .service_cidr
        .ok_or_else(|| Error::InvalidTopology("service cidr is required for redirect".into()))?;
    let mask = u32::from(service_cidr.mask());
    Ok(U32Filter {
        pref: FILTER_PRIORITY,
        protocol: FILTER_PROTOCOL.into(),
        handle: None,
        keys: vec![U32Key {
            val: u32::from(service_cidr.network()) & mask,
            mask,
            off: DESTINATION_OFFSET,
        }],
    })
}

/// Ensures exactly one service redirect on the egress hook of the master.
/// Only ipvlan needs it, macvlan pods reach the managed link directly.
pub fn converge(ops: &impl FilterOps, topology: &NetworkTopology) -> Result<()> {
    if topology.master.kind != MasterKind::Ipvlan {
        return Ok(());
    }
    let desired = redirect_filter(topology)?;
    let dev = topology.master.interface.as_str();

    if !ops.has_clsact(dev)? {
        ops.add_clsact(dev)?;
        debug!(dev, "added clsact qdisc");
    }
    for stale in ops
        .egress_filters(dev)?
        .iter()
        .filter(|f| f.matches(&desired))
    {
        ops.delete_filter(dev, stale)?;
        debug!(dev, pref = stale.pref, handle = ?stale.handle, "removed existing redirect");
    }
    ops.add_redirect(dev, &desired, MANAGED_LINK)?;
    info!(dev, target = MANAGED_LINK, "service redirect installed");
    Ok(())
}

pub fn teardown(ops: &impl FilterOps, topology: &NetworkTopology) -> Result<()> {
    if topology.master.kind != MasterKind::Ipvlan {
        return Ok(());
    }
    let desired = redirect_filter(topology)?;
    let dev = topology.master.interface.as_str();
    if !ops.has_clsact(dev)? {
        return Ok(());
    }
    for filter in ops
        .egress_filters(dev)?
        .iter()
        .filter(|f| f.matches(&desired))
    {
        ops.delete_filter(dev, filter)?;
    }
    Ok(())
}

/// Parses `tc filter show dev <dev> egress` output into its u32 filters.
pub fn parse_filters(output: &str) -> Vec<U32Filter> {
    let mut filters = Vec::new();
    let mut current: Option<U32Filter> = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("filter ") {
            filters.extend(current.take());
            current = parse_filter_line(rest);
        } else if let Some(rest) = line.strip_prefix("match ")
            && let Some(filter) = current.as_mut()
            && let Some(key) = parse_key(rest)
        {
            filter.keys.push(key);
        }
    }
    filters.extend(current);
    filters
}

fn parse_filter_line(line: &str) -> Option<U32Filter> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if !tokens.contains(&"u32") {
        return None;
    }
    let value = |name: &str| {
        tokens
            .iter()
            .position(|t| *t == name)
            .and_then(|i| tokens.get(i + 1))
            .copied()
    };
    // hash tables print as `fh 800:`, only `fh 800::800` is a filter node
    let handle = value("fh")?;
    if handle.ends_with(':') {
        return None;
    }
    Some(U32Filter {
        pref: value("pref")?.parse().ok()?,
        protocol: value("protocol")?.to_owned(),
        handle: Some(handle.to_owned()),
        keys: Vec::new(),
    })
}

fn parse_key(line: &str) -> Option<U32Key> {
    let mut parts = line.split_whitespace();
    let (val, mask) = parts.next()?.split_once('/')?;
    if parts.next()? != "at" {
        return None;
    }
    Some(U32Key {
        val: u32::from_str_radix(val, 16).ok()?,
        mask: u32::from_str_radix(mask, 16).ok()?,
        off: parts.next()?.parse().ok()?,
    })
}

impl FilterOps for HostKernel {
    fn has_clsact(&self, dev: &str) -> Result<bool> {
        let out = run("tc", &["qdisc", "show", "dev", dev]).map_err(Error::FilterOp)?;
        Ok(out.lines().any(|l| l.trim_start().starts_with("qdisc clsact")))
    }

    fn add_clsact(&self, dev: &str) -> Result<()> {
        run("tc", &["qdisc", "add", "dev", dev, "clsact"]).map_err(Error::FilterOp)?;
        Ok(())
    }

    fn egress_filters(&self, dev: &str) -> Result<Vec<U32Filter>> {
        let out = run("tc", &["filter", "show", "dev", dev, "egress"]).map_err(Error::FilterOp)?;
        Ok(parse_filters(&out))
    }

    fn delete_filter(&self, dev: &str, filter: &U32Filter) -> Result<()> {
        match run("tc", &delete_args(dev, filter)) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Error::FilterOp(e)),
        }
    }

    fn add_redirect(&self, dev: &str, filter: &U32Filter, target: &str) -> Result<()> {
        run("tc", &redirect_args(dev, filter, target)).map_err(Error::FilterOp)?;
        Ok(())
    }
}

fn selector_args(dev: &str, filter: &U32Filter, verb: &str) -> Vec<String> {
    let pref = filter.pref.to_string();
    [
        "filter",
        verb,
        "dev",
        dev,
        "egress",
        "pref",
        pref.as_str(),
        "protocol",
        filter.protocol.as_str(),
    ]
    .map(String::from)
    .to_vec()
}

/// `tc` arguments removing `filter`, by handle when the kernel reported one.
pub fn delete_args(dev: &str, filter: &U32Filter) -> Vec<String> {
    let mut args = selector_args(dev, filter, "del");
    if let Some(handle) = &filter.handle {
        args.extend(["handle", handle.as_str(), "u32"].map(String::from));
    }
    args
}

/// `tc` arguments installing `filter` as a redirect into the ingress of `target`.
pub fn redirect_args(dev: &str, filter: &U32Filter, target: &str) -> Vec<String> {
    let mut args = selector_args(dev, filter, "add");
    args.push("u32".into());
    for key in &filter.keys {
        args.extend([
            "match".into(),
            "u32".into(),
            format!("{:#010x}", key.val),
            format!("{:#010x}", key.mask),
            "at".into(),
            key.off.to_string(),
        ]);
    }
    args.extend(["action", "mirred", "ingress", "redirect", "dev", target].map(String::from));
    args
}
