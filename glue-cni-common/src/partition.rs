//! Carves this node's pod address range out of the cluster pod network.
//!
//! All arithmetic is done on the host-order `u32` form of the addresses. The
//! first address of the pod network is never handed out, the node holding the
//! first block also withholds its block's network address, and the node holding
//! the last block withholds the broadcast address (macvlan) or the broadcast
//! address plus both gateways (ipvlan).

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::topology::{MasterKind, NetworkTopology};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeAddressPlan {
    /// First address this node may assign to a pod.
    pub range_start: Ipv4Addr,
    /// Last address this node may assign to a pod, inclusive.
    pub range_end: Ipv4Addr,
    /// Address of the managed link on this node.
    pub node_address: Ipv4Addr,
    pub pod_gateway: Ipv4Addr,
    pub service_gateway: Ipv4Addr,
}

impl NodeAddressPlan {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        addr >= self.range_start && addr <= self.range_end
    }

    /// Gateway handed to pods: the node itself for macvlan, the shared pod
    /// gateway for ipvlan.
    pub fn gateway(&self, kind: MasterKind) -> Ipv4Addr {
        match kind {
            MasterKind::Macvlan => self.node_address,
            MasterKind::Ipvlan => self.pod_gateway,
        }
    }
}

pub fn partition(topology: &NetworkTopology) -> Result<NodeAddressPlan> {
    partition_blocks(topology.pod_cidr, topology.node_cidr, topology.master.kind)
}

pub fn partition_blocks(
    pod: Ipv4Network,
    node: Ipv4Network,
    kind: MasterKind,
) -> Result<NodeAddressPlan> {
    if !pod.contains(node.network()) || node.prefix() < pod.prefix() {
        return Err(Error::InvalidTopology(format!(
            "node cidr {node} is not contained in pod cidr {pod}"
        )));
    }

    let (pod_base, pod_span) = base_and_span(pod);
    let (node_base, node_span) = base_and_span(node);
    let too_small = || Error::InvalidTopology(format!("node cidr {node} leaves no pod addresses"));

    let mut start_offset = 1u32;
    if node_base == pod_base {
        start_offset += 1;
    }

    let pod_last = pod_base.checked_add(pod_span).ok_or_else(too_small)?;
    let node_last = node_base.checked_add(node_span).ok_or_else(too_small)?;
    let mut end_offset = node_span;
    if node_last == pod_last {
        let reserved = match kind {
            MasterKind::Macvlan => 1,
            MasterKind::Ipvlan => 3,
        };
        end_offset = end_offset.checked_sub(reserved).ok_or_else(too_small)?;
    }

    let range_start = node_base.checked_add(start_offset).ok_or_else(too_small)?;
    let range_end = node_base.checked_add(end_offset).ok_or_else(too_small)?;
    if range_start > range_end {
        return Err(too_small());
    }

    let pod_gateway = pod_last.checked_sub(1).ok_or_else(too_small)?;
    let service_gateway = pod_last.checked_sub(2).ok_or_else(too_small)?;

    Ok(NodeAddressPlan {
        range_start: range_start.into(),
        range_end: range_end.into(),
        node_address: (range_start - 1).into(),
        pod_gateway: pod_gateway.into(),
        service_gateway: service_gateway.into(),
    })
}

fn base_and_span(net: Ipv4Network) -> (u32, u32) {
    (u32::from(net.network()), !u32::from(net.mask()))
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_first_node() {
        let plan = partition_blocks(
            net("172.24.0.0/21"),
            net("172.24.0.0/24"),
            MasterKind::Macvlan,
        )
        .unwrap();
        assert_eq!(plan.node_address, addr("172.24.0.1"));
        assert_eq!(plan.range_start, addr("172.24.0.2"));
        assert_eq!(plan.range_end, addr("172.24.0.255"));
    }

    #[test]
    fn test_last_node_macvlan() {
        let plan = partition_blocks(
            net("172.24.0.0/21"),
            net("172.24.7.0/24"),
            MasterKind::Macvlan,
        )
        .unwrap();
        assert_eq!(plan.node_address, addr("172.24.7.0"));
        assert_eq!(plan.range_start, addr("172.24.7.1"));
        assert_eq!(plan.range_end, addr("172.24.7.254"));
        assert_eq!(plan.gateway(MasterKind::Macvlan), addr("172.24.7.0"));
    }

    #[test]
    fn test_last_node_ipvlan() {
        let plan = partition_blocks(
            net("172.24.0.0/21"),
            net("172.24.7.0/24"),
            MasterKind::Ipvlan,
        )
        .unwrap();
        assert_eq!(plan.range_start, addr("172.24.7.1"));
        assert_eq!(plan.range_end, addr("172.24.7.252"));
        assert_eq!(plan.pod_gateway, addr("172.24.7.254"));
        assert_eq!(plan.service_gateway, addr("172.24.7.253"));
        assert_eq!(plan.gateway(MasterKind::Ipvlan), addr("172.24.7.254"));
    }

    #[test]
    fn test_middle_node_uses_whole_block() {
        let plan = partition_blocks(
            net("172.24.0.0/21"),
            net("172.24.3.0/24"),
            MasterKind::Ipvlan,
        )
        .unwrap();
        assert_eq!(plan.node_address, addr("172.24.3.0"));
        assert_eq!(plan.range_start, addr("172.24.3.1"));
        assert_eq!(plan.range_end, addr("172.24.3.255"));
    }

    #[test]
    fn test_unaligned_node_cidr_uses_network_address() {
        let plan = partition_blocks(
            net("172.24.0.0/21"),
            net("172.24.3.17/24"),
            MasterKind::Macvlan,
        )
        .unwrap();
        assert_eq!(plan.node_address, addr("172.24.3.0"));
    }

    #[test]
    fn test_node_outside_pod_network() {
        assert!(matches!(
            partition_blocks(
                net("172.24.0.0/21"),
                net("172.25.0.0/24"),
                MasterKind::Macvlan
            ),
            Err(Error::InvalidTopology(_))
        ));
        assert!(matches!(
            partition_blocks(
                net("172.24.0.0/21"),
                net("172.24.0.0/20"),
                MasterKind::Macvlan
            ),
            Err(Error::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_block_too_small() {
        // single /30 node holding both the first and last block
        assert!(
            partition_blocks(net("10.0.0.0/30"), net("10.0.0.0/30"), MasterKind::Ipvlan).is_err()
        );
        assert!(
            partition_blocks(net("10.0.0.0/24"), net("10.0.0.252/30"), MasterKind::Ipvlan)
                .is_err()
        );
        assert!(
            partition_blocks(net("10.0.0.0/24"), net("10.0.0.7/32"), MasterKind::Macvlan).is_err()
        );
    }

    fn blocks() -> impl Strategy<Value = (Ipv4Network, u8, MasterKind)> {
        (16u8..=26, 1u8..=4, any::<bool>(), any::<u32>()).prop_map(
            |(pod_prefix, extra, ipvlan, seed)| {
                let node_prefix = (pod_prefix + extra).min(30);
                let pod = Ipv4Network::new(Ipv4Addr::from(seed), pod_prefix).unwrap();
                let pod = Ipv4Network::new(pod.network(), pod_prefix).unwrap();
                let kind = if ipvlan {
                    MasterKind::Ipvlan
                } else {
                    MasterKind::Macvlan
                };
                (pod, node_prefix, kind)
            },
        )
    }

    fn node_block(pod: Ipv4Network, node_prefix: u8, index: u32) -> Ipv4Network {
        let count = 1u32 << (node_prefix - pod.prefix());
        let size = 1u32 << (32 - node_prefix);
        let base = u32::from(pod.network()) + (index % count) * size;
        Ipv4Network::new(base.into(), node_prefix).unwrap()
    }

    proptest! {
        #[test]
        fn partition_is_valid((pod, node_prefix, kind) in blocks(), index in any::<u32>()) {
            let node = node_block(pod, node_prefix, index);
            let result = partition_blocks(pod, node, kind);
            if node_prefix <= 29 {
                prop_assert!(result.is_ok());
            }
            if let Ok(plan) = result {
                prop_assert!(plan.range_start <= plan.range_end);
                prop_assert!(node.contains(plan.range_start));
                prop_assert!(node.contains(plan.range_end));
                prop_assert!(pod.contains(plan.node_address));
                prop_assert_eq!(u32::from(plan.node_address) + 1, u32::from(plan.range_start));
                prop_assert_ne!(plan.range_start, pod.network());
                prop_assert!(!plan.contains(pod.broadcast()));
                if kind == MasterKind::Ipvlan {
                    prop_assert!(!plan.contains(plan.pod_gateway));
                    prop_assert!(!plan.contains(plan.service_gateway));
                }
            }
        }

        #[test]
        fn partitions_are_disjoint(
            (pod, node_prefix, kind) in blocks(),
            a in any::<u32>(),
            b in any::<u32>(),
        ) {
            let left = node_block(pod, node_prefix, a);
            let right = node_block(pod, node_prefix, b);
            prop_assume!(left != right);
            if let (Ok(l), Ok(r)) = (
                partition_blocks(pod, left, kind),
                partition_blocks(pod, right, kind),
            ) {
                prop_assert!(l.range_end < r.range_start || r.range_end < l.range_start);
                prop_assert!(!l.contains(r.node_address));
                prop_assert!(!r.contains(l.node_address));
                prop_assert_ne!(l.node_address, r.node_address);
            }
        }
    }
}
