use std::net::IpAddr;

use futures::TryStreamExt;
use glue_cni_common::{MANAGED_LINK, MasterKind, NetworkTopology, NodeAddressPlan};
use ipnetwork::Ipv4Network;
use rtnetlink::packet_route::link::{IpVlanMode, LinkMessage, MacVlanMode};
use rtnetlink::{LinkIpVlan, LinkMacVlan, LinkMessageBuilder, LinkUnspec};
use tracing::{debug, info};

use crate::reconcile::HostKernel;
use crate::{Error, Result};

const ENOENT: i32 = 2;
const ENODEV: i32 = 19;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub name: String,
    pub kind: MasterKind,
    pub parent: String,
    pub mode: &'static str,
}

pub trait LinkOps {
    /// Deletes the link. A link that does not exist is already deleted.
    fn delete_link(&self, name: &str) -> Result<()>;
    fn create_link(&self, link: &LinkSpec) -> Result<()>;
    fn add_address(&self, name: &str, addr: Ipv4Network) -> Result<()>;
    fn set_up(&self, name: &str) -> Result<()>;
    fn set_promiscuous(&self, name: &str) -> Result<()>;
}

/// Recreates the managed link from scratch so its kind, mode and parent always
/// match the topology.
pub fn converge(ops: &impl LinkOps, topology: &NetworkTopology, plan: &NodeAddressPlan) -> Result<()> {
    let link = LinkSpec {
        name: MANAGED_LINK.into(),
        kind: topology.master.kind,
        parent: topology.master.interface.clone(),
        mode: topology.link_mode(),
    };
    let addr = Ipv4Network::new(plan.node_address, topology.pod_cidr.prefix())?;

    ops.delete_link(&link.name)?;
    ops.create_link(&link)?;
    ops.add_address(&link.name, addr)?;
    ops.set_up(&link.name)?;
    // macvlan children only see frames for their macs with the parent promiscuous
    if link.kind == MasterKind::Macvlan {
        ops.set_promiscuous(&link.parent)?;
    }
    info!(
        link = %link.name,
        kind = %link.kind,
        mode = link.mode,
        parent = %link.parent,
        %addr,
        "managed link ready"
    );
    Ok(())
}

pub fn teardown(ops: &impl LinkOps) -> Result<()> {
    ops.delete_link(MANAGED_LINK)
}

fn macvlan_mode(mode: &str) -> Result<MacVlanMode> {
    match mode {
        "bridge" => Ok(MacVlanMode::Bridge),
        "vepa" => Ok(MacVlanMode::Vepa),
        "passthru" => Ok(MacVlanMode::Passthrough),
        "private" => Ok(MacVlanMode::Private),
        _ => Err(Error::InvalidTopology(format!("unsupported macvlan mode {mode}"))),
    }
}

fn ipvlan_mode(mode: &str) -> Result<IpVlanMode> {
    match mode {
        "l2" => Ok(IpVlanMode::L2),
        "l3" => Ok(IpVlanMode::L3),
        "l3s" => Ok(IpVlanMode::L3S),
        _ => Err(Error::InvalidTopology(format!("unsupported ipvlan mode {mode}"))),
    }
}

/// Netlink request creating `link` on top of the interface at `parent_index`.
pub fn link_message(link: &LinkSpec, parent_index: u32) -> Result<LinkMessage> {
    let message = match link.kind {
        MasterKind::Macvlan => {
            LinkMacVlan::new(&link.name, parent_index, macvlan_mode(link.mode)?).build()
        }
        MasterKind::Ipvlan => {
            LinkIpVlan::new(&link.name, parent_index, ipvlan_mode(link.mode)?).build()
        }
    };
    Ok(message)
}

/// True when the kernel rejected a request because the link or address is gone.
pub fn is_missing(err: &rtnetlink::Error) -> bool {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg
            .code
            .is_some_and(|code| matches!(code.get().abs(), ENODEV | ENOENT)),
        _ => false,
    }
}

fn device_error(op: &'static str) -> impl FnOnce(rtnetlink::Error) -> Error {
    move |source| Error::DeviceOp { op, source }
}

impl HostKernel {
    async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let mut links = self
            .netlink
            .link()
            .get()
            .match_name(name.to_owned())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(msg.header.index)),
            Ok(None) => Ok(None),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(device_error("get")(e)),
        }
    }

    async fn require_index(&self, name: &str) -> Result<u32> {
        self.link_index(name)
            .await?
            .ok_or_else(|| Error::LinkNotFound(name.to_owned()))
    }

    async fn set_link(
        &self,
        name: &str,
        op: &'static str,
        build: fn(LinkMessageBuilder<LinkUnspec>) -> LinkMessage,
    ) -> Result<()> {
        let index = self.require_index(name).await?;
        let message = build(LinkUnspec::new_with_index(index));
        self.netlink
            .link()
            .set(message)
            .execute()
            .await
            .map_err(device_error(op))
    }
}

impl LinkOps for HostKernel {
    fn delete_link(&self, name: &str) -> Result<()> {
        self.block_on(async {
            let Some(index) = self.link_index(name).await? else {
                debug!(link = name, "link already absent");
                return Ok(());
            };
            match self.netlink.link().del(index).execute().await {
                Ok(()) => Ok(()),
                Err(e) if is_missing(&e) => Ok(()),
                Err(e) => Err(device_error("delete")(e)),
            }
        })
    }

    fn create_link(&self, link: &LinkSpec) -> Result<()> {
        self.block_on(async {
            let parent = self.require_index(&link.parent).await?;
            let message = link_message(link, parent)?;
            self.netlink
                .link()
                .add(message)
                .execute()
                .await
                .map_err(device_error("create"))
        })
    }

    fn add_address(&self, name: &str, addr: Ipv4Network) -> Result<()> {
        self.block_on(async {
            let index = self.require_index(name).await?;
            self.netlink
                .address()
                .add(index, IpAddr::V4(addr.ip()), addr.prefix())
                .execute()
                .await
                .map_err(device_error("address"))
        })
    }

    fn set_up(&self, name: &str) -> Result<()> {
        self.block_on(self.set_link(name, "up", |link| link.up().build()))
    }

    fn set_promiscuous(&self, name: &str) -> Result<()> {
        self.block_on(self.set_link(name, "promisc", |link| link.promiscuous(true).build()))
    }
}

#[cfg(test)]
mod test {
    use std::num::NonZeroI32;

    use rtnetlink::packet_core::ErrorMessage;
    use rtnetlink::packet_route::link::{
        InfoData, InfoIpVlan, InfoKind, InfoMacVlan, LinkAttribute, LinkInfo,
    };

    use super::*;

    fn spec(kind: MasterKind, mode: &'static str) -> LinkSpec {
        LinkSpec {
            name: MANAGED_LINK.into(),
            kind,
            parent: "enp0s8".into(),
            mode,
        }
    }

    fn link_info(message: &LinkMessage) -> Vec<LinkInfo> {
        message
            .attributes
            .iter()
            .filter_map(|attr| match attr {
                LinkAttribute::LinkInfo(info) => Some(info.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn netlink_error(errno: i32) -> rtnetlink::Error {
        let mut msg = ErrorMessage::default();
        msg.code = NonZeroI32::new(-errno);
        rtnetlink::Error::NetlinkError(msg)
    }

    #[test]
    fn test_macvlan_link_message() {
        let message = link_message(&spec(MasterKind::Macvlan, "bridge"), 3).unwrap();
        assert!(
            message
                .attributes
                .contains(&LinkAttribute::IfName(MANAGED_LINK.into()))
        );
        assert!(message.attributes.contains(&LinkAttribute::Link(3)));

        let info = link_info(&message);
        assert!(info.contains(&LinkInfo::Kind(InfoKind::MacVlan)));
        let data = info.iter().find_map(|i| match i {
            LinkInfo::Data(InfoData::MacVlan(data)) => Some(data),
            _ => None,
        });
        assert!(
            data.unwrap()
                .contains(&InfoMacVlan::Mode(MacVlanMode::Bridge))
        );
    }

    #[test]
    fn test_ipvlan_link_message() {
        let message = link_message(&spec(MasterKind::Ipvlan, "l3s"), 7).unwrap();
        assert!(message.attributes.contains(&LinkAttribute::Link(7)));

        let info = link_info(&message);
        assert!(info.contains(&LinkInfo::Kind(InfoKind::IpVlan)));
        let data = info.iter().find_map(|i| match i {
            LinkInfo::Data(InfoData::IpVlan(data)) => Some(data),
            _ => None,
        });
        assert!(data.unwrap().contains(&InfoIpVlan::Mode(IpVlanMode::L3S)));
    }

    #[test]
    fn test_link_modes() {
        assert_eq!(macvlan_mode("passthru").unwrap(), MacVlanMode::Passthrough);
        assert_eq!(macvlan_mode("private").unwrap(), MacVlanMode::Private);
        assert_eq!(ipvlan_mode("l2").unwrap(), IpVlanMode::L2);
        assert!(matches!(
            link_message(&spec(MasterKind::Ipvlan, "bridge"), 1),
            Err(Error::InvalidTopology(_))
        ));
        assert!(matches!(
            link_message(&spec(MasterKind::Macvlan, "l2"), 1),
            Err(Error::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_missing_link_errors() {
        assert!(is_missing(&netlink_error(ENODEV)));
        assert!(is_missing(&netlink_error(ENOENT)));
        // EPERM
        assert!(!is_missing(&netlink_error(1)));
        assert!(!is_missing(&rtnetlink::Error::RequestFailed));
    }
}
