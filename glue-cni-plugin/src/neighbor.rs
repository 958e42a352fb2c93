use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use futures::TryStreamExt;
use glue_cni_common::MacAddr6;
use rtnetlink::packet_route::neighbour::NeighbourState;
use tracing::{debug, info};

use crate::{Error, Result};

/// Static neighbor pinned inside a container so ipvlan pods can resolve the
/// shared service gateway without ARP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NeighborEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddr6,
}

pub trait NeighborInstaller {
    fn install(&self, netns: &Path, ifname: &str, entry: &NeighborEntry) -> Result<()>;
}

/// Enters the container network namespace for the duration of one netlink
/// request. The calling thread is moved back to its own namespace on every path.
pub struct NetnsNeighbors;

impl NeighborInstaller for NetnsNeighbors {
    fn install(&self, netns: &Path, ifname: &str, entry: &NeighborEntry) -> Result<()> {
        let ns = netns_rs::get_from_path(netns)?;
        info!(netns = %ns, ip = %entry.ip, mac = %entry.mac, ifname, "installing neighbor");
        ns.run(|_| install_in_current_netns(ifname, entry))?
    }
}

fn neighbor_error(op: &str) -> impl FnOnce(rtnetlink::Error) -> Error + '_ {
    move |e| Error::Neighbor(format!("{op}: {e}"))
}

/// The netlink socket is bound to the namespace it is opened in, so it has to
/// be created after entering the container namespace.
fn install_in_current_netns(ifname: &str, entry: &NeighborEntry) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    runtime.block_on(async {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let index = handle
            .link()
            .get()
            .match_name(ifname.to_owned())
            .execute()
            .try_next()
            .await
            .map_err(neighbor_error("lookup interface"))?
            .map(|link| link.header.index)
            .ok_or_else(|| Error::Neighbor(format!("interface {ifname} not found")))?;
        debug!(ifname, index, "found container interface");

        handle
            .neighbours()
            .add(index, IpAddr::V4(entry.ip))
            .link_local_address(entry.mac.as_bytes())
            .state(NeighbourState::Permanent)
            .replace()
            .execute()
            .await
            .map_err(neighbor_error("add neighbor"))
    })
}
