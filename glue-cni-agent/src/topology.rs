use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use glue_cni_common::{MacAddr6, Master, NetworkTopology, partition};
use ipnetwork::Ipv4Network;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AgentArgs;
use crate::kubernetes;
use crate::{Error, Result};

/// A topology tagged with the generation it was published under. Later
/// publications always carry a higher generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedTopology {
    pub generation: u64,
    pub topology: NetworkTopology,
}

#[derive(Debug)]
pub enum Message {
    Topology(VersionedTopology),
    Shutdown(&'static str),
}

/// Latest published generation, shared between publishers and reconcile
/// passes so a pass can tell when it has been superseded.
#[derive(Clone, Debug, Default)]
pub struct Fence(Arc<AtomicU64>);

impl Fence {
    pub fn latest(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.latest() == generation
    }

    pub(crate) fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Clone, Debug)]
pub struct Publisher {
    fence: Fence,
    tx: Sender<Message>,
}

pub fn channel(capacity: usize) -> (Publisher, Fence, Receiver<Message>) {
    let (tx, rx) = mpsc::channel(capacity);
    let fence = Fence::default();
    (
        Publisher {
            fence: fence.clone(),
            tx,
        },
        fence,
        rx,
    )
}

impl Publisher {
    /// Publishes a topology under a new generation, superseding any pass
    /// still working on an older one.
    pub async fn publish(&self, topology: NetworkTopology) -> Result<u64> {
        let generation = self.fence.advance();
        self.tx
            .send(Message::Topology(VersionedTopology {
                generation,
                topology,
            }))
            .await
            .map_err(|_| Error::ChannelError)?;
        debug!(generation, "published topology");
        Ok(generation)
    }

    /// Asks the coordination loop to tear down. Any pass in flight is
    /// superseded first so teardown is not held up by it.
    pub async fn shutdown(&self, reason: &'static str) {
        self.fence.advance();
        if self.tx.send(Message::Shutdown(reason)).await.is_err() {
            debug!(reason, "coordination loop already stopped");
        }
    }
}

/// The parts of the topology known before this node's block is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyTemplate {
    pub master: Master,
    pub default_neighbor_mac: Option<MacAddr6>,
}

impl TopologyTemplate {
    pub fn new(args: &AgentArgs, interface: String) -> Self {
        Self {
            master: Master {
                kind: args.master_type,
                interface,
                mode: args.mode(),
            },
            default_neighbor_mac: args.ipvlan_neigh_mac,
        }
    }

    pub fn build(
        &self,
        pod_cidr: Ipv4Network,
        service_cidr: Ipv4Network,
        node_cidr: Ipv4Network,
    ) -> Result<NetworkTopology> {
        let topology = NetworkTopology {
            pod_cidr,
            service_cidr: Some(service_cidr),
            node_cidr,
            master: self.master.clone(),
            default_neighbor_mac: self.default_neighbor_mac,
        };
        topology.validate()?;
        partition(&topology)?;
        Ok(topology)
    }
}

/// Publishes topologies until cancelled: once from static flags, or on every
/// change of this node's pod CIDR when running against a cluster.
pub async fn run_source(
    args: AgentArgs,
    template: TopologyTemplate,
    publisher: Publisher,
    cancel: CancellationToken,
) -> Result<()> {
    if let (Some(pod), Some(service), Some(node)) =
        (args.pod_cidr, args.service_cidr, args.node_cidr)
    {
        let topology = template.build(pod, service, node)?;
        let generation = publisher.publish(topology).await?;
        info!(generation, %node, "published static topology");
        return Ok(());
    }
    kubernetes::watch_node_topology(&args, template, publisher, cancel).await
}
