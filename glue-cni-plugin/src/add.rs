use glue_cni_common::{MasterKind, NetworkTopology, partition};
use tracing::{debug, error, info, warn};

use crate::config::Args;
use crate::delegate::DelegateInvoker;
use crate::neighbor::{NeighborEntry, NeighborInstaller};
use crate::response::{Response, Success};
use crate::store::RecordStore;
use crate::types::{DelegateSpec, NetConf};
use crate::{Error, Result, ensure_supported};

pub fn add(
    args: &Args,
    conf: NetConf,
    delegate: &impl DelegateInvoker,
    neighbors: &impl NeighborInstaller,
) -> Response {
    info!(
        container_id = %args.container_id,
        name = %conf.name,
        "add called"
    );
    match try_add(args, &conf, delegate, neighbors) {
        Ok(success) => {
            debug!("add response {:?}", success);
            Response::Success(success)
        }
        Err(e) => {
            error!(%e, container_id = %args.container_id, "add failed");
            e.into_response(conf.cni_version)
        }
    }
}

/// Attaches one container: the attachment record is written before the
/// delegate runs and removed again if the attachment does not complete.
pub fn try_add(
    args: &Args,
    conf: &NetConf,
    delegate: &impl DelegateInvoker,
    neighbors: &impl NeighborInstaller,
) -> Result<Success> {
    ensure_supported(&conf.cni_version)?;
    args.require_container()?;
    if conf.ipam.is_some() {
        debug!("ignoring ipam section, addresses come from the node range");
    }

    let topology = NetworkTopology::load(&conf.subnet_file)?;
    let plan = partition(&topology)?;
    let spec = DelegateSpec::new(conf, &topology, &plan)?;

    let netns = match topology.master.kind {
        MasterKind::Ipvlan => Some(args.net_ns.as_deref().ok_or_else(|| {
            Error::InvalidRequiredEnvVariables("CNI_NETNS is required".into())
        })?),
        MasterKind::Macvlan => None,
    };

    let buf = serde_json::to_vec(&spec)?;
    let store = RecordStore::new(&conf.data_dir);
    store.save(&args.container_id, &buf)?;

    let plugin = spec.r#type.as_str();
    let result = match delegate.add(plugin, &buf) {
        Ok(result) => result,
        Err(e) => {
            discard_record(&store, &args.container_id);
            return Err(e);
        }
    };

    if let Some(netns) = netns {
        let entry = NeighborEntry {
            ip: plan.service_gateway,
            mac: topology.neighbor_mac(),
        };
        if let Err(e) = neighbors.install(netns, &args.ifname, &entry) {
            error!(%e, "failed to install service gateway neighbor, rolling back");
            if let Err(e) = delegate.delete(plugin, &buf) {
                warn!(%e, "failed to roll back delegate");
            }
            discard_record(&store, &args.container_id);
            return Err(e);
        }
    }

    Ok(result.with_version(conf.cni_version.clone()))
}

fn discard_record(store: &RecordStore, container_id: &str) {
    if let Err(e) = store.remove(container_id) {
        warn!(%e, container_id, "failed to remove attachment record");
    }
}
