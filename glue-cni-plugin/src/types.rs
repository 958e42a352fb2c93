use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use glue_cni_common::{MasterKind, NetworkTopology, NodeAddressPlan};
use ipnetwork::{IpNetwork, Ipv4Network};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{DEFAULT_DATA_DIR, Error, Result};

const HOST_LOCAL: &str = "host-local";

/// Keys of the delegate configuration this plugin always sets itself.
const RESERVED_DELEGATE_KEYS: [&str; 6] = ["cniVersion", "name", "type", "master", "mode", "ipam"];

/// Network configuration read from stdin.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub r#type: String,

    /// Overrides merged into the generated delegate configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<Map<String, Value>>,

    /// Ignored, addresses are always managed by host-local in the delegate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<Value>,

    #[serde(default = "default_subnet_file")]
    pub subnet_file: PathBuf,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(
        default,
        rename = "prevResult",
        skip_serializing_if = "Option::is_none"
    )]
    pub previous_result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_config: Option<Value>,
}

fn default_subnet_file() -> PathBuf {
    PathBuf::from(glue_cni_common::DEFAULT_TOPOLOGY_FILE)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

/// Configuration handed to the macvlan or ipvlan plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateSpec {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,

    pub name: String,

    pub r#type: MasterKind,

    pub master: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    pub ipam: Ipam,

    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl DelegateSpec {
    pub fn new(conf: &NetConf, topology: &NetworkTopology, plan: &NodeAddressPlan) -> Result<Self> {
        let kind = topology.master.kind;
        let default_route = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
            .map_err(|e| Error::Parse(e.to_string()))?;
        let mut routes = vec![Route::via(IpNetwork::V4(default_route), None)];
        if kind == MasterKind::Ipvlan {
            let service_cidr = topology.service_cidr.ok_or_else(|| {
                Error::InvalidTopology("ipvlan requires serviceCIDR".into())
            })?;
            routes.push(Route::via(
                IpNetwork::V4(service_cidr),
                Some(plan.service_gateway.into()),
            ));
        }

        let mut options = conf.delegate.clone().unwrap_or_default();
        for key in RESERVED_DELEGATE_KEYS {
            options.remove(key);
        }

        let mode = Some(topology.master.mode.clone()).filter(|m| !m.is_empty());

        Ok(Self {
            cni_version: conf.cni_version.clone(),
            name: conf.name.clone(),
            r#type: kind,
            master: topology.master.interface.clone(),
            mode,
            ipam: Ipam {
                r#type: HOST_LOCAL.into(),
                ranges: vec![vec![IpRange {
                    subnet: IpNetwork::V4(topology.pod_cidr),
                    range_start: plan.range_start.into(),
                    range_end: plan.range_end.into(),
                    gateway: plan.gateway(kind).into(),
                }]],
                routes,
                options: Map::new(),
            },
            options,
        })
    }
}

/// The part of a stored delegate configuration needed to remove it again.
#[derive(Clone, Debug, Deserialize)]
pub struct DelegateHeader {
    pub r#type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ipam {
    pub r#type: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<Vec<IpRange>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    #[serde(flatten)]
    pub options: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpRange {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub subnet: IpNetwork,
    pub range_start: IpAddr,
    pub range_end: IpAddr,
    pub gateway: IpAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub dst: IpNetwork,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<u8>,
}

impl Route {
    pub fn via(dst: IpNetwork, gw: Option<IpAddr>) -> Self {
        Self {
            dst,
            gw,
            mtu: None,
            priority: None,
            table: None,
            scope: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,

    #[serde(default, rename = "pciID", skip_serializing_if = "Option::is_none")]
    pub pci_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ip {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub address: IpNetwork,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,

    /// Only present in results of 0.3.x and 0.4.0 plugins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
    #[serde(
        serialize_with = "crate::serialize_to_string_slice",
        deserialize_with = "crate::deserialize_from_str_vec",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub nameservers: Vec<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}
