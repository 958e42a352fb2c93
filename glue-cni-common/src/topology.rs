use std::fmt::{self, Display};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Link-layer address pinned for the ipvlan service gateway when none is configured.
pub const DEFAULT_NEIGHBOR_MAC: MacAddr6 = MacAddr6::new(0x08, 0x60, 0x83, 0x00, 0x00, 0x00);

/// Cluster and node network description shared between the agent and the plugin
/// through the topology file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTopology {
    #[serde(
        rename = "podCIDR",
        alias = "PodCIDR",
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub pod_cidr: Ipv4Network,

    #[serde(
        rename = "serviceCIDR",
        alias = "ServiceCIDR",
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "crate::serialize_opt_to_string",
        deserialize_with = "crate::deserialize_non_empty"
    )]
    pub service_cidr: Option<Ipv4Network>,

    #[serde(
        rename = "nodeCIDR",
        alias = "NodeCIDR",
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub node_cidr: Ipv4Network,

    #[serde(alias = "Master")]
    pub master: Master,

    #[serde(
        rename = "defaultNeighMac",
        alias = "DefaultNeighMac",
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "crate::serialize_opt_to_string",
        deserialize_with = "crate::deserialize_non_empty"
    )]
    pub default_neighbor_mac: Option<MacAddr6>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Master {
    #[serde(rename = "type", alias = "Type")]
    pub kind: MasterKind,

    /// Host interface the managed link and every pod link are parented to.
    #[serde(rename = "master", alias = "Master")]
    pub interface: String,

    #[serde(default, alias = "Mode")]
    pub mode: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasterKind {
    Macvlan,
    Ipvlan,
}

impl MasterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasterKind::Macvlan => "macvlan",
            MasterKind::Ipvlan => "ipvlan",
        }
    }

    pub fn modes(&self) -> &'static [&'static str] {
        match self {
            MasterKind::Macvlan => &["bridge", "vepa", "passthru", "private"],
            MasterKind::Ipvlan => &["l2", "l3", "l3s"],
        }
    }

    /// Maps a configured mode onto one the kernel accepts for this kind.
    /// Unknown or empty modes fall back to `bridge` for macvlan and `l2` for ipvlan.
    pub fn link_mode(&self, mode: &str) -> &'static str {
        let modes = self.modes();
        modes.iter().find(|m| **m == mode).copied().unwrap_or(modes[0])
    }

    pub fn validate_mode(&self, mode: &str) -> Result<()> {
        if self.modes().contains(&mode) {
            return Ok(());
        }
        Err(Error::InvalidTopology(format!(
            "mode {mode} is not supported for {self}, expected one of {}",
            self.modes().join(", ")
        )))
    }
}

impl Display for MasterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MasterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "macvlan" => Ok(MasterKind::Macvlan),
            "ipvlan" => Ok(MasterKind::Ipvlan),
            _ => Err(Error::InvalidTopology(format!(
                "master type {s} not supported, expected macvlan or ipvlan"
            ))),
        }
    }
}

impl NetworkTopology {
    pub fn neighbor_mac(&self) -> MacAddr6 {
        self.default_neighbor_mac.unwrap_or(DEFAULT_NEIGHBOR_MAC)
    }

    pub fn link_mode(&self) -> &'static str {
        self.master.kind.link_mode(&self.master.mode)
    }

    pub fn validate(&self) -> Result<()> {
        if self.master.interface.trim().is_empty() {
            return Err(Error::InvalidTopology("master interface is empty".into()));
        }
        if !self.pod_cidr.contains(self.node_cidr.network())
            || self.node_cidr.prefix() < self.pod_cidr.prefix()
        {
            return Err(Error::InvalidTopology(format!(
                "node cidr {} is not contained in pod cidr {}",
                self.node_cidr, self.pod_cidr
            )));
        }
        Ok(())
    }

    pub fn from_slice(buf: &[u8]) -> Result<Self> {
        let topology: NetworkTopology =
            serde_json::from_slice(buf).map_err(|e| Error::InvalidTopology(e.to_string()))?;
        topology.validate()?;
        Ok(topology)
    }

    /// Reads the topology file. A missing or malformed file is an invalid topology.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let buf = match fs::read(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::InvalidTopology(format!(
                    "topology file {} not found",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_slice(&buf)
    }

    /// Writes the topology file by renaming a fully written sibling over it so
    /// readers never observe a partial file.
    pub fn store(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            DirBuilder::new().recursive(true).mode(0o700).create(parent)?;
        }
        let buf = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "stored topology");
        Ok(())
    }

    /// Removes the topology file, treating an already missing file as removed.
    pub fn remove(path: impl AsRef<Path>) -> Result<()> {
        match fs::remove_file(path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
