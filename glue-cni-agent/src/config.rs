use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use glue_cni_common::{MacAddr6, MasterKind};
use ipnetwork::Ipv4Network;

use crate::{Error, Result};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Run the node agent
    Agent(AgentArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Path to a kubeconfig, in-cluster or default config is inferred when unset
    #[arg(long, alias = "kubeconfig-file", env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Topology file shared with the CNI plugin
    #[arg(long, default_value = glue_cni_common::DEFAULT_TOPOLOGY_FILE)]
    pub subnet_file: PathBuf,

    /// Cluster pod network, read from kubeadm-config when unset
    #[arg(long)]
    pub pod_cidr: Option<Ipv4Network>,

    /// Cluster service network, required with --pod-cidr
    #[arg(long)]
    pub service_cidr: Option<Ipv4Network>,

    /// Pod network block of this node, required with --pod-cidr
    #[arg(long)]
    pub node_cidr: Option<Ipv4Network>,

    /// Kind of link pods are attached with, macvlan or ipvlan
    #[arg(long, alias = "stick-cni-type", default_value = "macvlan")]
    pub master_type: MasterKind,

    /// Host interface to attach to, defaults to the interface of the default route
    #[arg(long, alias = "stick-cni-master")]
    pub master: Option<String>,

    /// Link mode, bridge for macvlan and l2 for ipvlan when unset
    #[arg(long, alias = "stick-cni-mode")]
    pub master_mode: Option<String>,

    /// Neighbor address pinned for the ipvlan service gateway
    #[arg(long)]
    pub ipvlan_neigh_mac: Option<MacAddr6>,

    /// Name of the node the agent is running on, defaults to the hostname
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Metrics and readiness listener
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// Comma separated src:dst pairs copied on start and removed on exit
    #[arg(long, env = "GLUE_FILES_TO_COPY_ON_BOOT", default_value = "")]
    pub copy_on_boot: String,
}

impl AgentArgs {
    pub fn validate(&self) -> Result<()> {
        if self.pod_cidr.is_some() && (self.service_cidr.is_none() || self.node_cidr.is_none())
        {
            return Err(Error::Config(
                "--service-cidr and --node-cidr are required with --pod-cidr".into(),
            ));
        }
        self.master_type.validate_mode(&self.mode())?;
        Ok(())
    }

    pub fn mode(&self) -> String {
        match &self.master_mode {
            Some(mode) => mode.clone(),
            None => self.master_type.modes()[0].to_owned(),
        }
    }
}
