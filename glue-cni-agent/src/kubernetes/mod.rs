use std::fs;
use std::path::Path;

use futures::StreamExt;
use ipnetwork::Ipv4Network;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{WatchStreamExt, watcher};
use kube::Api;
use serde::Deserialize;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentArgs;
use crate::topology::{Publisher, TopologyTemplate};
use crate::{Error, Result};

pub const KUBEADM_CONFIG_NAMESPACE: &str = "kube-system";
pub const KUBEADM_CONFIG_NAME: &str = "kubeadm-config";
const CLUSTER_CONFIGURATION_KEY: &str = "ClusterConfiguration";
const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfiguration {
    #[serde(default)]
    pub networking: Networking,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    pub pod_subnet: Option<String>,
    pub service_subnet: Option<String>,
}

/// Cluster pod and service networks from a kubeadm `ClusterConfiguration`.
/// Dual-stack subnets are comma separated, the first IPv4 one is used.
pub fn parse_cluster_networking(raw: &str) -> Result<(Ipv4Network, Ipv4Network)> {
    let config: ClusterConfiguration = serde_yaml::from_str(raw)?;
    let pod = first_ipv4(config.networking.pod_subnet.as_deref())
        .ok_or_else(|| Error::Config("kubeadm config has no IPv4 podSubnet".into()))?;
    let service = first_ipv4(config.networking.service_subnet.as_deref())
        .ok_or_else(|| Error::Config("kubeadm config has no IPv4 serviceSubnet".into()))?;
    Ok((pod, service))
}

fn first_ipv4(subnets: Option<&str>) -> Option<Ipv4Network> {
    subnets?
        .split(',')
        .find_map(|s| s.trim().parse::<Ipv4Network>().ok())
}

pub async fn client(kubeconfig: Option<&Path>) -> Result<kube::Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => kube::Config::infer().await?,
    };
    Ok(kube::Client::try_from(config)?)
}

pub async fn cluster_networking(client: kube::Client) -> Result<(Ipv4Network, Ipv4Network)> {
    let api: Api<ConfigMap> = Api::namespaced(client, KUBEADM_CONFIG_NAMESPACE);
    let config_map = api.get(KUBEADM_CONFIG_NAME).await?;
    let raw = config_map
        .data
        .as_ref()
        .and_then(|data| data.get(CLUSTER_CONFIGURATION_KEY))
        .ok_or_else(|| {
            Error::Config(format!(
                "{KUBEADM_CONFIG_NAMESPACE}/{KUBEADM_CONFIG_NAME} has no {CLUSTER_CONFIGURATION_KEY}"
            ))
        })?;
    parse_cluster_networking(raw)
}

pub fn node_name(configured: Option<&str>, hostname_path: impl AsRef<Path>) -> Result<String> {
    if let Some(name) = configured.map(str::trim).filter(|n| !n.is_empty()) {
        return Ok(name.to_owned());
    }
    let hostname = fs::read_to_string(hostname_path)?;
    let hostname = hostname.trim();
    if hostname.is_empty() {
        return Err(Error::Config("unable to determine node name".into()));
    }
    Ok(hostname.to_owned())
}

/// Remembers the last pod CIDR seen on the node so only changes are published.
#[derive(Debug, Default)]
pub struct NodeCidrTracker {
    last: Option<Ipv4Network>,
}

impl NodeCidrTracker {
    pub fn observe(&mut self, node: &Node) -> Option<Ipv4Network> {
        let spec = node.spec.as_ref()?;
        let cidr = spec
            .pod_cidr
            .iter()
            .chain(spec.pod_cidrs.iter().flatten())
            .find_map(|c| c.parse::<Ipv4Network>().ok());
        let Some(cidr) = cidr else {
            debug!("node has no IPv4 pod cidr yet");
            return None;
        };
        if self.last == Some(cidr) {
            return None;
        }
        self.last = Some(cidr);
        Some(cidr)
    }
}

/// Watches this node and publishes a topology whenever its pod CIDR changes.
pub async fn watch_node_topology(
    args: &AgentArgs,
    template: TopologyTemplate,
    publisher: Publisher,
    cancel: CancellationToken,
) -> Result<()> {
    let client = client(args.kubeconfig.as_deref()).await?;
    let (pod_cidr, service_cidr) = cluster_networking(client.clone()).await?;
    let node_name = node_name(args.node_name.as_deref(), HOSTNAME_PATH)?;
    info!(%node_name, %pod_cidr, %service_cidr, "watching node for pod cidr");

    let api: Api<Node> = Api::all(client);
    let config = watcher::Config::default().fields(&format!("metadata.name={node_name}"));
    let mut stream = watcher(api, config)
        .default_backoff()
        .applied_objects()
        .boxed();
    let mut tracker = NodeCidrTracker::default();

    loop {
        let node = select! {
            _ = cancel.cancelled() => return Ok(()),
            next = stream.next() => match next {
                Some(Ok(node)) => node,
                Some(Err(e)) => {
                    warn!(%e, "node watch error");
                    continue;
                }
                None => return Ok(()),
            },
        };
        let Some(node_cidr) = tracker.observe(&node) else {
            continue;
        };
        match template.build(pod_cidr, service_cidr, node_cidr) {
            Ok(topology) => {
                let generation = publisher.publish(topology).await?;
                info!(generation, %node_cidr, "node pod cidr changed");
            }
            Err(e) => error!(%e, %node_cidr, "node pod cidr does not fit the cluster"),
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    const KUBEADM: &str = r#"
apiServer:
  timeoutForControlPlane: 4m0s
apiVersion: kubeadm.k8s.io/v1beta3
clusterName: kubernetes
kind: ClusterConfiguration
networking:
  dnsDomain: cluster.local
  podSubnet: 172.24.0.0/21
  serviceSubnet: 172.23.0.0/24
"#;

    fn node(pod_cidr: Option<&str>, pod_cidrs: &[&str]) -> Node {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {"name": "node-1"},
            "spec": {"podCIDR": pod_cidr, "podCIDRs": pod_cidrs},
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_cluster_networking() {
        let (pod, service) = parse_cluster_networking(KUBEADM).unwrap();
        assert_eq!(pod, "172.24.0.0/21".parse().unwrap());
        assert_eq!(service, "172.23.0.0/24".parse().unwrap());
    }

    #[test]
    fn test_parse_dual_stack() {
        let raw = "networking:\n  podSubnet: fd00:10::/56,10.244.0.0/16\n  serviceSubnet: 10.96.0.0/12,fd00:20::/112\n";
        let (pod, service) = parse_cluster_networking(raw).unwrap();
        assert_eq!(pod, "10.244.0.0/16".parse().unwrap());
        assert_eq!(service, "10.96.0.0/12".parse().unwrap());
    }

    #[test]
    fn test_parse_missing_subnets() {
        let raw = "networking:\n  podSubnet: 10.244.0.0/16\n";
        assert!(matches!(
            parse_cluster_networking(raw),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            parse_cluster_networking("kind: ClusterConfiguration\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            parse_cluster_networking("networking: [1, 2"),
            Err(Error::YamlConversion(_))
        ));
    }

    #[test]
    fn test_tracker_reports_changes_only() {
        let mut tracker = NodeCidrTracker::default();
        assert_eq!(tracker.observe(&node(None, &[])), None);

        let first = node(Some("172.24.1.0/24"), &["172.24.1.0/24"]);
        assert_eq!(
            tracker.observe(&first),
            Some("172.24.1.0/24".parse().unwrap())
        );
        assert_eq!(tracker.observe(&first), None);

        let moved = node(Some("172.24.2.0/24"), &[]);
        assert_eq!(
            tracker.observe(&moved),
            Some("172.24.2.0/24".parse().unwrap())
        );
    }

    #[test]
    fn test_tracker_picks_ipv4_from_dual_stack() {
        let mut tracker = NodeCidrTracker::default();
        let node = node(Some("fd00:10::/64"), &["fd00:10::/64", "10.244.3.0/24"]);
        assert_eq!(
            tracker.observe(&node),
            Some("10.244.3.0/24".parse().unwrap())
        );
    }

    #[test]
    fn test_node_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostname");
        fs::write(&path, "worker-3\n").unwrap();

        assert_eq!(node_name(Some("node-a"), &path).unwrap(), "node-a");
        assert_eq!(node_name(Some(" "), &path).unwrap(), "worker-3");
        assert_eq!(node_name(None, &path).unwrap(), "worker-3");

        fs::write(&path, "").unwrap();
        assert!(matches!(node_name(None, &path), Err(Error::Config(_))));
    }
}
