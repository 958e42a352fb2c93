use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::cni;
use crate::config::AgentArgs;
use crate::{Error, Result};

pub const PROC_NET_ROUTE: &str = "/proc/net/route";
pub const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

#[derive(Clone, Debug)]
pub struct HostPaths {
    pub routes: PathBuf,
    pub ip_forward: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            routes: PROC_NET_ROUTE.into(),
            ip_forward: IP_FORWARD.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedHost {
    pub master: String,
    /// Destinations installed on boot, removed again on teardown.
    pub boot_files: Vec<PathBuf>,
}

/// Enables forwarding and resolves the master interface. Boot files are only
/// installed once both succeeded, so an agent that fails to start leaves no
/// plugin behind.
pub fn prepare_host(args: &AgentArgs, paths: &HostPaths) -> Result<PreparedHost> {
    args.validate()?;
    enable_ip_forward(&paths.ip_forward)?;
    let master = match &args.master {
        Some(master) => master.clone(),
        None => {
            let master = default_route_interface(&paths.routes)?;
            info!(%master, "using default route interface as master");
            master
        }
    };
    let boot_files = cni::copy_on_boot(&cni::parse_copy_pairs(&args.copy_on_boot));
    Ok(PreparedHost { master, boot_files })
}

const RTF_UP: u32 = 0x1;

/// Name of the interface carrying the lowest metric IPv4 default route.
pub fn default_route_interface(path: impl AsRef<Path>) -> Result<String> {
    let table = fs::read_to_string(path)?;
    parse_default_route(&table)
        .ok_or_else(|| Error::Config("unable to find a default route interface".into()))
}

fn parse_default_route(table: &str) -> Option<String> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [iface, destination, _gateway, flags, _refcnt, _use, metric, mask, ..] =
                fields.as_slice()
            else {
                return None;
            };
            let flags = u32::from_str_radix(flags, 16).ok()?;
            if *destination != "00000000" || *mask != "00000000" || flags & RTF_UP == 0 {
                return None;
            }
            Some((metric.parse::<u32>().ok()?, iface.to_string()))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, iface)| iface)
}

pub fn enable_ip_forward(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if fs::read_to_string(path)?.trim() == "1" {
        return Ok(());
    }
    fs::write(path, "1")?;
    info!("enabled ipv4 forwarding");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::test::parse;

    struct Host {
        dir: tempfile::TempDir,
        paths: HostPaths,
        copy_on_boot: String,
        dst: PathBuf,
    }

    fn host() -> Host {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths {
            routes: dir.path().join("route"),
            ip_forward: dir.path().join("ip_forward"),
        };
        fs::write(&paths.routes, ROUTES).unwrap();
        fs::write(&paths.ip_forward, "0\n").unwrap();
        let src = dir.path().join("glue");
        fs::write(&src, b"plugin").unwrap();
        let dst = dir.path().join("installed-glue");
        let copy_on_boot = format!("{}:{}", src.display(), dst.display());
        Host {
            dir,
            paths,
            copy_on_boot,
            dst,
        }
    }

    const ROUTES: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
enp0s3\t00000000\t0202000A\t0003\t0\t0\t100\t00000000\t0\t0\t0
enp0s8\t00000000\t0138A8C0\t0003\t0\t0\t50\t00000000\t0\t0\t0
enp0s3\t0002000A\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
docker0\t000011AC\t00000000\t0001\t0\t0\t0\t0000FFFF\t0\t0\t0
";

    #[test]
    fn test_default_route_lowest_metric() {
        assert_eq!(parse_default_route(ROUTES).as_deref(), Some("enp0s8"));
    }

    #[test]
    fn test_no_default_route() {
        let table = "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\tMTU\tWindow\tIRTT
docker0\t000011AC\t00000000\t0001\t0\t0\t0\t0000FFFF\t0\t0\t0
eth9\t00000000\t0202000A\t0002\t0\t0\t0\t00000000\t0\t0\t0
";
        assert_eq!(parse_default_route(table), None);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("route");
        fs::write(&path, table).unwrap();
        assert!(matches!(
            default_route_interface(&path),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_enable_ip_forward() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip_forward");
        fs::write(&path, "0\n").unwrap();

        enable_ip_forward(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
        enable_ip_forward(&path).unwrap();
    }

    #[test]
    fn test_prepare_host() {
        let host = host();
        let args = parse(&["--copy-on-boot", &host.copy_on_boot]);

        let prepared = prepare_host(&args, &host.paths).unwrap();
        assert_eq!(prepared.master, "enp0s8");
        assert_eq!(prepared.boot_files, vec![host.dst.clone()]);
        assert!(host.dst.exists());
        assert_eq!(fs::read_to_string(&host.paths.ip_forward).unwrap(), "1");
    }

    #[test]
    fn test_failed_forwarding_installs_nothing() {
        let mut host = host();
        host.paths.ip_forward = host.dir.path().join("missing").join("ip_forward");
        let args = parse(&["--copy-on-boot", &host.copy_on_boot]);

        assert!(matches!(
            prepare_host(&args, &host.paths),
            Err(Error::IoError(_))
        ));
        assert!(!host.dst.exists());
    }

    #[test]
    fn test_missing_master_installs_nothing() {
        let host = host();
        fs::write(&host.paths.routes, "Iface\tDestination\tGateway\tFlags\n").unwrap();
        let args = parse(&["--copy-on-boot", &host.copy_on_boot]);

        assert!(matches!(
            prepare_host(&args, &host.paths),
            Err(Error::Config(_))
        ));
        assert!(!host.dst.exists());

        let args = parse(&["--master", "eth1", "--copy-on-boot", &host.copy_on_boot]);
        assert_eq!(prepare_host(&args, &host.paths).unwrap().master, "eth1");
        assert!(host.dst.exists());
    }
}
