use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::{Error, Result};

/// Invocation parameters handed to the plugin by the container runtime.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Possible values are ADD, DEL, CHECK, STATUS, GC, VERSION
    #[arg(long, env = "CNI_COMMAND", value_parser = parse_command)]
    pub command: Command,

    /// Container ID
    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    pub container_id: String,

    /// Path to the network namespace
    #[arg(long, env = "CNI_NETNS")]
    pub net_ns: Option<PathBuf>,

    /// Name of the interface inside the container
    #[arg(long, env = "CNI_IFNAME", default_value = "")]
    pub ifname: String,

    /// Key-value pairs separated by semi-colons
    #[arg(long, env = "CNI_ARGS", value_parser = parse_key_value, default_value = "")]
    pub args: BTreeMap<String, String>,

    /// Colon separated list of directories to search for plugins
    #[arg(long, env = "CNI_PATH", default_value = "")]
    pub paths: String,
}

impl Args {
    pub fn search_paths(&self) -> impl Iterator<Item = &Path> {
        self.paths
            .split(':')
            .filter(|p| !p.is_empty())
            .map(Path::new)
    }

    /// `CNI_ARGS` as passed on to delegated plugins.
    pub fn args_string(&self) -> String {
        self.args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn require_container(&self) -> Result<()> {
        if self.container_id.is_empty() {
            return Err(Error::InvalidRequiredEnvVariables(
                "CNI_CONTAINERID is required".into(),
            ));
        }
        if self.container_id.contains('/') || self.container_id.starts_with('.') {
            return Err(Error::InvalidRequiredEnvVariables(format!(
                "CNI_CONTAINERID {} is not a valid container id",
                self.container_id
            )));
        }
        if self.ifname.is_empty() {
            return Err(Error::InvalidRequiredEnvVariables(
                "CNI_IFNAME is required".into(),
            ));
        }
        Ok(())
    }
}

fn parse_key_value(s: &str) -> Result<BTreeMap<String, String>> {
    let mut kv = BTreeMap::new();

    if s.is_empty() {
        return Ok(kv);
    };

    for split in s.split(';') {
        if let Some((k, v)) = split.split_once('=') {
            kv.insert(k.to_owned(), v.to_owned());
        }
    }

    Ok(kv)
}

fn parse_command(s: &str) -> Result<Command> {
    let cmd = match s {
        "ADD" => Command::Add,
        "DEL" => Command::Delete,
        "CHECK" => Command::Check,
        "STATUS" => Command::Status,
        "VERSION" => Command::Version,
        "GC" => Command::Gc,
        _ => return Err(Error::Parse(format!("command {s} not supported"))),
    };
    Ok(cmd)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Add,
    Delete,
    Check,
    Status,
    Version,
    Gc,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Add => "ADD",
            Command::Delete => "DEL",
            Command::Check => "CHECK",
            Command::Status => "STATUS",
            Command::Version => "VERSION",
            Command::Gc => "GC",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["glue", "--command", "ADD"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("DEL").unwrap(), Command::Delete);
        assert_eq!(parse_command("VERSION").unwrap(), Command::Version);
        let err = parse_command("UPDATE").unwrap_err();
        assert_eq!(err.to_string(), "parse error: command UPDATE not supported");
    }

    #[test]
    fn test_parse_cni_args() {
        let kv = parse_key_value("IgnoreUnknown=1;K8S_POD_NAME=web-0;broken").unwrap();
        assert_eq!(kv.len(), 2);
        assert_eq!(kv["K8S_POD_NAME"], "web-0");
        assert!(parse_key_value("").unwrap().is_empty());
    }

    #[test]
    fn test_args_round_trip_for_delegate() {
        let args = args(&[
            "--container-id",
            "abc",
            "--ifname",
            "eth0",
            "--args",
            "K8S_POD_NAME=web-0;IgnoreUnknown=1",
            "--paths",
            "/opt/cni/bin::/usr/libexec/cni",
        ]);
        assert_eq!(args.args_string(), "IgnoreUnknown=1;K8S_POD_NAME=web-0");
        let paths: Vec<_> = args.search_paths().collect();
        assert_eq!(
            paths,
            vec![Path::new("/opt/cni/bin"), Path::new("/usr/libexec/cni")]
        );
        assert!(args.require_container().is_ok());
    }

    #[test]
    fn test_require_container() {
        assert!(args(&["--ifname", "eth0"]).require_container().is_err());
        assert!(
            args(&["--container-id", "../etc", "--ifname", "eth0"])
                .require_container()
                .is_err()
        );
        assert!(args(&["--container-id", "abc"]).require_container().is_err());
    }
}
