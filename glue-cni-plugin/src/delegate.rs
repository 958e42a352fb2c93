use std::io::Write;
use std::path::PathBuf;
use std::process::{Command as Process, Stdio};

use tracing::{debug, info};

use crate::config::{Args, Command};
use crate::response::{CniErrorResponse, Success};
use crate::{Error, Result};

/// Runs another CNI plugin on behalf of this one.
pub trait DelegateInvoker {
    fn add(&self, plugin: &str, conf: &[u8]) -> Result<Success>;
    fn delete(&self, plugin: &str, conf: &[u8]) -> Result<()>;
    fn check(&self, plugin: &str, conf: &[u8]) -> Result<()>;
}

/// Executes the delegate binary found in `CNI_PATH`, forwarding the runtime's
/// environment with the command replaced.
pub struct ExecDelegate<'a> {
    args: &'a Args,
}

impl<'a> ExecDelegate<'a> {
    pub fn new(args: &'a Args) -> Self {
        Self { args }
    }

    fn find(&self, plugin: &str) -> Result<PathBuf> {
        if plugin.is_empty() || plugin.contains('/') {
            return Err(Error::InvalidNetworkConfig(format!(
                "invalid delegate plugin name {plugin:?}"
            )));
        }
        self.args
            .search_paths()
            .map(|dir| dir.join(plugin))
            .find(|path| path.is_file())
            .ok_or_else(|| Error::DelegateExec {
                plugin: plugin.into(),
                reason: format!("not found in CNI_PATH {}", self.args.paths),
            })
    }

    fn exec(&self, command: Command, plugin: &str, conf: &[u8]) -> Result<Vec<u8>> {
        let path = self.find(plugin)?;
        info!(plugin = %path.display(), command = command.as_str(), "invoking delegate");

        let mut process = Process::new(&path);
        process
            .env("CNI_COMMAND", command.as_str())
            .env("CNI_CONTAINERID", &self.args.container_id)
            .env("CNI_IFNAME", &self.args.ifname)
            .env("CNI_ARGS", self.args.args_string())
            .env("CNI_PATH", &self.args.paths)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match &self.args.net_ns {
            Some(netns) => process.env("CNI_NETNS", netns),
            None => process.env_remove("CNI_NETNS"),
        };

        let exec_err = |e: std::io::Error| Error::DelegateExec {
            plugin: plugin.into(),
            reason: e.to_string(),
        };
        let mut child = process.spawn().map_err(exec_err)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(conf).map_err(exec_err)?;
        }
        let output = child.wait_with_output().map_err(exec_err)?;

        if output.status.success() {
            return Ok(output.stdout);
        }
        debug!(
            stderr = %String::from_utf8_lossy(&output.stderr),
            "delegate exited with {}", output.status
        );
        Err(delegate_error(plugin, &output.stdout, &output.stderr))
    }
}

/// Turns a failed delegate's output into an error, keeping the delegate's own
/// CNI error when it printed one.
fn delegate_error(plugin: &str, stdout: &[u8], stderr: &[u8]) -> Error {
    match serde_json::from_slice::<CniErrorResponse>(stdout) {
        Ok(err) => Error::Delegate {
            code: err.code,
            msg: err.msg,
            details: err.details,
        },
        Err(_) => {
            let out = if stderr.is_empty() { stdout } else { stderr };
            Error::DelegateExec {
                plugin: plugin.into(),
                reason: String::from_utf8_lossy(out).trim().to_owned(),
            }
        }
    }
}

impl DelegateInvoker for ExecDelegate<'_> {
    fn add(&self, plugin: &str, conf: &[u8]) -> Result<Success> {
        let out = self.exec(Command::Add, plugin, conf)?;
        serde_json::from_slice(&out).map_err(|e| Error::DelegateExec {
            plugin: plugin.into(),
            reason: format!("invalid result: {e}"),
        })
    }

    fn delete(&self, plugin: &str, conf: &[u8]) -> Result<()> {
        self.exec(Command::Delete, plugin, conf).map(|_| ())
    }

    fn check(&self, plugin: &str, conf: &[u8]) -> Result<()> {
        self.exec(Command::Check, plugin, conf).map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_delegate_error_from_cni_error() {
        let stdout = br#"{"cniVersion":"1.0.0","code":11,"msg":"failed to allocate for range 0","details":"no IP addresses available"}"#;
        let err = delegate_error("macvlan", stdout, b"");
        let Error::Delegate { code, msg, details } = err else {
            panic!("expected delegate error, got {err:?}");
        };
        assert_eq!(code, 11);
        assert_eq!(msg, "failed to allocate for range 0");
        assert_eq!(details, "no IP addresses available");
    }

    #[test]
    fn test_delegate_error_without_cni_error() {
        let err = delegate_error("ipvlan", b"", b"panic: runtime error\n");
        let Error::DelegateExec { plugin, reason } = err else {
            panic!("expected exec error, got {err:?}");
        };
        assert_eq!(plugin, "ipvlan");
        assert_eq!(reason, "panic: runtime error");
    }

    #[test]
    fn test_missing_delegate_binary() {
        use clap::Parser;

        let dir = tempfile::tempdir().unwrap();
        let paths = dir.path().display().to_string();
        let args = Args::try_parse_from([
            "glue",
            "--command",
            "ADD",
            "--paths",
            paths.as_str(),
        ])
        .unwrap();
        let delegate = ExecDelegate::new(&args);
        assert!(matches!(
            delegate.delete("macvlan", b"{}"),
            Err(Error::DelegateExec { .. })
        ));
        assert!(matches!(
            delegate.delete("../macvlan", b"{}"),
            Err(Error::InvalidNetworkConfig(_))
        ));
    }
}
