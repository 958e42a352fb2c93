use std::fmt::{self, Display};
use std::process::Command;

use tracing::debug;

/// A host command that could not be run or exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub cmd: String,
    pub stderr: String,
}

impl CommandFailure {
    /// True when the command failed because the object it targets does not exist.
    pub fn is_not_found(&self) -> bool {
        let stderr = self.stderr.to_lowercase();
        [
            "cannot find device",
            "does not exist",
            "no such file or directory",
            "no chain/target/match by that name",
            "bad rule (does a matching rule exist",
            "cannot find specified qdisc",
            "filter with specified priority/protocol not found",
        ]
        .iter()
        .any(|needle| stderr.contains(needle))
    }
}

impl Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`: {}", self.cmd, self.stderr.trim())
    }
}

/// Runs `program` with `args` and returns its stdout.
pub fn run<S: AsRef<str>>(program: &str, args: &[S]) -> Result<String, CommandFailure> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    let cmd = format!("{program} {}", args.join(" "));
    debug!(%cmd, "running");

    let output = Command::new(program)
        .args(&args)
        .output()
        .map_err(|e| CommandFailure {
            cmd: cmd.clone(),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(CommandFailure {
            cmd,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_not_found() {
        let failure = CommandFailure {
            cmd: "tc qdisc show dev enp9s0".into(),
            stderr: "Cannot find device \"enp9s0\"\n".into(),
        };
        assert!(failure.is_not_found());
        assert_eq!(
            failure.to_string(),
            "`tc qdisc show dev enp9s0`: Cannot find device \"enp9s0\""
        );

        let failure = CommandFailure {
            cmd: "iptables -w -t nat -F GLUE-PREROUTING".into(),
            stderr: "iptables: Permission denied (you must be root).".into(),
        };
        assert!(!failure.is_not_found());
    }

    #[test]
    fn test_missing_program() {
        let err = run("glue-test-program-that-does-not-exist", &["--help"]).unwrap_err();
        assert!(err.cmd.starts_with("glue-test-program-that-does-not-exist"));
        assert!(!err.stderr.is_empty());
    }
}
