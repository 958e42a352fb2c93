use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::Result;

/// A file installed on the host on start, typically the plugin binary and
/// its network configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyPair {
    pub src: PathBuf,
    pub dst: PathBuf,
}

/// Parses comma separated `src:dst` pairs. Malformed pairs are skipped.
pub fn parse_copy_pairs(spec: &str) -> Vec<CopyPair> {
    spec.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let parts: Vec<&str> = pair.split(':').collect();
            match parts.as_slice() {
                [src, dst] if !src.is_empty() && !dst.is_empty() => Some(CopyPair {
                    src: PathBuf::from(src),
                    dst: PathBuf::from(dst),
                }),
                _ => {
                    warn!(pair, "invalid copy pair, skipping");
                    None
                }
            }
        })
        .collect()
}

/// Copies every pair, replacing any existing destination. Failures are
/// logged and do not stop the remaining copies. Returns the destinations to
/// remove on teardown.
pub fn copy_on_boot(pairs: &[CopyPair]) -> Vec<PathBuf> {
    for pair in pairs {
        if let Err(e) = install_file(&pair.src, &pair.dst) {
            error!(
                %e,
                src = %pair.src.display(),
                dst = %pair.dst.display(),
                "failed to copy file on boot"
            );
        }
    }
    pairs.iter().map(|p| p.dst.clone()).collect()
}

fn install_file(src: &Path, dst: &Path) -> Result<()> {
    info!(src = %src.display(), dst = %dst.display(), "copying file");
    remove_file(dst)?;
    fs::copy(src, dst)?;
    let permissions = fs::Permissions::from_mode(0o755);
    fs::set_permissions(dst, permissions)?;
    Ok(())
}

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Removes files installed on boot. Every path is attempted and the last
/// failure is returned.
pub fn remove_copied(paths: &[PathBuf]) -> Result<()> {
    let mut result = Ok(());
    for path in paths {
        if let Err(e) = remove_file(path) {
            warn!(%e, path = %path.display(), "failed to remove copied file");
            result = Err(e);
        }
    }
    result
}
