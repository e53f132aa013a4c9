use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::MountError;

pub const BOLT_MOUNT: &str = "bolt-mount";
pub const FUSERMOUNT: &str = "fusermount";

/// Serves a staged database on a target directory.
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(
        &self,
        db_path: &Path,
        data_root: &Path,
        target: &Path,
    ) -> Result<(), MountError>;

    async fn unmount(&self, target: &Path) -> Result<(), MountError>;
}

/// Mounts through the `bolt-mount` FUSE daemon.
#[derive(Clone, Debug, Default)]
pub struct BoltMounter;

impl BoltMounter {
    async fn run(program: &'static str, cmd: &mut Command) -> Result<(), MountError> {
        let output = cmd
            .output()
            .await
            .map_err(|source| MountError::Spawn { program, source })?;
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(MountError::Failed {
                program,
                status: output.status,
                output: combined.trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Mounter for BoltMounter {
    async fn mount(
        &self,
        db_path: &Path,
        data_root: &Path,
        target: &Path,
    ) -> Result<(), MountError> {
        let mut cmd = Command::new(BOLT_MOUNT);
        cmd.arg("-d")
            .arg("--dbpath")
            .arg(db_path)
            .arg("--rootpath")
            .arg(data_root)
            .arg("--mountpoint")
            .arg(target);
        debug!("running {cmd:?}");
        Self::run(BOLT_MOUNT, &mut cmd).await?;
        info!("mounted {} on {}", db_path.display(), target.display());
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        let mut cmd = Command::new(FUSERMOUNT);
        cmd.arg("-u").arg(target);
        Self::run(FUSERMOUNT, &mut cmd).await?;
        info!("unmounted {}", target.display());
        Ok(())
    }
}

/// `Ok(false)` when `path` sits on another device than its parent.
///
/// Bind mounts of the same device are not detected.
pub async fn is_likely_not_mount_point(path: &Path) -> io::Result<bool> {
    let stat = tokio::fs::metadata(path).await?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        // the root directory is always a mount point
        _ => return Ok(false),
    };
    let parent_stat = tokio::fs::symlink_metadata(parent).await?;
    Ok(stat.dev() == parent_stat.dev())
}
