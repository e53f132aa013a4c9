//! Volume lifecycle surface of the node plugin.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::CatalogProvider;
use crate::catalog::grpc::GrpcCatalogPool;
use crate::config::{DriverConfig, KEY_DATA_SOURCE, StageParams};
use crate::error::NodeError;
use crate::locationdb::{LocationDb, SqliteLocationDb};
use crate::mount::{BoltMounter, Mounter, is_likely_not_mount_point};
use crate::stage::{self, Stager};

pub const DRIVER_NAME_CSI: &str = "kubernetes.io~csi";
pub const DRIVER_NAME_ALLUXIO_FUSE: &str = "qiniu.com~alluxiofuse";
pub const DATA_SOURCE_ALLUXIO_FUSE: &str = "alluxio-fuse";
pub const DATA_SOURCE_GLOBAL_VOLUME: &str = "global-volume";
pub const GLOBAL_VOLUME_ROOT: &str = "/global-volume";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessType {
    Mount {
        fs_type: String,
        mount_flags: Vec<String>,
    },
    Block,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_type: AccessType,
}

impl VolumeCapability {
    pub fn mount() -> Self {
        VolumeCapability {
            access_type: AccessType::Mount {
                fs_type: String::new(),
                mount_flags: Vec::new(),
            },
        }
    }

    pub fn block() -> Self {
        VolumeCapability {
            access_type: AccessType::Block,
        }
    }

    pub fn is_mount(&self) -> bool {
        matches!(self.access_type, AccessType::Mount { .. })
    }
}

#[derive(Clone, Debug, Default)]
pub struct StageRequest {
    pub volume_id: String,
    pub staging_path: PathBuf,
    pub capability: Option<VolumeCapability>,
    pub volume_context: HashMap<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct UnstageRequest {
    pub volume_id: String,
    pub staging_path: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct PublishRequest {
    pub volume_id: String,
    pub staging_path: PathBuf,
    pub target_path: PathBuf,
    pub capability: Option<VolumeCapability>,
    pub volume_context: HashMap<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct UnpublishRequest {
    pub volume_id: String,
    pub target_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NodeCapability {
    StageUnstageVolume,
}

pub struct NodeServer {
    node_id: String,
    stager: Stager,
    mounter: Arc<dyn Mounter>,
}

impl NodeServer {
    pub fn new(
        config: &DriverConfig,
        catalogs: Arc<dyn CatalogProvider>,
        db: Arc<dyn LocationDb>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        NodeServer {
            node_id: config.node_id.clone(),
            stager: Stager::new(catalogs, db).with_wait_timeout(config.stage_wait_timeout),
            mounter,
        }
    }

    /// Node server backed by the gRPC catalog, SQLite databases and `bolt-mount`.
    pub fn from_config(config: &DriverConfig) -> Self {
        info!("driver {} version {}", config.name, config.version);
        Self::new(
            config,
            Arc::new(GrpcCatalogPool::new(config.dial_timeout)),
            Arc::new(SqliteLocationDb::new()),
            Arc::new(BoltMounter),
        )
    }

    pub fn stager(&self) -> &Stager {
        &self.stager
    }

    pub async fn stage(&self, req: StageRequest) -> Result<(), NodeError> {
        require(&req.volume_id, "Volume ID missing in request")?;
        require_path(&req.staging_path, "Staging target path missing in request")?;
        if req.capability.is_none() {
            return Err(NodeError::InvalidArgument(
                "Volume Capability missing in request".to_string(),
            ));
        }
        let params = StageParams::from_context(&req.volume_context)?;

        self.stager
            .stage(&req.volume_id, &req.staging_path, params)
            .await?;
        Ok(())
    }

    /// Removes the staged artifacts. Only called once no target uses them.
    pub async fn unstage(&self, req: UnstageRequest) -> Result<(), NodeError> {
        require(&req.volume_id, "Volume ID missing in request")?;
        require_path(&req.staging_path, "Staging target path missing in request")?;

        ignore_not_found(tokio::fs::remove_file(stage::db_path(&req.staging_path)).await)?;
        ignore_not_found(tokio::fs::remove_dir_all(stage::index_dir(&req.staging_path)).await)?;
        info!("dataset volume {} has been unstaged", req.volume_id);
        Ok(())
    }

    pub async fn publish(&self, req: PublishRequest) -> Result<(), NodeError> {
        let Some(capability) = &req.capability else {
            return Err(NodeError::InvalidArgument(
                "Volume capability missing in request".to_string(),
            ));
        };
        require(&req.volume_id, "Volume ID missing in request")?;
        require_path(&req.target_path, "Target path missing in request")?;
        require_path(&req.staging_path, "Staging target path missing in request")?;
        if !capability.is_mount() {
            return Err(NodeError::InvalidArgument(
                "Cap without mount access type".to_string(),
            ));
        }

        let target = &req.target_path;
        let not_mounted = match is_likely_not_mount_point(target).await {
            Ok(not_mounted) => not_mounted,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o750)
                    .create(target)
                    .await?;
                true
            }
            Err(e) => return Err(e.into()),
        };
        if !not_mounted {
            debug!("{} is already mounted", target.display());
            return Ok(());
        }

        let source = req.volume_context.get(KEY_DATA_SOURCE).map(String::as_str);
        let data_root = resolve_data_root(source, target)?;
        self.mounter
            .mount(&stage::db_path(&req.staging_path), &data_root, target)
            .await?;
        info!("dataset volume {} has been mounted", req.volume_id);
        Ok(())
    }

    pub async fn unpublish(&self, req: UnpublishRequest) -> Result<(), NodeError> {
        require(&req.volume_id, "Volume ID missing in request")?;
        require_path(&req.target_path, "Target path missing in request")?;

        self.mounter.unmount(&req.target_path).await?;
        info!("dataset volume {} has been unmounted", req.volume_id);
        Ok(())
    }

    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id.clone(),
        }
    }

    pub fn capabilities(&self) -> Vec<NodeCapability> {
        vec![NodeCapability::StageUnstageVolume]
    }

    pub fn volume_stats(&self, _volume_id: &str) -> Result<(), NodeError> {
        Err(NodeError::Unimplemented("NodeGetVolumeStats"))
    }

    pub fn expand_volume(&self, _volume_id: &str) -> Result<(), NodeError> {
        Err(NodeError::Unimplemented("NodeExpandVolume"))
    }

    pub fn shutdown(&self) {
        self.stager.shutdown();
    }
}

/// Where the files listed in a dataset database live on this node.
pub fn resolve_data_root(source: Option<&str>, target: &Path) -> Result<PathBuf, NodeError> {
    match source {
        Some(DATA_SOURCE_ALLUXIO_FUSE) => {
            // the fuse driver mounts next to the csi volumes of the same pod
            let target = target.to_string_lossy();
            let n = target.find(DRIVER_NAME_CSI).ok_or_else(|| {
                NodeError::Internal(format!("unexpected target path {target}"))
            })?;
            Ok(PathBuf::from(common::path::join([
                &target[..n],
                DRIVER_NAME_ALLUXIO_FUSE,
            ])))
        }
        Some(DATA_SOURCE_GLOBAL_VOLUME) => Ok(PathBuf::from(GLOBAL_VOLUME_ROOT)),
        Some(other) if !other.is_empty() => Err(NodeError::InvalidArgument(format!(
            "unknown data source {other}"
        ))),
        _ => Err(NodeError::InvalidArgument("empty data source".to_string())),
    }
}

fn require(value: &str, msg: &str) -> Result<(), NodeError> {
    if value.is_empty() {
        return Err(NodeError::InvalidArgument(msg.to_string()));
    }
    Ok(())
}

fn require_path(path: &Path, msg: &str) -> Result<(), NodeError> {
    if path.as_os_str().is_empty() {
        return Err(NodeError::InvalidArgument(msg.to_string()));
    }
    Ok(())
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_resolve_data_root() {
        let target = Path::new(
            "/var/lib/kubelet/pods/b1c2/volumes/kubernetes.io~csi/pvc-1/mount",
        );
        assert_eq!(
            resolve_data_root(Some("alluxio-fuse"), target).unwrap(),
            PathBuf::from("/var/lib/kubelet/pods/b1c2/volumes/qiniu.com~alluxiofuse")
        );
        assert_eq!(
            resolve_data_root(Some("global-volume"), target).unwrap(),
            PathBuf::from("/global-volume")
        );

        let err = resolve_data_root(Some("alluxio-fuse"), Path::new("/mnt/x")).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(
            resolve_data_root(None, target).unwrap_err().code(),
            Code::InvalidArgument
        );
        assert_eq!(
            resolve_data_root(Some("nfs"), target).unwrap_err().code(),
            Code::InvalidArgument
        );
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(io::ErrorKind::NotFound.into())).is_ok());
        assert!(ignore_not_found(Err(io::ErrorKind::PermissionDenied.into())).is_err());
    }
}
