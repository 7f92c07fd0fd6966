//! Node mount manager.
//!
//! Runs on a compute node.  It reads the attachment record written by the
//! controller to find the guest device of a volume, then mounts its
//! filesystem on a target directory, or binds the raw device onto a target
//! file for block access.  It does not take the controller's lock:
//! every operation is idempotent on its own.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::mount::Mounter;
use crate::node::CsiNode;
use crate::registry::Registry;
use crate::types::*;

/// The node-side driver.
pub struct NodeService {
    node_id: NodeId,
    registry: Arc<Registry>,
    mounter: Arc<dyn Mounter>,
}

impl NodeService {
    /// `node_id` may be empty, in which case records are not checked for
    /// ownership and `NodeGetInfo` fails.
    pub fn new(node_id: NodeId, registry: Arc<Registry>, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            node_id,
            registry,
            mounter,
        }
    }

    /// The record of `volume_id`, which must be published to this node.
    async fn local_record(&self, volume_id: &VolumeId) -> Result<AttachmentRecord, CsiError> {
        let record = match self.registry.get(volume_id).await {
            Ok(record) => record,
            Err(CsiError::RecordNotFound(_)) => {
                return Err(CsiError::Unavailable(format!(
                    "volume {volume_id} is not published to any node"
                )));
            }
            Err(e) => return Err(e),
        };
        if !self.node_id.as_str().is_empty() && record.node_id != self.node_id {
            return Err(CsiError::Unavailable(format!(
                "volume {volume_id} is published to node {}, not {}",
                record.node_id, self.node_id
            )));
        }
        Ok(record)
    }
}

fn require_path<'a>(field: &str, path: &'a str) -> Result<&'a Path, CsiError> {
    if path.is_empty() {
        return Err(CsiError::InvalidArgument(format!(
            "{field} missing in request"
        )));
    }
    Ok(Path::new(path))
}

fn mount_err(target: &Path, reason: String) -> CsiError {
    CsiError::MountFailed {
        path: target.display().to_string(),
        reason,
    }
}

/// Ensure `target` is a directory a filesystem can be mounted on.
async fn prepare_mount_target(target: &Path) -> Result<(), CsiError> {
    match tokio::fs::metadata(target).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(mount_err(target, "target is not a directory".into())),
        Err(e) if e.kind() == ErrorKind::NotFound => tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| mount_err(target, format!("create target: {e}"))),
        Err(e) => Err(mount_err(target, e.to_string())),
    }
}

/// Ensure `target` is a non-directory a device node can be bound onto,
/// creating an empty file when absent.
async fn prepare_block_target(target: &Path) -> Result<(), CsiError> {
    match tokio::fs::metadata(target).await {
        Ok(meta) if meta.is_dir() => {
            return Err(mount_err(
                target,
                "block target is a directory".into(),
            ));
        }
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(mount_err(target, e.to_string())),
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| mount_err(target, format!("create {}: {e}", parent.display())))?;
    }
    tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(target)
        .await
        .map_err(|e| mount_err(target, format!("create target: {e}")))?;
    Ok(())
}

/// Remove `target` whether it is a file or a directory tree.
async fn remove_target(target: &Path) -> Result<(), CsiError> {
    let remove_err = |e: std::io::Error| CsiError::UnmountFailed {
        path: target.display().to_string(),
        reason: format!("remove target: {e}"),
    };
    let meta = match tokio::fs::symlink_metadata(target).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(remove_err(e)),
    };
    let removed = if meta.is_dir() {
        tokio::fs::remove_dir_all(target).await
    } else {
        tokio::fs::remove_file(target).await
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(remove_err(e)),
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for NodeService {
    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(tokio::fs::try_exists(self.registry.root())
            .await
            .unwrap_or(false))
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::VolumeAccessibilityConstraints])
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for NodeService {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        debug!(volume_id = %req.volume_id, "stage is a no-op");
        Ok(())
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        _staging_target_path: &str,
    ) -> Result<(), CsiError> {
        debug!(%volume_id, "unstage is a no-op");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        ensure_key("volume_id", req.volume_id.as_str())?;
        let target = require_path("target_path", &req.target_path)?;

        let record = self.local_record(&req.volume_id).await?;
        if self.mounter.is_mount_point(target).await? {
            debug!("target already mounted");
            return Ok(());
        }

        let device = record.device_slot.device_path();
        let capability = &req.volume_capability;
        match capability.access_type {
            AccessType::Block => {
                prepare_block_target(target).await?;
                self.mounter
                    .bind_mount(&device, target, req.read_only)
                    .await?;
            }
            AccessType::Mount => {
                prepare_mount_target(target).await?;
                // mount(2) does not probe filesystems.
                let fs_type = match capability.fs_type.as_str() {
                    "" => "ext4",
                    fs_type => fs_type,
                };
                let mut options = capability.mount_flags.clone();
                if req.read_only {
                    options.push("ro".to_owned());
                }
                self.mounter
                    .mount(&device, target, fs_type, &options)
                    .await?;
            }
        }
        info!(%device, access = ?capability.access_type, "volume mounted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(&self, target_path: &str) -> Result<(), CsiError> {
        let target = require_path("target_path", target_path)?;

        if self.mounter.is_mount_point(target).await? {
            self.mounter.unmount(target).await?;
            info!("volume unmounted");
        } else {
            debug!("target not mounted");
        }
        remove_target(target).await
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        if self.node_id.as_str().is_empty() {
            return Err(CsiError::Internal("node id is not configured".into()));
        }
        Ok(NodeInfo {
            node_id: self.node_id.to_string(),
            max_volumes: self.registry.alphabet().len() as u64,
            accessible_topology: Some(Topology {
                segments: HashMap::from([(
                    TOPOLOGY_KEY_NODE.to_owned(),
                    self.node_id.to_string(),
                )]),
            }),
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![
            NodeCapability::StageUnstageVolume,
            NodeCapability::ExpandVolume,
            NodeCapability::VolumeCondition,
        ])
    }

    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        ensure_key("volume_id", volume_id.as_str())?;
        let path = require_path("volume_path", volume_path)?;
        match tokio::fs::try_exists(path).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(CsiError::VolumeNotFound(format!(
                    "{volume_id} at {volume_path}"
                )));
            }
            Err(e) => return Err(CsiError::Internal(format!("stat {volume_path}: {e}"))),
        }

        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|e| CsiError::Internal(format!("statvfs {volume_path}: {e}")))?;
        let block = stat.fragment_size();
        let total_bytes = block * stat.blocks();
        let available_bytes = block * stat.blocks_available();
        let used_bytes = total_bytes.saturating_sub(block * stat.blocks_free());

        Ok(VolumeStats {
            usage: VolumeUsage {
                available_bytes,
                used_bytes,
                total_bytes,
            },
            condition: VolumeCondition::healthy("ok"),
        })
    }
}
