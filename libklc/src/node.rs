//! Per-node volume operations.
//!
//! The Node service runs on each compute node and makes a published
//! volume's guest device available at a target path:
//!
//! 1. **Stage**: no-op; this driver publishes directly.
//! 2. **Publish**: bind the device node of the volume's slot at the target.
//! 3. **Unpublish**: unmount the target and remove it.
//! 4. **Unstage**: no-op.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ExpandVolumeRequest, NodeCapability, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, VolumeId, VolumeStats,
};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume.  Always succeeds without side effects.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume.  Always succeeds without side effects.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind its device at `target_path`.
    ///
    /// This is idempotent: calling it again for the same `target_path` should
    /// succeed without remounting.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount `target_path` and remove it.
    ///
    /// This is idempotent; a path that never existed is success.
    async fn unpublish_volume(&self, target_path: &str) -> Result<(), CsiError>;

    /// Identity, slot limit and topology of this node.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    /// Advertise the node RPCs this driver implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Usage and condition of a published volume path.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    /// Online expansion is not supported.
    async fn expand_volume(&self, _req: ExpandVolumeRequest) -> Result<u64, CsiError> {
        Err(CsiError::unimplemented("NodeExpandVolume"))
    }
}
