//! Volume lifecycle as seen by the cluster orchestrator.
//!
//! The Controller service manages the centralized volume lifecycle:
//! provisioning pool volumes and attaching them to compute nodes.  Every
//! mutating operation must be idempotent because the orchestrator retries
//! failed calls.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ConfirmedCapabilities, ControllerCapability, ControllerPublishVolumeRequest,
    ControllerUnpublishVolumeRequest, CreateSnapshotRequest, CreateVolumeRequest,
    ExpandVolumeRequest, ValidateVolumeCapabilitiesRequest, Volume, VolumeEntry, VolumeId,
};

/// Publish context returned by `ControllerPublishVolume` and forwarded to
/// `NodePublishVolume`.
pub type PublishContext = std::collections::HashMap<String, String>;

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a volume, or return the existing one with the same name.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a volume.  Deleting an absent volume succeeds.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Attach a volume to a node, assigning it a device slot there.
    async fn publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, CsiError>;

    /// Detach a volume from a node and release its device slot.
    async fn unpublish_volume(&self, req: ControllerUnpublishVolumeRequest)
    -> Result<(), CsiError>;

    /// Confirm the requested capabilities by echoing them back.
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ConfirmedCapabilities, CsiError>;

    /// List all volumes known to this controller with their attachment status.
    async fn list_volumes(&self) -> Result<Vec<VolumeEntry>, CsiError>;

    /// Report one volume with its attachment status.
    async fn get_volume(&self, volume_id: &VolumeId) -> Result<VolumeEntry, CsiError>;

    /// The configured capacity ceiling reported to the orchestrator.
    async fn get_capacity(&self) -> Result<u64, CsiError>;

    /// Advertise the controller RPCs this driver implements.
    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;

    /// Snapshots are not supported.
    async fn create_snapshot(&self, _req: CreateSnapshotRequest) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("CreateSnapshot"))
    }

    /// Snapshots are not supported.
    async fn delete_snapshot(&self, _snapshot_id: &str) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("DeleteSnapshot"))
    }

    /// Snapshots are not supported.
    async fn list_snapshots(&self) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("ListSnapshots"))
    }

    /// Online expansion is not supported.
    async fn expand_volume(&self, _req: ExpandVolumeRequest) -> Result<u64, CsiError> {
        Err(CsiError::unimplemented("ControllerExpandVolume"))
    }
}
