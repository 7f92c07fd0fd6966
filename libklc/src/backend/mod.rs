//! Storage pool backends.
//!
//! A [`StorageBackend`] owns the pool volumes themselves.  It knows nothing
//! about nodes or device slots; those belong to the
//! [`Registry`](crate::registry::Registry).

pub mod lvm;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::VolumeId;

pub use lvm::LvmBackend;

/// A volume as it exists in the storage pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolVolume {
    /// Driver-level volume ID (the pool name without its prefix).
    pub volume_id: VolumeId,
    /// Name of the volume inside the pool.
    pub pool_name: String,
    /// Pool (volume group) the volume lives in.
    pub pool: String,
    pub size_bytes: u64,
}

impl PoolVolume {
    /// Host path of the block device backing this volume.
    pub fn device_path(&self) -> String {
        format!("/dev/{}/{}", self.pool, self.pool_name)
    }
}

/// Create / query / delete operations against the storage pool.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// The pool volume `volume_id` maps to under the naming convention,
    /// whether or not it exists.
    fn identity(&self, volume_id: &VolumeId) -> PoolVolume;

    /// Look up an existing pool volume.
    ///
    /// Fails with [`CsiError::VolumeNotFound`] when absent and
    /// [`CsiError::Internal`] when the inventory cannot be decoded.
    async fn find(&self, volume_id: &VolumeId) -> Result<PoolVolume, CsiError>;

    /// Every pool volume owned by this driver.
    async fn list(&self) -> Result<Vec<PoolVolume>, CsiError>;

    /// Create a new pool volume of the configured size.
    async fn create(&self, volume_id: &VolumeId) -> Result<PoolVolume, CsiError>;

    /// Force-remove a pool volume.  An already absent volume is success.
    async fn delete(&self, volume: &PoolVolume) -> Result<(), CsiError>;
}
