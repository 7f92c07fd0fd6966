//! Hypervisor disk attachment.
//!
//! A [`Hypervisor`] exposes pool volumes to a node's guest under a device
//! slot name.  Both operations classify "already in the requested state" as
//! success so that retried publish/unpublish requests converge.

pub mod virsh;

use async_trait::async_trait;

use crate::backend::PoolVolume;
use crate::error::CsiError;
use crate::types::{DeviceSlot, NodeId};

pub use virsh::VirshHypervisor;

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Attach `volume` to the guest `node_id` as `slot`.
    ///
    /// Succeeds if that exact volume is already attached at that slot.
    async fn attach(
        &self,
        volume: &PoolVolume,
        node_id: &NodeId,
        slot: &DeviceSlot,
    ) -> Result<(), CsiError>;

    /// Detach `volume` from the guest `node_id`.
    ///
    /// Succeeds if the volume is not attached to the guest.
    async fn detach(&self, volume: &PoolVolume, node_id: &NodeId) -> Result<(), CsiError>;
}
