//! Core driver types: identifiers, attachment records, volumes, capabilities
//! and the request/response payloads of the identity, controller and node
//! services.
//!
//! These types form the data model shared by the service traits, the
//! transport layer and the driver implementations.  They are all
//! [`Serialize`]/[`Deserialize`] so they can be transmitted as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::CsiError;

/// Topology segment key under which a node advertises its identity.
pub const TOPOLOGY_KEY_NODE: &str = "topology.klc.csi/node";

/// Publish context key carrying the guest-visible device slot.
pub const PUBLISH_CONTEXT_DEVICE_SLOT: &str = "deviceSlot";

/// Publish context key carrying the guest device path.
pub const PUBLISH_CONTEXT_DEVICE_PATH: &str = "devicePath";

// == Identifiers ==

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
        )]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Caller-supplied volume name; also the key of its attachment record.
    VolumeId
);

string_id!(
    /// Identity of a compute node (the hypervisor domain name).
    NodeId
);

string_id!(
    /// Guest-visible disk name such as `vdb`.
    DeviceSlot
);

impl DeviceSlot {
    /// Device node path inside the guest, e.g. `/dev/vdb`.
    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.0)
    }
}

/// Reject identifiers that are empty or cannot serve as a record key.
///
/// `field` names the request field for the error message.
pub(crate) fn ensure_key(field: &str, value: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{field} missing in request")));
    }
    if value == "." || value == ".." || value.contains('/') || value.contains('\0') {
        return Err(CsiError::InvalidArgument(format!(
            "{field} {value:?} contains characters that are not allowed"
        )));
    }
    Ok(())
}

// == Attachment record ==

/// The durable fact that a volume occupies a device slot on a node.
///
/// At most one record exists per [`VolumeId`], and for a given node every
/// live record carries a distinct [`DeviceSlot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub volume_id: VolumeId,
    pub device_slot: DeviceSlot,
    pub node_id: NodeId,
}

// == Capabilities ==

/// Access mode requested for a volume.  Pool volumes are raw block devices
/// attached to one guest, so only `ReadWriteOnce` is meaningful.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// One node, read-write.
    ReadWriteOnce,
    /// Many nodes, read-only.
    ReadOnlyMany,
    /// Many nodes, read-write.
    ReadWriteMany,
}

/// How a published volume is presented at its target path.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// The device's filesystem is mounted on a target directory.
    #[default]
    Mount,
    /// The raw device node is bound onto a target file.
    Block,
}

/// A capability a caller requires from a volume.  Echoed, never negotiated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    #[serde(default)]
    pub access_type: AccessType,
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Filesystem type expected on the device.  Ignored for block access.
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
}

fn default_fs_type() -> String {
    "ext4".to_owned()
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: AccessType::Mount,
            mount_flags: Vec::new(),
            fs_type: default_fs_type(),
        }
    }
}

// == Volumes ==

/// A provisioned volume as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: VolumeId,
    /// Size of the pool volume.
    pub capacity_bytes: u64,
    /// Carries the host device path of the pool volume.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Key-value topology segments, keyed by [`TOPOLOGY_KEY_NODE`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"topology.klc.csi/node": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

/// Health of a volume as seen by the driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCondition {
    pub abnormal: bool,
    pub message: String,
}

impl VolumeCondition {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            abnormal: false,
            message: message.into(),
        }
    }
}

/// Attachment status of a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStatus {
    /// Nodes the volume is published to; at most one in this driver.
    #[serde(default)]
    pub published_node_ids: Vec<NodeId>,
    pub volume_condition: VolumeCondition,
}

/// One row of `ListVolumes` / the result of `ControllerGetVolume`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeEntry {
    pub volume: Volume,
    pub status: VolumeStatus,
}

// == Controller requests ==

/// `CreateVolume` input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Caller-supplied name; becomes the volume ID.
    pub name: String,
    /// Desired capacity in bytes.  Pool volumes have a fixed size, so this
    /// is informational only.
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Arbitrary parameters from the storage class.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to attach a volume to a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: NodeId,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to detach a volume from a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: NodeId,
}

/// Request to validate capabilities against a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Echo of the inputs that were confirmed by `ValidateVolumeCapabilities`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmedCapabilities {
    pub volume_context: HashMap<String, String>,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: HashMap<String, String>,
}

/// Request to snapshot a volume.  Always rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    pub source_volume_id: VolumeId,
}

/// Request to grow a volume.  Always rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpandVolumeRequest {
    pub volume_id: VolumeId,
    pub capacity_bytes: u64,
    /// Only set for node-side expansion.
    #[serde(default)]
    pub volume_path: Option<String>,
}

// == Node requests ==

/// Request to stage a volume.  Staging is a no-op in this driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: VolumeId,
    pub staging_target_path: String,
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
}

/// Request to mount a published volume's device at a target path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: VolumeId,
    /// Path the device is mounted at, e.g.
    /// `/var/lib/kubelet/pods/<pod-uid>/volumes/<vol-name>`.
    pub target_path: String,
    /// Context returned by `ControllerPublishVolume`.
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
    #[serde(default)]
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub read_only: bool,
}

// == Identity and node info ==

/// Result of `GetPluginInfo`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin name, `"kvm-lvm-csi"`.
    pub name: String,
    /// Crate version.
    pub vendor_version: String,
}

/// Capabilities advertised by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    ControllerService,
    /// Volumes are only reachable from the node they are published to.
    VolumeAccessibilityConstraints,
}

/// Capabilities advertised by the controller service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    GetVolume,
    GetCapacity,
    ListVolumes,
    VolumeCondition,
}

/// Capabilities advertised by the node service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    ExpandVolume,
    VolumeCondition,
}

/// Information about the node on which the node service runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Hypervisor domain name of the node.
    pub node_id: String,
    /// Size of the device slot alphabet.
    pub max_volumes: u64,
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

/// Byte usage of a published volume path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// Result of `NodeGetVolumeStats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStats {
    pub usage: VolumeUsage,
    pub condition: VolumeCondition,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("data1".into());
        assert_eq!(id.to_string(), "data1");
    }

    #[test]
    fn publish_requests_default_to_empty_ids() {
        let req = ControllerPublishVolumeRequest {
            volume_id: "data1".into(),
            ..Default::default()
        };
        assert_eq!(req.node_id, NodeId::default());
        assert!(req.node_id.as_str().is_empty());
        let req = NodePublishVolumeRequest::default();
        assert!(req.volume_id.as_str().is_empty());
    }

    #[test]
    fn device_slot_path() {
        assert_eq!(DeviceSlot::from("vdb").device_path(), "/dev/vdb");
    }

    #[test]
    fn ensure_key_rejects_unusable_ids() {
        assert!(ensure_key("volume_id", "data1").is_ok());
        assert!(matches!(
            ensure_key("volume_id", ""),
            Err(CsiError::InvalidArgument(_))
        ));
        assert!(ensure_key("volume_id", "..").is_err());
        assert!(ensure_key("volume_id", "a/b").is_err());
        assert!(ensure_key("node_id", "nul\0").is_err());
    }

    #[test]
    fn create_volume_request_defaults() {
        let req: CreateVolumeRequest = serde_json::from_str(r#"{"name":"x"}"#).expect("parse");
        assert_eq!(req.name, "x");
        assert_eq!(req.capacity_bytes, 0);
        assert!(req.parameters.is_empty());
    }

    #[test]
    fn volume_capability_default() {
        let cap = VolumeCapability::default();
        assert_eq!(cap.access_mode, AccessMode::ReadWriteOnce);
        assert_eq!(cap.fs_type, "ext4");
    }
}
