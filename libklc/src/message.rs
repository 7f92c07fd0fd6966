//! Request/response envelope carried by the socket transport.
//!
//! [`CsiMessage`] is the top-level envelope for every request and response
//! exchanged between an orchestrator and a `klc` process.  Each connection
//! carries exactly one request followed by one response.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope.
///
/// One request variant travels per connection; the reply is the matching
/// response variant or [`CsiMessage::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // Identity requests
    Probe,
    GetPluginInfo,
    GetPluginCapabilities,

    // Controller requests
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(VolumeId),
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    ListVolumes,
    ControllerGetVolume(VolumeId),
    GetCapacity,
    ControllerGetCapabilities,
    CreateSnapshot(CreateSnapshotRequest),
    DeleteSnapshot { snapshot_id: String },
    ListSnapshots,
    ControllerExpandVolume(ExpandVolumeRequest),

    // Node requests
    NodeStageVolume(NodeStageVolumeRequest),
    NodeUnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    NodePublishVolume(NodePublishVolumeRequest),
    NodeUnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    NodeGetInfo,
    NodeGetCapabilities,
    NodeGetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },
    NodeExpandVolume(ExpandVolumeRequest),

    // Responses
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    /// Probe result.
    ProbeResult(bool),
    /// A volume was created, or already existed.
    VolumeCreated(Volume),
    /// Publish context of a published volume.
    VolumePublished(HashMap<String, String>),
    /// Echo of the validated inputs.
    CapabilitiesConfirmed(ConfirmedCapabilities),
    /// Result of `ListVolumes`.
    VolumeList(Vec<VolumeEntry>),
    /// Result of `ControllerGetVolume`.
    VolumeInfo(VolumeEntry),
    /// Bytes still free in the pool.
    Capacity(u64),
    ControllerCapabilitiesResponse(Vec<ControllerCapability>),
    NodeInfoResponse(NodeInfo),
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    VolumeStatsResponse(VolumeStats),

    /// Reply to operations with nothing to return.
    Ok,
    /// The operation failed; carries the error as the server saw it.
    Error(CsiError),
}

impl CsiMessage {
    /// Whether this variant is a request a server may receive.
    pub fn is_request(&self) -> bool {
        !matches!(
            self,
            Self::PluginInfoResponse(_)
                | Self::PluginCapabilitiesResponse(_)
                | Self::ProbeResult(_)
                | Self::VolumeCreated(_)
                | Self::VolumePublished(_)
                | Self::CapabilitiesConfirmed(_)
                | Self::VolumeList(_)
                | Self::VolumeInfo(_)
                | Self::Capacity(_)
                | Self::ControllerCapabilitiesResponse(_)
                | Self::NodeInfoResponse(_)
                | Self::NodeCapabilitiesResponse(_)
                | Self::VolumeStatsResponse(_)
                | Self::Ok
                | Self::Error(_)
        )
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({id})"),
            Self::ControllerPublishVolume(req) => write!(
                f,
                "ControllerPublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ControllerUnpublishVolume(req) => write!(
                f,
                "ControllerUnpublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ValidateVolumeCapabilities(req) => {
                write!(f, "ValidateVolumeCapabilities({})", req.volume_id)
            }
            Self::ListVolumes => f.write_str("ListVolumes"),
            Self::ControllerGetVolume(id) => write!(f, "ControllerGetVolume({id})"),
            Self::GetCapacity => f.write_str("GetCapacity"),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::CreateSnapshot(req) => write!(f, "CreateSnapshot(name={})", req.name),
            Self::DeleteSnapshot { snapshot_id } => write!(f, "DeleteSnapshot({snapshot_id})"),
            Self::ListSnapshots => f.write_str("ListSnapshots"),
            Self::ControllerExpandVolume(req) => {
                write!(f, "ControllerExpandVolume({})", req.volume_id)
            }
            Self::NodeStageVolume(req) => write!(f, "NodeStageVolume({})", req.volume_id),
            Self::NodeUnstageVolume { volume_id, .. } => {
                write!(f, "NodeUnstageVolume({volume_id})")
            }
            Self::NodePublishVolume(req) => write!(f, "NodePublishVolume({})", req.volume_id),
            Self::NodeUnpublishVolume { volume_id, .. } => {
                write!(f, "NodeUnpublishVolume({volume_id})")
            }
            Self::NodeGetInfo => f.write_str("NodeGetInfo"),
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::NodeGetVolumeStats { volume_id, .. } => {
                write!(f, "NodeGetVolumeStats({volume_id})")
            }
            Self::NodeExpandVolume(req) => write!(f, "NodeExpandVolume({})", req.volume_id),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::VolumePublished(ctx) => write!(
                f,
                "VolumePublished({})",
                ctx.get(PUBLISH_CONTEXT_DEVICE_SLOT)
                    .map(String::as_str)
                    .unwrap_or("?")
            ),
            Self::CapabilitiesConfirmed(_) => f.write_str("CapabilitiesConfirmed"),
            Self::VolumeList(vs) => write!(f, "VolumeList(count={})", vs.len()),
            Self::VolumeInfo(entry) => write!(f, "VolumeInfo({})", entry.volume.volume_id),
            Self::Capacity(c) => write!(f, "Capacity({c})"),
            Self::ControllerCapabilitiesResponse(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::VolumeStatsResponse(stats) => {
                write!(f, "VolumeStats(used={})", stats.usage.used_bytes)
            }
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serde_roundtrip() {
        let msg = CsiMessage::ControllerPublishVolume(ControllerPublishVolumeRequest {
            volume_id: "data1".into(),
            node_id: "node-a".into(),
            ..Default::default()
        });
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        match de {
            CsiMessage::ControllerPublishVolume(req) => {
                assert_eq!(req.volume_id.as_str(), "data1");
                assert_eq!(req.node_id.as_str(), "node-a");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn error_keeps_its_code_across_the_wire() {
        let msg = CsiMessage::Error(CsiError::unimplemented("CreateSnapshot"));
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        match de {
            CsiMessage::Error(e) => {
                assert_eq!(e.code(), crate::error::Code::Unimplemented);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn requests_and_responses_are_distinguished() {
        assert!(CsiMessage::ListVolumes.is_request());
        assert!(CsiMessage::NodeGetInfo.is_request());
        assert!(!CsiMessage::Ok.is_request());
        assert!(!CsiMessage::Capacity(1).is_request());
    }

    #[test]
    fn display_formatting() {
        assert_eq!(CsiMessage::Ok.to_string(), "Ok");
        assert_eq!(
            CsiMessage::DeleteVolume("data1".into()).to_string(),
            "DeleteVolume(data1)"
        );
        let ctx = HashMap::from([(PUBLISH_CONTEXT_DEVICE_SLOT.to_owned(), "vdb".to_owned())]);
        assert_eq!(
            CsiMessage::VolumePublished(ctx).to_string(),
            "VolumePublished(vdb)"
        );
    }
}
