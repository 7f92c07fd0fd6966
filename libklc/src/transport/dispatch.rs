//! Mapping of request messages onto the service traits.

use async_trait::async_trait;
use tracing::warn;

use crate::controller::CsiController;
use crate::driver::{ControllerService, NodeService};
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// A handler that turns one request into one response.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, request: CsiMessage) -> CsiMessage;
}

fn reply<T>(result: Result<T, CsiError>, wrap: impl FnOnce(T) -> CsiMessage) -> CsiMessage {
    match result {
        Ok(value) => wrap(value),
        Err(e) => CsiMessage::Error(e),
    }
}

fn ack(result: Result<(), CsiError>) -> CsiMessage {
    reply(result, |()| CsiMessage::Ok)
}

/// Serve an identity request, or hand the request back.
async fn identity<T: CsiIdentity + ?Sized>(
    handler: &T,
    request: CsiMessage,
) -> Result<CsiMessage, CsiMessage> {
    match request {
        CsiMessage::Probe => Ok(reply(handler.probe().await, CsiMessage::ProbeResult)),
        CsiMessage::GetPluginInfo => Ok(reply(
            handler.get_plugin_info().await,
            CsiMessage::PluginInfoResponse,
        )),
        CsiMessage::GetPluginCapabilities => Ok(reply(
            handler.get_plugin_capabilities().await,
            CsiMessage::PluginCapabilitiesResponse,
        )),
        other => Err(other),
    }
}

fn not_served(service: &str, request: &CsiMessage) -> CsiMessage {
    if request.is_request() {
        CsiMessage::Error(CsiError::Unimplemented(format!(
            "{request} is not served by the {service} plugin"
        )))
    } else {
        warn!(msg = %request, "unexpected message variant received as request");
        CsiMessage::Error(CsiError::InvalidArgument(format!(
            "unexpected message: {request}"
        )))
    }
}

#[async_trait]
impl Dispatch for ControllerService {
    async fn dispatch(&self, request: CsiMessage) -> CsiMessage {
        let request = match identity(self, request).await {
            Ok(response) => return response,
            Err(request) => request,
        };
        match request {
            CsiMessage::CreateVolume(req) => {
                reply(self.create_volume(req).await, CsiMessage::VolumeCreated)
            }
            CsiMessage::DeleteVolume(id) => ack(self.delete_volume(&id).await),
            CsiMessage::ControllerPublishVolume(req) => {
                reply(CsiController::publish_volume(self, req).await, CsiMessage::VolumePublished)
            }
            CsiMessage::ControllerUnpublishVolume(req) => {
                ack(CsiController::unpublish_volume(self, req).await)
            }
            CsiMessage::ValidateVolumeCapabilities(req) => reply(
                self.validate_volume_capabilities(req).await,
                CsiMessage::CapabilitiesConfirmed,
            ),
            CsiMessage::ListVolumes => reply(self.list_volumes().await, CsiMessage::VolumeList),
            CsiMessage::ControllerGetVolume(id) => {
                reply(self.get_volume(&id).await, CsiMessage::VolumeInfo)
            }
            CsiMessage::GetCapacity => reply(self.get_capacity().await, CsiMessage::Capacity),
            CsiMessage::ControllerGetCapabilities => reply(
                CsiController::get_capabilities(self).await,
                CsiMessage::ControllerCapabilitiesResponse,
            ),
            CsiMessage::CreateSnapshot(req) => ack(self.create_snapshot(req).await),
            CsiMessage::DeleteSnapshot { snapshot_id } => {
                ack(self.delete_snapshot(&snapshot_id).await)
            }
            CsiMessage::ListSnapshots => ack(self.list_snapshots().await),
            CsiMessage::ControllerExpandVolume(req) => reply(
                CsiController::expand_volume(self, req).await,
                CsiMessage::Capacity,
            ),
            other => not_served("controller", &other),
        }
    }
}

#[async_trait]
impl Dispatch for NodeService {
    async fn dispatch(&self, request: CsiMessage) -> CsiMessage {
        let request = match identity(self, request).await {
            Ok(response) => return response,
            Err(request) => request,
        };
        match request {
            CsiMessage::NodeStageVolume(req) => ack(self.stage_volume(req).await),
            CsiMessage::NodeUnstageVolume {
                volume_id,
                staging_target_path,
            } => ack(self.unstage_volume(&volume_id, &staging_target_path).await),
            CsiMessage::NodePublishVolume(req) => ack(CsiNode::publish_volume(self, req).await),
            CsiMessage::NodeUnpublishVolume { target_path, .. } => {
                ack(CsiNode::unpublish_volume(self, &target_path).await)
            }
            CsiMessage::NodeGetInfo => reply(self.get_info().await, CsiMessage::NodeInfoResponse),
            CsiMessage::NodeGetCapabilities => reply(
                CsiNode::get_capabilities(self).await,
                CsiMessage::NodeCapabilitiesResponse,
            ),
            CsiMessage::NodeGetVolumeStats {
                volume_id,
                volume_path,
            } => reply(
                self.get_volume_stats(&volume_id, &volume_path).await,
                CsiMessage::VolumeStatsResponse,
            ),
            CsiMessage::NodeExpandVolume(req) => reply(
                CsiNode::expand_volume(self, req).await,
                CsiMessage::Capacity,
            ),
            other => not_served("node", &other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, SlotAlphabet};
    use crate::error::Code;
    use crate::registry::Registry;
    use crate::testing::{MemoryBackend, MemoryHypervisor, RecordingMounter};
    use crate::types::CreateVolumeRequest;
    use std::sync::Arc;

    async fn services(dir: &std::path::Path) -> (ControllerService, NodeService) {
        let registry = Arc::new(Registry::open(dir, SlotAlphabet::default()).await.unwrap());
        let controller = ControllerService::new(
            registry.clone(),
            Arc::new(MemoryBackend::default()),
            Arc::new(MemoryHypervisor::default()),
            &DriverConfig::default(),
        );
        let node = NodeService::new(
            "node-a".into(),
            registry,
            Arc::new(RecordingMounter::default()),
        );
        (controller, node)
    }

    fn error_code(msg: CsiMessage) -> Code {
        match msg {
            CsiMessage::Error(e) => e.code(),
            other => panic!("expected error, got {other}"),
        }
    }

    #[tokio::test]
    async fn controller_serves_identity_and_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, _) = services(tmp.path()).await;

        assert!(matches!(
            controller.dispatch(CsiMessage::Probe).await,
            CsiMessage::ProbeResult(true)
        ));
        let created = controller
            .dispatch(CsiMessage::CreateVolume(CreateVolumeRequest {
                name: "data1".into(),
                ..Default::default()
            }))
            .await;
        assert!(matches!(created, CsiMessage::VolumeCreated(v) if v.volume_id.as_str() == "data1"));
        assert!(matches!(
            controller.dispatch(CsiMessage::ListVolumes).await,
            CsiMessage::VolumeList(v) if v.len() == 1
        ));
    }

    #[tokio::test]
    async fn snapshot_requests_are_unimplemented() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, node) = services(tmp.path()).await;

        assert_eq!(
            error_code(controller.dispatch(CsiMessage::ListSnapshots).await),
            Code::Unimplemented
        );
        assert_eq!(
            error_code(
                node.dispatch(CsiMessage::NodeExpandVolume(Default::default()))
                    .await
            ),
            Code::Unimplemented
        );
    }

    #[tokio::test]
    async fn requests_for_the_other_service_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, node) = services(tmp.path()).await;

        assert_eq!(
            error_code(controller.dispatch(CsiMessage::NodeGetInfo).await),
            Code::Unimplemented
        );
        assert_eq!(
            error_code(node.dispatch(CsiMessage::ListVolumes).await),
            Code::Unimplemented
        );
        assert_eq!(
            error_code(node.dispatch(CsiMessage::Ok).await),
            Code::InvalidArgument
        );
    }
}
