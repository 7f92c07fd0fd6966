//! Volume lifecycle controller.
//!
//! Every mutating operation holds the registry lock from its first lookup
//! to its last write, so two concurrent publishes can never observe the
//! same free slot and a create can never race a delete of the same name.
//!
//! The registry and the hypervisor are not updated transactionally:
//!
//! - publish writes the record *before* attaching and removes it again if
//!   the attach fails, so a failed publish never leaks a slot;
//! - unpublish detaches first and only removes the record once the disk is
//!   known to be gone (detached now, or already detached), so a failed
//!   detach never leaves an attachment without a record.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{PoolVolume, StorageBackend};
use crate::config::DriverConfig;
use crate::controller::{CsiController, PublishContext};
use crate::error::CsiError;
use crate::hypervisor::Hypervisor;
use crate::identity::CsiIdentity;
use crate::registry::Registry;
use crate::types::*;

/// Volume context key naming the host block device of a pool volume.
const CONTEXT_POOL_DEVICE: &str = "poolDevice";

/// The controller-side driver.
pub struct ControllerService {
    registry: Arc<Registry>,
    backend: Arc<dyn StorageBackend>,
    hypervisor: Arc<dyn Hypervisor>,
    max_capacity_bytes: u64,
}

impl ControllerService {
    pub fn new(
        registry: Arc<Registry>,
        backend: Arc<dyn StorageBackend>,
        hypervisor: Arc<dyn Hypervisor>,
        config: &DriverConfig,
    ) -> Self {
        Self {
            registry,
            backend,
            hypervisor,
            max_capacity_bytes: config.max_capacity_bytes,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn to_volume(pool: &PoolVolume) -> Volume {
        Volume {
            volume_id: pool.volume_id.clone(),
            capacity_bytes: pool.size_bytes,
            volume_context: HashMap::from([(
                CONTEXT_POOL_DEVICE.to_owned(),
                pool.device_path(),
            )]),
            accessible_topology: Vec::new(),
        }
    }

    fn to_entry(pool: &PoolVolume, record: Option<&AttachmentRecord>) -> VolumeEntry {
        VolumeEntry {
            volume: Self::to_volume(pool),
            status: VolumeStatus {
                published_node_ids: record.map(|r| r.node_id.clone()).into_iter().collect(),
                volume_condition: VolumeCondition::healthy("ok"),
            },
        }
    }
}

fn publish_context(record: &AttachmentRecord) -> PublishContext {
    HashMap::from([
        (
            PUBLISH_CONTEXT_DEVICE_SLOT.to_owned(),
            record.device_slot.to_string(),
        ),
        (
            PUBLISH_CONTEXT_DEVICE_PATH.to_owned(),
            record.device_slot.device_path(),
        ),
    ])
}

/// `Ok(None)` for a missing record, the record otherwise.
async fn lookup(
    registry: &Registry,
    volume_id: &VolumeId,
) -> Result<Option<AttachmentRecord>, CsiError> {
    match registry.get(volume_id).await {
        Ok(record) => Ok(Some(record)),
        Err(CsiError::RecordNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for ControllerService {
    async fn probe(&self) -> Result<bool, CsiError> {
        let healthy = tokio::fs::metadata(self.registry.root())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        Ok(healthy)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![
            PluginCapability::ControllerService,
            PluginCapability::VolumeAccessibilityConstraints,
        ])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for ControllerService {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("Name missing in request".into()));
        }
        ensure_key("name", &req.name)?;
        let volume_id = VolumeId(req.name);

        let _guard = self.registry.lock().await;
        match self.backend.find(&volume_id).await {
            Ok(existing) => {
                debug!(lv = %existing.pool_name, "returning existing volume for idempotent create");
                return Ok(Self::to_volume(&existing));
            }
            Err(CsiError::VolumeNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let created = self.backend.create(&volume_id).await?;
        info!(%volume_id, "volume created");
        Ok(Self::to_volume(&created))
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        if volume_id.as_str().is_empty() {
            return Err(CsiError::InvalidArgument(
                "Volume ID missing in request".into(),
            ));
        }
        ensure_key("volume_id", volume_id.as_str())?;

        let guard = self.registry.lock().await;
        if let Some(record) = lookup(&guard, volume_id).await? {
            return Err(CsiError::AlreadyPublished {
                volume_id: volume_id.to_string(),
                node_id: record.node_id.to_string(),
            });
        }

        let volume = self.backend.identity(volume_id);
        self.backend.delete(&volume).await?;
        info!(%volume_id, "volume deleted");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, CsiError> {
        ensure_key("volume_id", req.volume_id.as_str())?;
        ensure_key("node_id", req.node_id.as_str())?;

        let guard = self.registry.lock().await;
        let volume = self.backend.find(&req.volume_id).await?;

        if let Some(existing) = lookup(&guard, &req.volume_id).await? {
            if existing.node_id != req.node_id {
                return Err(CsiError::AlreadyPublished {
                    volume_id: req.volume_id.to_string(),
                    node_id: existing.node_id.to_string(),
                });
            }
            // Retry of an earlier publish: the record may predate a real
            // attachment, so it is kept even if this attach fails.
            debug!(slot = %existing.device_slot, "record exists, re-issuing attach");
            self.hypervisor
                .attach(&volume, &existing.node_id, &existing.device_slot)
                .await?;
            return Ok(publish_context(&existing));
        }

        let record = guard.allocate(&req.volume_id, &req.node_id).await?;
        if let Err(e) = self
            .hypervisor
            .attach(&volume, &req.node_id, &record.device_slot)
            .await
        {
            warn!(slot = %record.device_slot, error = %e, "attach failed, releasing slot");
            if let Err(rollback) = guard.remove(&req.volume_id).await {
                error!(error = %rollback, "failed to release slot after attach failure");
            }
            return Err(e);
        }

        info!(slot = %record.device_slot, "volume published");
        Ok(publish_context(&record))
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        ensure_key("volume_id", req.volume_id.as_str())?;
        ensure_key("node_id", req.node_id.as_str())?;

        let guard = self.registry.lock().await;
        let record = lookup(&guard, &req.volume_id).await?;

        let volume = self.backend.identity(&req.volume_id);
        self.hypervisor.detach(&volume, &req.node_id).await?;

        match record {
            Some(record) if record.node_id == req.node_id => {
                guard.remove(&req.volume_id).await?;
                info!(slot = %record.device_slot, "volume unpublished, slot released");
            }
            Some(record) => {
                warn!(
                    owner = %record.node_id,
                    "record belongs to another node, keeping it"
                );
            }
            None => debug!("no record, nothing to release"),
        }
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ConfirmedCapabilities, CsiError> {
        Ok(ConfirmedCapabilities {
            volume_context: req.volume_context,
            volume_capabilities: req.volume_capabilities,
            parameters: req.parameters,
        })
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeEntry>, CsiError> {
        let records: HashMap<VolumeId, AttachmentRecord> = self
            .registry
            .list()
            .await?
            .into_iter()
            .map(|r| (r.volume_id.clone(), r))
            .collect();

        let entries = self
            .backend
            .list()
            .await?
            .iter()
            .map(|pool| Self::to_entry(pool, records.get(&pool.volume_id)))
            .collect();
        Ok(entries)
    }

    async fn get_volume(&self, volume_id: &VolumeId) -> Result<VolumeEntry, CsiError> {
        ensure_key("volume_id", volume_id.as_str())?;
        let pool = self.backend.find(volume_id).await?;
        let record = lookup(&self.registry, volume_id).await?;
        Ok(Self::to_entry(&pool, record.as_ref()))
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        Ok(self.max_capacity_bytes)
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::PublishUnpublishVolume,
            ControllerCapability::GetVolume,
            ControllerCapability::GetCapacity,
            ControllerCapability::ListVolumes,
            ControllerCapability::VolumeCondition,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlotAlphabet;
    use crate::error::Code;
    use crate::testing::{MemoryBackend, MemoryHypervisor};

    struct Fixture {
        _tmp: tempfile::TempDir,
        backend: Arc<MemoryBackend>,
        hypervisor: Arc<MemoryHypervisor>,
        controller: ControllerService,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Registry::open(tmp.path(), SlotAlphabet::default())
            .await
            .unwrap();
        let backend = Arc::new(MemoryBackend::default());
        let hypervisor = Arc::new(MemoryHypervisor::default());
        let controller = ControllerService::new(
            Arc::new(registry),
            backend.clone(),
            hypervisor.clone(),
            &DriverConfig::default(),
        );
        Fixture {
            _tmp: tmp,
            backend,
            hypervisor,
            controller,
        }
    }

    fn create(name: &str) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            ..Default::default()
        }
    }

    fn publish(volume_id: &str, node_id: &str) -> ControllerPublishVolumeRequest {
        ControllerPublishVolumeRequest {
            volume_id: volume_id.into(),
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    fn unpublish(volume_id: &str, node_id: &str) -> ControllerUnpublishVolumeRequest {
        ControllerUnpublishVolumeRequest {
            volume_id: volume_id.into(),
            node_id: node_id.into(),
        }
    }

    #[tokio::test]
    async fn create_volume_is_idempotent() {
        let f = fixture().await;
        let first = f.controller.create_volume(create("x")).await.unwrap();
        let second = f.controller.create_volume(create("x")).await.unwrap();

        assert_eq!(first.volume_id, VolumeId::from("x"));
        assert_eq!(first.volume_id, second.volume_id);
        assert_eq!(f.backend.create_calls(), 1);
        assert_eq!(f.backend.volume_ids(), vec![VolumeId::from("x")]);
    }

    #[tokio::test]
    async fn create_volume_requires_name() {
        let f = fixture().await;
        let err = f.controller.create_volume(create("")).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_volume_does_not_mask_inventory_errors() {
        let f = fixture().await;
        f.backend.fail_next_find(CsiError::internal("bad lvs report"));
        let err = f.controller.create_volume(create("x")).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(f.backend.create_calls(), 0);
    }

    #[tokio::test]
    async fn delete_of_unknown_volume_succeeds() {
        let f = fixture().await;
        f.controller.delete_volume(&"never".into()).await.unwrap();
    }

    #[tokio::test]
    async fn delete_requires_id() {
        let f = fixture().await;
        let err = f.controller.delete_volume(&"".into()).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn delete_of_published_volume_is_refused() {
        let f = fixture().await;
        f.controller.create_volume(create("v")).await.unwrap();
        f.controller.publish_volume(publish("v", "node-a")).await.unwrap();

        let err = f.controller.delete_volume(&"v".into()).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert_eq!(f.backend.volume_ids(), vec![VolumeId::from("v")]);
    }

    #[tokio::test]
    async fn publish_assigns_distinct_slots_until_exhausted() {
        let f = fixture().await;
        let mut slots = std::collections::HashSet::new();
        for i in 0..24 {
            let name = format!("vol-{i}");
            f.controller.create_volume(create(&name)).await.unwrap();
            let ctx = f
                .controller
                .publish_volume(publish(&name, "node-a"))
                .await
                .unwrap();
            assert!(slots.insert(ctx[PUBLISH_CONTEXT_DEVICE_SLOT].clone()));
        }

        f.controller.create_volume(create("vol-24")).await.unwrap();
        let err = f
            .controller
            .publish_volume(publish("vol-24", "node-a"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(f.hypervisor.attached("node-a").len(), 24);
    }

    #[tokio::test]
    async fn publish_returns_slot_and_device_path() {
        let f = fixture().await;
        f.controller.create_volume(create("data1")).await.unwrap();
        let ctx = f
            .controller
            .publish_volume(publish("data1", "node-a"))
            .await
            .unwrap();

        assert_eq!(ctx[PUBLISH_CONTEXT_DEVICE_SLOT], "vdb");
        assert_eq!(ctx[PUBLISH_CONTEXT_DEVICE_PATH], "/dev/vdb");
        assert_eq!(
            f.hypervisor.attached("node-a"),
            vec![("vdb".to_owned(), "/dev/storages/k8s-data1".to_owned())]
        );
    }

    #[tokio::test]
    async fn publish_of_missing_volume_is_not_found() {
        let f = fixture().await;
        let err = f
            .controller
            .publish_volume(publish("ghost", "node-a"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert!(f.controller.registry().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_publish_reuses_slot() {
        let f = fixture().await;
        f.controller.create_volume(create("a")).await.unwrap();
        let first = f.controller.publish_volume(publish("a", "node-a")).await.unwrap();
        let second = f.controller.publish_volume(publish("a", "node-a")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.controller.registry().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_to_second_node_is_refused() {
        let f = fixture().await;
        f.controller.create_volume(create("a")).await.unwrap();
        f.controller.publish_volume(publish("a", "node-a")).await.unwrap();

        let err = f
            .controller
            .publish_volume(publish("a", "node-b"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert!(f.hypervisor.attached("node-b").is_empty());
    }

    #[tokio::test]
    async fn failed_attach_releases_slot() {
        let f = fixture().await;
        f.controller.create_volume(create("a")).await.unwrap();
        f.controller.create_volume(create("b")).await.unwrap();
        f.hypervisor.fail_next_attach(CsiError::unavailable("qemu monitor busy"));

        let err = f
            .controller
            .publish_volume(publish("a", "node-a"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert!(f.controller.registry().list().await.unwrap().is_empty());

        let ctx = f.controller.publish_volume(publish("b", "node-a")).await.unwrap();
        assert_eq!(ctx[PUBLISH_CONTEXT_DEVICE_SLOT], "vdb");
    }

    #[tokio::test]
    async fn unpublish_frees_slot_for_reuse() {
        let f = fixture().await;
        f.controller.create_volume(create("a")).await.unwrap();
        f.controller.create_volume(create("b")).await.unwrap();
        let a = f.controller.publish_volume(publish("a", "node-a")).await.unwrap();
        assert_eq!(a[PUBLISH_CONTEXT_DEVICE_SLOT], "vdb");

        f.controller.unpublish_volume(unpublish("a", "node-a")).await.unwrap();
        assert!(f.hypervisor.attached("node-a").is_empty());

        let b = f.controller.publish_volume(publish("b", "node-a")).await.unwrap();
        assert_eq!(b[PUBLISH_CONTEXT_DEVICE_SLOT], "vdb");
    }

    #[tokio::test]
    async fn unpublish_is_idempotent() {
        let f = fixture().await;
        f.controller.create_volume(create("a")).await.unwrap();
        f.controller.publish_volume(publish("a", "node-a")).await.unwrap();

        f.controller.unpublish_volume(unpublish("a", "node-a")).await.unwrap();
        f.controller.unpublish_volume(unpublish("a", "node-a")).await.unwrap();
        f.controller.unpublish_volume(unpublish("never", "node-a")).await.unwrap();
    }

    #[tokio::test]
    async fn unpublish_releases_slot_when_disk_already_gone() {
        let f = fixture().await;
        f.controller.create_volume(create("a")).await.unwrap();
        f.controller.publish_volume(publish("a", "node-a")).await.unwrap();
        f.hypervisor.forget("node-a");

        f.controller.unpublish_volume(unpublish("a", "node-a")).await.unwrap();
        assert!(f.controller.registry().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_detach_keeps_record() {
        let f = fixture().await;
        f.controller.create_volume(create("a")).await.unwrap();
        f.controller.publish_volume(publish("a", "node-a")).await.unwrap();
        f.hypervisor.fail_next_detach(CsiError::unavailable("device busy"));

        let err = f
            .controller
            .unpublish_volume(unpublish("a", "node-a"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        let record = f.controller.registry().get(&"a".into()).await.unwrap();
        assert_eq!(record.device_slot.as_str(), "vdb");
    }

    #[tokio::test]
    async fn unpublish_from_other_node_keeps_owner_record() {
        let f = fixture().await;
        f.controller.create_volume(create("a")).await.unwrap();
        f.controller.publish_volume(publish("a", "node-a")).await.unwrap();

        f.controller.unpublish_volume(unpublish("a", "node-b")).await.unwrap();
        let record = f.controller.registry().get(&"a".into()).await.unwrap();
        assert_eq!(record.node_id.as_str(), "node-a");
    }

    #[tokio::test]
    async fn publish_requires_ids() {
        let f = fixture().await;
        let err = f.controller.publish_volume(publish("", "node-a")).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        let err = f.controller.publish_volume(publish("a", "")).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        let err = f.controller.unpublish_volume(unpublish("", "node-a")).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn concurrent_publishes_never_share_a_slot() {
        let f = fixture().await;
        for i in 0..10 {
            f.controller.create_volume(create(&format!("v{i}"))).await.unwrap();
        }
        let controller = Arc::new(f.controller);

        let mut handles = Vec::new();
        for i in 0..10 {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move {
                controller
                    .publish_volume(publish(&format!("v{i}"), "node-a"))
                    .await
                    .unwrap()
                    .remove(PUBLISH_CONTEXT_DEVICE_SLOT)
                    .unwrap()
            }));
        }
        let mut slots = std::collections::HashSet::new();
        for handle in handles {
            assert!(slots.insert(handle.await.unwrap()));
        }
        assert_eq!(slots.len(), 10);
    }

    #[tokio::test]
    async fn list_and_get_report_attachment_status() {
        let f = fixture().await;
        f.controller.create_volume(create("a")).await.unwrap();
        f.controller.create_volume(create("b")).await.unwrap();
        f.controller.publish_volume(publish("a", "node-a")).await.unwrap();

        let mut entries = f.controller.list_volumes().await.unwrap();
        entries.sort_by(|x, y| x.volume.volume_id.cmp(&y.volume.volume_id));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status.published_node_ids, vec![NodeId::from("node-a")]);
        assert!(entries[1].status.published_node_ids.is_empty());
        assert!(!entries[0].status.volume_condition.abnormal);

        let entry = f.controller.get_volume(&"a".into()).await.unwrap();
        assert_eq!(
            entry.volume.volume_context[CONTEXT_POOL_DEVICE],
            "/dev/storages/k8s-a"
        );
        let err = f.controller.get_volume(&"zzz".into()).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn validate_echoes_request() {
        let f = fixture().await;
        let req = ValidateVolumeCapabilitiesRequest {
            volume_id: "a".into(),
            volume_context: HashMap::from([("k".into(), "v".into())]),
            volume_capabilities: vec![VolumeCapability::default()],
            parameters: HashMap::from([("p".into(), "q".into())]),
        };
        let confirmed = f
            .controller
            .validate_volume_capabilities(req.clone())
            .await
            .unwrap();
        assert_eq!(confirmed.volume_context, req.volume_context);
        assert_eq!(confirmed.volume_capabilities, req.volume_capabilities);
        assert_eq!(confirmed.parameters, req.parameters);
    }

    #[tokio::test]
    async fn capacity_and_capabilities() {
        let f = fixture().await;
        assert_eq!(f.controller.get_capacity().await.unwrap(), 0xffff_ffff);
        let caps = f.controller.get_capabilities().await.unwrap();
        assert!(caps.contains(&ControllerCapability::PublishUnpublishVolume));
        assert!(f.controller.probe().await.unwrap());
        assert_eq!(
            f.controller.get_plugin_info().await.unwrap().name,
            "kvm-lvm-csi"
        );
    }

    #[tokio::test]
    async fn snapshot_family_is_unsupported() {
        let f = fixture().await;
        let c = &f.controller;
        let results = [
            c.create_snapshot(CreateSnapshotRequest::default()).await.unwrap_err(),
            c.delete_snapshot("snap").await.unwrap_err(),
            c.list_snapshots().await.unwrap_err(),
            c.expand_volume(ExpandVolumeRequest::default()).await.unwrap_err(),
        ];
        for err in results {
            assert_eq!(err.code(), Code::Unimplemented);
        }
    }

    #[tokio::test]
    async fn probe_fails_when_registry_dir_is_gone() {
        let f = fixture().await;
        std::fs::remove_dir_all(f.controller.registry().root()).unwrap();
        assert!(!f.controller.probe().await.unwrap());
    }
}
