//! Volume Registry: the durable mapping from volume to device slot and node.
//!
//! # On-disk layout
//!
//! ```text
//! <data_dir>/
//!   <volume-id>.json        # {"device_slot": "vdb", "node_id": "node-a"}
//!   <volume-id>.json.tmp    # transient, while a record is being written
//! ```
//!
//! A record exists only while its volume is published.  Reads go straight to
//! disk, so a node-side instance sharing the directory sees every write made
//! by the controller.
//!
//! Slot allocation scans all records and then writes one; the two steps are
//! only atomic together under [`Registry::lock`].  Mutations are therefore
//! only reachable through the [`RegistryGuard`] that the lock returns.

use std::io::ErrorKind;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

use crate::config::SlotAlphabet;
use crate::error::CsiError;
use crate::types::{AttachmentRecord, DeviceSlot, NodeId, VolumeId, ensure_key};

const RECORD_SUFFIX: &str = ".json";

/// Serialized value of a record; the key is the file name.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    device_slot: DeviceSlot,
    node_id: NodeId,
}

/// Directory-backed attachment record store with its allocation lock.
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    alphabet: SlotAlphabet,
    lock: Mutex<()>,
}

impl Registry {
    /// Open (creating if needed) the record directory at `root`.
    pub async fn open(root: impl Into<PathBuf>, alphabet: SlotAlphabet) -> Result<Self, CsiError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            CsiError::Internal(format!("create registry dir {}: {e}", root.display()))
        })?;
        Ok(Self {
            root,
            alphabet,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn alphabet(&self) -> &SlotAlphabet {
        &self.alphabet
    }

    /// Acquire the process-wide lock serializing every mutating operation.
    pub async fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            registry: self,
            _lock: self.lock.lock().await,
        }
    }

    fn record_path(&self, volume_id: &VolumeId) -> PathBuf {
        self.root.join(format!("{volume_id}{RECORD_SUFFIX}"))
    }

    /// Look up the record of `volume_id`.
    pub async fn get(&self, volume_id: &VolumeId) -> Result<AttachmentRecord, CsiError> {
        ensure_key("volume_id", volume_id.as_str())?;
        let path = self.record_path(volume_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CsiError::RecordNotFound(volume_id.to_string()));
            }
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "read record {}: {e}",
                    path.display()
                )));
            }
        };
        decode(volume_id.clone(), &raw, &path)
    }

    /// Every live record, in no particular order.
    pub async fn list(&self) -> Result<Vec<AttachmentRecord>, CsiError> {
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            CsiError::Internal(format!("read_dir {}: {e}", self.root.display()))
        })?;

        let mut records = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(CsiError::internal)? {
            let path = entry.path();
            let Some(volume_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(RECORD_SUFFIX))
            else {
                continue;
            };
            let volume_id = VolumeId::from(volume_id);

            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                // Removed between read_dir and read.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(CsiError::Internal(format!(
                        "read record {}: {e}",
                        path.display()
                    )));
                }
            };
            records.push(decode(volume_id, &raw, &path)?);
        }
        Ok(records)
    }

    async fn sync_root(&self) -> Result<(), CsiError> {
        let dir = tokio::fs::File::open(&self.root)
            .await
            .map_err(|e| CsiError::Internal(format!("open {}: {e}", self.root.display())))?;
        dir.sync_all()
            .await
            .map_err(|e| CsiError::Internal(format!("sync {}: {e}", self.root.display())))
    }
}

fn decode(volume_id: VolumeId, raw: &str, path: &Path) -> Result<AttachmentRecord, CsiError> {
    let stored: StoredRecord = serde_json::from_str(raw)
        .map_err(|e| CsiError::Internal(format!("malformed record {}: {e}", path.display())))?;
    Ok(AttachmentRecord {
        volume_id,
        device_slot: stored.device_slot,
        node_id: stored.node_id,
    })
}

/// Exclusive access to the registry, held for the full duration of one
/// lifecycle operation.
pub struct RegistryGuard<'a> {
    registry: &'a Registry,
    _lock: MutexGuard<'a, ()>,
}

impl Deref for RegistryGuard<'_> {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        self.registry
    }
}

impl RegistryGuard<'_> {
    /// Assign the smallest free slot on `node_id` to `volume_id` and persist
    /// the record.
    ///
    /// Fails with [`CsiError::AlreadyPublished`] if `volume_id` already has a
    /// record and with [`CsiError::ResourceExhausted`] if every slot on the
    /// node is taken.
    #[instrument(skip(self), fields(%volume_id, %node_id))]
    pub async fn allocate(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
    ) -> Result<AttachmentRecord, CsiError> {
        ensure_key("volume_id", volume_id.as_str())?;
        ensure_key("node_id", node_id.as_str())?;

        let records = self.list().await?;
        if let Some(existing) = records.iter().find(|r| &r.volume_id == volume_id) {
            return Err(CsiError::AlreadyPublished {
                volume_id: volume_id.to_string(),
                node_id: existing.node_id.to_string(),
            });
        }

        let used: Vec<&DeviceSlot> = records
            .iter()
            .filter(|r| &r.node_id == node_id)
            .map(|r| &r.device_slot)
            .collect();
        let slot = self
            .alphabet
            .iter()
            .find(|slot| !used.contains(slot))
            .cloned()
            .ok_or_else(|| CsiError::ResourceExhausted {
                node_id: node_id.to_string(),
                slots: self.alphabet.len(),
            })?;

        self.write(volume_id, &slot, node_id).await?;
        info!(%slot, "device slot allocated");
        Ok(AttachmentRecord {
            volume_id: volume_id.clone(),
            device_slot: slot,
            node_id: node_id.clone(),
        })
    }

    /// Delete the record of `volume_id`.  Absent records are not an error.
    #[instrument(skip(self), fields(%volume_id))]
    pub async fn remove(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        ensure_key("volume_id", volume_id.as_str())?;
        let path = self.record_path(volume_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("record already absent");
                return Ok(());
            }
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "remove record {}: {e}",
                    path.display()
                )));
            }
        }
        self.sync_root().await?;
        info!("record removed");
        Ok(())
    }

    /// Write the record through a temp file so readers never see a torn value.
    async fn write(
        &self,
        volume_id: &VolumeId,
        slot: &DeviceSlot,
        node_id: &NodeId,
    ) -> Result<(), CsiError> {
        let stored = StoredRecord {
            device_slot: slot.clone(),
            node_id: node_id.clone(),
        };
        let json = serde_json::to_vec(&stored).map_err(CsiError::internal)?;

        let path = self.record_path(volume_id);
        let tmp = self.root.join(format!("{volume_id}{RECORD_SUFFIX}.tmp"));
        let write_err = |e: std::io::Error| {
            CsiError::Internal(format!("write record {}: {e}", tmp.display()))
        };

        let mut file = tokio::fs::File::create(&tmp).await.map_err(write_err)?;
        file.write_all(&json).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            CsiError::Internal(format!("commit record {}: {e}", path.display()))
        })?;
        self.sync_root().await
    }
}
