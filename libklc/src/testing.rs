//! In-memory stand-ins for the external systems, shared by unit and
//! integration tests.
//!
//! None of these spawn processes or touch the mount table.  Each records
//! enough about its calls for tests to assert on what the driver did.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::backend::{PoolVolume, StorageBackend};
use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::exec::{CommandOutput, CommandRunner};
use crate::hypervisor::Hypervisor;
use crate::mount::Mounter;
use crate::types::{DeviceSlot, NodeId, VolumeId};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ScriptedRunner
// ---------------------------------------------------------------------------

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandInvocation {
    /// Shell-like rendering for assertions.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// [`CommandRunner`] returning pre-seeded outputs in FIFO order.
///
/// Running with an empty queue is an [`CsiError::Internal`] error so a test
/// that issues an unexpected command fails loudly.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    responses: Mutex<VecDeque<CommandOutput>>,
    invocations: Mutex<Vec<CommandInvocation>>,
}

impl ScriptedRunner {
    /// Queue a zero exit with `stdout`.
    pub fn push_ok(&self, stdout: impl Into<String>) {
        self.push_output(0, stdout, "");
    }

    /// Queue an explicit result.
    pub fn push_output(&self, code: i32, stdout: impl Into<String>, stderr: impl Into<String>) {
        locked(&self.responses).push_back(CommandOutput {
            code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CsiError> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        locked(&self.responses)
            .pop_front()
            .ok_or_else(|| CsiError::Internal(format!("no scripted response for {program}")))
    }
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// [`StorageBackend`] keeping pool volumes in a map.
#[derive(Debug)]
pub struct MemoryBackend {
    pool: String,
    prefix: String,
    size_bytes: u64,
    volumes: Mutex<BTreeMap<VolumeId, PoolVolume>>,
    creates: AtomicUsize,
    find_failure: Mutex<Option<CsiError>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(&DriverConfig::default())
    }
}

impl MemoryBackend {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            pool: config.volume_group.clone(),
            prefix: config.volume_name_prefix.clone(),
            size_bytes: config.volume_size_bytes,
            volumes: Mutex::default(),
            creates: AtomicUsize::new(0),
            find_failure: Mutex::default(),
        }
    }

    /// Number of volumes actually created.
    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// IDs of the volumes currently in the pool, sorted.
    pub fn volume_ids(&self) -> Vec<VolumeId> {
        locked(&self.volumes).keys().cloned().collect()
    }

    /// Make the next `find` fail with `err`.
    pub fn fail_next_find(&self, err: CsiError) {
        *locked(&self.find_failure) = Some(err);
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn identity(&self, volume_id: &VolumeId) -> PoolVolume {
        PoolVolume {
            volume_id: volume_id.clone(),
            pool_name: format!("{}{}", self.prefix, volume_id),
            pool: self.pool.clone(),
            size_bytes: self.size_bytes,
        }
    }

    async fn find(&self, volume_id: &VolumeId) -> Result<PoolVolume, CsiError> {
        if let Some(err) = locked(&self.find_failure).take() {
            return Err(err);
        }
        locked(&self.volumes)
            .get(volume_id)
            .cloned()
            .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<PoolVolume>, CsiError> {
        Ok(locked(&self.volumes).values().cloned().collect())
    }

    async fn create(&self, volume_id: &VolumeId) -> Result<PoolVolume, CsiError> {
        let volume = self.identity(volume_id);
        let mut volumes = locked(&self.volumes);
        if !volumes.contains_key(volume_id) {
            self.creates.fetch_add(1, Ordering::SeqCst);
            volumes.insert(volume_id.clone(), volume.clone());
        }
        Ok(volume)
    }

    async fn delete(&self, volume: &PoolVolume) -> Result<(), CsiError> {
        locked(&self.volumes).remove(&volume.volume_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryHypervisor
// ---------------------------------------------------------------------------

/// [`Hypervisor`] tracking each node's block devices as slot -> source.
///
/// Attaching the same source at the same slot twice and detaching an absent
/// source both succeed, as they do against a real hypervisor.
#[derive(Debug, Default)]
pub struct MemoryHypervisor {
    domains: Mutex<HashMap<NodeId, BTreeMap<String, String>>>,
    attach_failure: Mutex<Option<CsiError>>,
    detach_failure: Mutex<Option<CsiError>>,
    attaches: AtomicUsize,
}

impl MemoryHypervisor {
    /// `(slot, source)` pairs attached to `node`, ordered by slot.
    pub fn attached(&self, node: &str) -> Vec<(String, String)> {
        locked(&self.domains)
            .get(&NodeId::from(node))
            .map(|devices| {
                devices
                    .iter()
                    .map(|(slot, source)| (slot.clone(), source.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn attach_calls(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    pub fn fail_next_attach(&self, err: CsiError) {
        *locked(&self.attach_failure) = Some(err);
    }

    pub fn fail_next_detach(&self, err: CsiError) {
        *locked(&self.detach_failure) = Some(err);
    }

    /// Drop every device of `node`, as if the guest was rebooted.
    pub fn forget(&self, node: &str) {
        locked(&self.domains).remove(&NodeId::from(node));
    }
}

#[async_trait]
impl Hypervisor for MemoryHypervisor {
    async fn attach(
        &self,
        volume: &PoolVolume,
        node_id: &NodeId,
        slot: &DeviceSlot,
    ) -> Result<(), CsiError> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = locked(&self.attach_failure).take() {
            return Err(err);
        }
        let source = volume.device_path();
        let mut domains = locked(&self.domains);
        let devices = domains.entry(node_id.clone()).or_default();
        match devices.get(slot.as_str()) {
            Some(existing) if *existing == source => Ok(()),
            Some(existing) => Err(CsiError::Unavailable(format!(
                "target {slot} on {node_id} already holds {existing}"
            ))),
            None => {
                devices.insert(slot.to_string(), source);
                Ok(())
            }
        }
    }

    async fn detach(&self, volume: &PoolVolume, node_id: &NodeId) -> Result<(), CsiError> {
        if let Some(err) = locked(&self.detach_failure).take() {
            return Err(err);
        }
        let source = volume.device_path();
        if let Some(devices) = locked(&self.domains).get_mut(node_id) {
            devices.retain(|_, s| *s != source);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingMounter
// ---------------------------------------------------------------------------

/// [`Mounter`] keeping a private mount table.
///
/// Like the kernel, it mounts filesystems only onto directories and binds
/// device nodes only onto non-directories.
#[derive(Debug, Default)]
pub struct RecordingMounter {
    mounts: Mutex<HashMap<PathBuf, RecordedMount>>,
    mount_calls: AtomicUsize,
    unmount_calls: AtomicUsize,
}

/// One entry of [`RecordingMounter`]'s table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMount {
    pub source: String,
    /// `None` for bind mounts.
    pub fs_type: Option<String>,
    pub options: Vec<String>,
}

impl RecordingMounter {
    pub fn mount_calls(&self) -> usize {
        self.mount_calls.load(Ordering::SeqCst)
    }

    pub fn unmount_calls(&self) -> usize {
        self.unmount_calls.load(Ordering::SeqCst)
    }

    /// Device mounted at `target`, if any.
    pub fn source_of(&self, target: &Path) -> Option<String> {
        self.mount_at(target).map(|m| m.source)
    }

    pub fn mount_at(&self, target: &Path) -> Option<RecordedMount> {
        locked(&self.mounts).get(target).cloned()
    }

    fn record(&self, target: &Path, entry: RecordedMount) {
        locked(&self.mounts).insert(target.to_path_buf(), entry);
    }
}

fn refuse(target: &Path, reason: &str) -> CsiError {
    CsiError::MountFailed {
        path: target.display().to_string(),
        reason: reason.to_owned(),
    }
}

#[async_trait]
impl Mounter for RecordingMounter {
    async fn is_mount_point(&self, path: &Path) -> Result<bool, CsiError> {
        Ok(locked(&self.mounts).contains_key(path))
    }

    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        match tokio::fs::metadata(target).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(refuse(target, "not a directory")),
            Err(_) => return Err(refuse(target, "target does not exist")),
        }
        self.record(
            target,
            RecordedMount {
                source: source.to_owned(),
                fs_type: Some(fs_type.to_owned()),
                options: options.to_vec(),
            },
        );
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        match tokio::fs::metadata(target).await {
            Ok(meta) if meta.is_dir() => return Err(refuse(target, "is a directory")),
            Ok(_) => {}
            Err(_) => return Err(refuse(target, "target does not exist")),
        }
        let options = if read_only { vec!["ro".to_owned()] } else { Vec::new() };
        self.record(
            target,
            RecordedMount {
                source: source.to_owned(),
                fs_type: None,
                options,
            },
        );
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        self.unmount_calls.fetch_add(1, Ordering::SeqCst);
        locked(&self.mounts).remove(target);
        Ok(())
    }
}
