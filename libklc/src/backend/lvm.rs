//! LVM storage backend.
//!
//! Pool volumes are logical volumes in one volume group, named
//! `<prefix><volume-id>` (`k8s-data1` for volume `data1`).  Every operation
//! shells out to the LVM tools through a [`CommandRunner`]:
//!
//! ```text
//! lvs --reportformat json --units b --nosuffix -o lv_name,vg_name,lv_size <vg>
//! lvcreate -y -n <lv> -L <bytes>b <vg>
//! lvremove -f <vg>/<lv>
//! ```
//!
//! The `lvs` JSON report is decoded against an explicit schema; anything
//! that does not match is [`CsiError::Internal`], never a silent miss.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::backend::{PoolVolume, StorageBackend};
use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::exec::CommandRunner;
use crate::types::VolumeId;

/// `lvs --reportformat json` output.
#[derive(Debug, Deserialize)]
struct LvsReport {
    report: Vec<LvsSection>,
}

#[derive(Debug, Deserialize)]
struct LvsSection {
    #[serde(default)]
    lv: Vec<LvsEntry>,
}

#[derive(Debug, Deserialize)]
struct LvsEntry {
    lv_name: String,
    vg_name: String,
    #[serde(default)]
    lv_size: Option<String>,
}

/// [`StorageBackend`] driving the LVM command line tools.
pub struct LvmBackend {
    runner: Arc<dyn CommandRunner>,
    volume_group: String,
    prefix: String,
    size_bytes: u64,
    bin_dir: Option<PathBuf>,
}

impl LvmBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &DriverConfig) -> Self {
        Self {
            runner,
            volume_group: config.volume_group.clone(),
            prefix: config.volume_name_prefix.clone(),
            size_bytes: config.volume_size_bytes,
            bin_dir: config.lvm_bin_dir.clone(),
        }
    }

    fn program(&self, name: &str) -> String {
        match &self.bin_dir {
            Some(dir) => dir.join(name).to_string_lossy().into_owned(),
            None => name.to_owned(),
        }
    }

    fn lv_name(&self, volume_id: &VolumeId) -> String {
        format!("{}{}", self.prefix, volume_id)
    }

    /// Run `lvs` for the volume group and decode its report.
    async fn inventory(&self) -> Result<Vec<LvsEntry>, CsiError> {
        let program = self.program("lvs");
        let args: Vec<String> = [
            "--reportformat",
            "json",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            "lv_name,vg_name,lv_size",
            self.volume_group.as_str(),
        ]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();

        let output = self.runner.run(&program, &args).await?;
        if !output.success() {
            return Err(CsiError::Unavailable(format!(
                "lvs exited with {:?}: {}",
                output.code,
                output.combined()
            )));
        }
        parse_report(&output.stdout)
    }

    fn to_pool_volume(&self, entry: LvsEntry) -> Result<Option<PoolVolume>, CsiError> {
        if entry.vg_name != self.volume_group {
            return Ok(None);
        }
        let Some(volume_id) = entry.lv_name.strip_prefix(&self.prefix) else {
            return Ok(None);
        };
        if volume_id.is_empty() {
            return Ok(None);
        }
        let size_bytes = match entry.lv_size.as_deref() {
            Some(raw) => parse_size(raw)?,
            None => self.size_bytes,
        };
        Ok(Some(PoolVolume {
            volume_id: VolumeId::from(volume_id),
            pool_name: entry.lv_name.clone(),
            pool: entry.vg_name,
            size_bytes,
        }))
    }
}

fn parse_report(stdout: &str) -> Result<Vec<LvsEntry>, CsiError> {
    let report: LvsReport = serde_json::from_str(stdout)
        .map_err(|e| CsiError::Internal(format!("unexpected lvs report: {e}")))?;
    let mut sections = report.report.into_iter();
    let Some(section) = sections.next() else {
        return Err(CsiError::Internal("lvs report has no sections".to_owned()));
    };
    Ok(section.lv)
}

fn parse_size(raw: &str) -> Result<u64, CsiError> {
    let trimmed = raw.trim().trim_end_matches(['B', 'b']);
    trimmed
        .parse::<u64>()
        .map_err(|e| CsiError::Internal(format!("unexpected lv_size {raw:?}: {e}")))
}

/// LVM names allow `[A-Za-z0-9+_.-]` only.
fn valid_lv_name(name: &str) -> bool {
    !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-'))
}

#[async_trait]
impl StorageBackend for LvmBackend {
    fn identity(&self, volume_id: &VolumeId) -> PoolVolume {
        PoolVolume {
            volume_id: volume_id.clone(),
            pool_name: self.lv_name(volume_id),
            pool: self.volume_group.clone(),
            size_bytes: self.size_bytes,
        }
    }

    #[instrument(skip(self), fields(%volume_id))]
    async fn find(&self, volume_id: &VolumeId) -> Result<PoolVolume, CsiError> {
        let wanted = self.lv_name(volume_id);
        for entry in self.inventory().await? {
            if entry.lv_name == wanted
                && let Some(volume) = self.to_pool_volume(entry)?
            {
                debug!(lv = %volume.pool_name, "pool volume found");
                return Ok(volume);
            }
        }
        Err(CsiError::VolumeNotFound(volume_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<PoolVolume>, CsiError> {
        let mut volumes = Vec::new();
        for entry in self.inventory().await? {
            if let Some(volume) = self.to_pool_volume(entry)? {
                volumes.push(volume);
            }
        }
        Ok(volumes)
    }

    #[instrument(skip(self), fields(%volume_id))]
    async fn create(&self, volume_id: &VolumeId) -> Result<PoolVolume, CsiError> {
        let volume = self.identity(volume_id);
        if !valid_lv_name(&volume.pool_name) {
            return Err(CsiError::InvalidArgument(format!(
                "volume name {volume_id:?} is not a valid logical volume name"
            )));
        }

        let args = vec![
            "-y".to_owned(),
            "-n".to_owned(),
            volume.pool_name.clone(),
            "-L".to_owned(),
            format!("{}b", self.size_bytes),
            self.volume_group.clone(),
        ];
        let output = self.runner.run(&self.program("lvcreate"), &args).await?;
        if !output.success() {
            let combined = output.combined();
            if combined.contains("already exists") {
                warn!(lv = %volume.pool_name, "lvcreate reports volume already exists");
                return Ok(volume);
            }
            return Err(CsiError::Unavailable(format!(
                "lvcreate exited with {:?}: {combined}",
                output.code
            )));
        }

        info!(lv = %volume.pool_name, size = self.size_bytes, "pool volume created");
        Ok(volume)
    }

    #[instrument(skip(self), fields(lv = %volume.pool_name))]
    async fn delete(&self, volume: &PoolVolume) -> Result<(), CsiError> {
        let args = vec![
            "-f".to_owned(),
            format!("{}/{}", volume.pool, volume.pool_name),
        ];
        let output = self.runner.run(&self.program("lvremove"), &args).await?;
        if !output.success() {
            let combined = output.combined();
            if combined.contains("Failed to find logical volume") {
                debug!("pool volume already absent");
                return Ok(());
            }
            return Err(CsiError::Unavailable(format!(
                "lvremove exited with {:?}: {combined}",
                output.code
            )));
        }

        info!("pool volume removed");
        Ok(())
    }
}
