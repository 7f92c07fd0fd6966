//! Driver configuration.
//!
//! Values come from three layers, later layers winning:
//!
//! 1. built-in defaults ([`DriverConfig::default`]),
//! 2. an optional YAML file,
//! 3. environment variables:
//!    - `KLC_NODE_ID`: node identity of a node-side instance.
//!    - `KLC_DATA_DIR`: directory holding attachment records.
//!    - `KLC_VOLUME_GROUP`: LVM volume group for pool volumes.
//!
//! Command line flags of the `klc` binary are applied on top by the caller.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::CsiError;
use crate::types::DeviceSlot;

static DATA_DIR: &str = "/var/lib/klc/data";
static VOLUME_GROUP: &str = "storages";
static VOLUME_NAME_PREFIX: &str = "k8s-";
static SLOT_PREFIX: &str = "vd";
static SLOT_SYMBOLS: &str = "bcdefghijklmnopqrstuvwxy";

const GIB: u64 = 1024 * 1024 * 1024;

/// Configuration shared by the controller and node services.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Node this instance represents; only meaningful for the node service.
    pub node_id: String,
    /// Directory of the attachment record store.
    pub data_dir: PathBuf,
    /// LVM volume group that holds every pool volume.
    pub volume_group: String,
    /// Prefix namespacing driver-owned logical volumes.
    pub volume_name_prefix: String,
    /// Fixed size of every pool volume.
    pub volume_size_bytes: u64,
    /// Device name prefix shared by every slot (`vd` in `vdb`).
    pub slot_prefix: String,
    /// One character per slot; the count is the per-node volume ceiling.
    pub slot_symbols: String,
    /// Value reported by `GetCapacity`.
    pub max_capacity_bytes: u64,
    /// Optional libvirt connection URI passed as `virsh -c <uri>`.
    pub virsh_uri: Option<String>,
    /// Directory containing `lvs`, `lvcreate` and `lvremove`; `PATH` lookup
    /// when unset.
    pub lvm_bin_dir: Option<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            data_dir: PathBuf::from(DATA_DIR),
            volume_group: VOLUME_GROUP.to_owned(),
            volume_name_prefix: VOLUME_NAME_PREFIX.to_owned(),
            volume_size_bytes: 10 * GIB,
            slot_prefix: SLOT_PREFIX.to_owned(),
            slot_symbols: SLOT_SYMBOLS.to_owned(),
            max_capacity_bytes: 0xffff_ffff,
            virsh_uri: None,
            lvm_bin_dir: None,
        }
    }
}

impl DriverConfig {
    /// Load the configuration from `path` (if any) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, CsiError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a YAML configuration file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, CsiError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CsiError::InvalidArgument(format!("read config {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
            .map_err(|e| CsiError::InvalidArgument(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml(raw: &str) -> Result<Self, CsiError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
            .map_err(|e| CsiError::InvalidArgument(format!("parse config: {e}")))
    }

    /// Overlay environment variables, looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(node_id) = lookup("KLC_NODE_ID") {
            self.node_id = node_id;
        }
        if let Some(data_dir) = lookup("KLC_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }
        if let Some(group) = lookup("KLC_VOLUME_GROUP") {
            self.volume_group = group;
        }
    }

    /// Build the validated slot alphabet.
    pub fn slot_alphabet(&self) -> Result<SlotAlphabet, CsiError> {
        SlotAlphabet::new(&self.slot_prefix, &self.slot_symbols)
    }
}

/// The ordered set of device slots a node can hand out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAlphabet {
    slots: Vec<DeviceSlot>,
}

impl SlotAlphabet {
    /// Build the alphabet `prefix + symbol` for every symbol.
    ///
    /// Slots are kept in lexicographic order so allocation always hands out
    /// the smallest free one.
    pub fn new(prefix: &str, symbols: &str) -> Result<Self, CsiError> {
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CsiError::InvalidArgument(format!(
                "slot prefix {prefix:?} must be ASCII alphanumeric"
            )));
        }
        let mut seen = BTreeSet::new();
        for symbol in symbols.chars() {
            if !symbol.is_ascii_alphanumeric() {
                return Err(CsiError::InvalidArgument(format!(
                    "slot symbol {symbol:?} must be ASCII alphanumeric"
                )));
            }
            if !seen.insert(format!("{prefix}{symbol}")) {
                return Err(CsiError::InvalidArgument(format!(
                    "slot symbol {symbol:?} is listed twice"
                )));
            }
        }
        if seen.is_empty() {
            return Err(CsiError::InvalidArgument(
                "slot alphabet must not be empty".to_owned(),
            ));
        }
        Ok(Self {
            slots: seen.into_iter().map(DeviceSlot).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceSlot> {
        self.slots.iter()
    }
}

impl Default for SlotAlphabet {
    fn default() -> Self {
        Self {
            slots: SLOT_SYMBOLS
                .chars()
                .map(|c| DeviceSlot(format!("{SLOT_PREFIX}{c}")))
                .collect(),
        }
    }
}
