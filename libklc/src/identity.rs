//! Plugin discovery and health.
//!
//! Both `klc` processes answer identity requests.  The controller advertises
//! the controller service; the node only its topology constraint.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

/// Name reported by `GetPluginInfo`.
pub const PLUGIN_NAME: &str = "kvm-lvm-csi";

#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// [`PLUGIN_NAME`] and the crate version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    /// `true` while the attachment record directory is reachable.
    async fn probe(&self) -> Result<bool, CsiError>;

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}
