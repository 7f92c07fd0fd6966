//! libvirt backend driven through the `virsh` command line.
//!
//! ```text
//! virsh [-c <uri>] attach-disk <domain> <source> <target>
//! virsh [-c <uri>] detach-disk <domain> <source>
//! virsh [-c <uri>] domblklist <domain>
//! ```
//!
//! `virsh` reports "already attached" and "not attached" as ordinary
//! failures with free-form messages.  Rather than matching those messages,
//! a failed attach or detach is re-checked against the domain's block
//! device list.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::backend::PoolVolume;
use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::exec::{CommandOutput, CommandRunner};
use crate::hypervisor::Hypervisor;
use crate::types::{DeviceSlot, NodeId};

/// One row of `virsh domblklist`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub target: String,
    pub source: String,
}

/// [`Hypervisor`] driving libvirt domains through `virsh`.
pub struct VirshHypervisor {
    runner: Arc<dyn CommandRunner>,
    uri: Option<String>,
}

impl VirshHypervisor {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &DriverConfig) -> Self {
        Self {
            runner,
            uri: config.virsh_uri.clone(),
        }
    }

    async fn virsh(&self, args: &[&str]) -> Result<CommandOutput, CsiError> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(uri) = &self.uri {
            full.push("-c".to_owned());
            full.push(uri.clone());
        }
        full.extend(args.iter().map(|a| (*a).to_owned()));
        self.runner.run("virsh", &full).await
    }

    /// Block devices currently attached to `domain`.
    pub async fn block_devices(&self, domain: &str) -> Result<Vec<BlockDevice>, CsiError> {
        let output = self.virsh(&["domblklist", domain]).await?;
        if !output.success() {
            return Err(CsiError::Unavailable(format!(
                "virsh domblklist {domain} exited with {:?}: {}",
                output.code,
                output.combined()
            )));
        }
        parse_domblklist(&output.stdout)
    }
}

/// Decode the `Target  Source` table printed by `virsh domblklist`.
fn parse_domblklist(stdout: &str) -> Result<Vec<BlockDevice>, CsiError> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());

    let header = lines.next().unwrap_or_default();
    let mut columns = header.split_whitespace();
    if columns.next() != Some("Target") || columns.next() != Some("Source") {
        return Err(CsiError::Internal(format!(
            "unexpected domblklist header: {header:?}"
        )));
    }
    match lines.next() {
        Some(rule) if rule.chars().all(|c| c == '-') => {}
        other => {
            return Err(CsiError::Internal(format!(
                "unexpected domblklist separator: {other:?}"
            )));
        }
    }

    lines
        .map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some(target), Some(source), None) => Ok(BlockDevice {
                    target: target.to_owned(),
                    source: source.to_owned(),
                }),
                _ => Err(CsiError::Internal(format!(
                    "unexpected domblklist row: {line:?}"
                ))),
            }
        })
        .collect()
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    #[instrument(skip(self, volume), fields(source = %volume.device_path(), %node_id, %slot))]
    async fn attach(
        &self,
        volume: &PoolVolume,
        node_id: &NodeId,
        slot: &DeviceSlot,
    ) -> Result<(), CsiError> {
        let source = volume.device_path();
        let output = self
            .virsh(&["attach-disk", node_id.as_str(), source.as_str(), slot.as_str()])
            .await?;
        if output.success() {
            info!("disk attached");
            return Ok(());
        }

        let devices = self.block_devices(node_id.as_str()).await.map_err(|e| {
            CsiError::Unavailable(format!(
                "attach-disk failed ({}); verifying attachment failed: {e}",
                output.combined()
            ))
        })?;
        if devices
            .iter()
            .any(|d| d.target == slot.as_str() && d.source == source)
        {
            debug!("disk already attached at requested slot");
            return Ok(());
        }

        warn!(output = %output.combined(), "attach-disk failed");
        Err(CsiError::Unavailable(format!(
            "virsh attach-disk exited with {:?}: {}",
            output.code,
            output.combined()
        )))
    }

    #[instrument(skip(self, volume), fields(source = %volume.device_path(), %node_id))]
    async fn detach(&self, volume: &PoolVolume, node_id: &NodeId) -> Result<(), CsiError> {
        let source = volume.device_path();
        let output = self
            .virsh(&["detach-disk", node_id.as_str(), source.as_str()])
            .await?;
        if output.success() {
            info!("disk detached");
            return Ok(());
        }

        let devices = self.block_devices(node_id.as_str()).await.map_err(|e| {
            CsiError::Unavailable(format!(
                "detach-disk failed ({}); verifying detachment failed: {e}",
                output.combined()
            ))
        })?;
        if devices.iter().all(|d| d.source != source) {
            debug!("disk already detached");
            return Ok(());
        }

        warn!(output = %output.combined(), "detach-disk failed");
        Err(CsiError::Unavailable(format!(
            "virsh detach-disk exited with {:?}: {}",
            output.code,
            output.combined()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    const BLKLIST: &str = " Target   Source\n\
        ------------------------------------------------\n \
        vda      /var/lib/libvirt/images/node-a.qcow2\n \
        vdb      /dev/storages/k8s-data1\n \
        sda      -\n";

    fn volume(id: &str) -> PoolVolume {
        PoolVolume {
            volume_id: id.into(),
            pool_name: format!("k8s-{id}"),
            pool: "storages".into(),
            size_bytes: 1024,
        }
    }

    fn hypervisor(runner: &Arc<ScriptedRunner>) -> VirshHypervisor {
        VirshHypervisor::new(runner.clone(), &DriverConfig::default())
    }

    #[test]
    fn parses_block_device_table() {
        let devices = parse_domblklist(BLKLIST).unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(
            devices[1],
            BlockDevice {
                target: "vdb".into(),
                source: "/dev/storages/k8s-data1".into(),
            }
        );
    }

    #[test]
    fn rejects_unexpected_table() {
        assert!(parse_domblklist("").is_err());
        assert!(parse_domblklist("error: failed to get domain\n").is_err());
        assert!(parse_domblklist(" Target Source\n---\n vdb a b\n").is_err());
    }

    #[tokio::test]
    async fn attach_runs_attach_disk() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_ok("Disk attached successfully\n");
        hypervisor(&runner)
            .attach(&volume("data1"), &"node-a".into(), &"vdb".into())
            .await
            .unwrap();
        assert_eq!(
            runner.invocations()[0].command_line(),
            "virsh attach-disk node-a /dev/storages/k8s-data1 vdb"
        );
    }

    #[tokio::test]
    async fn attach_uses_connection_uri() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_ok("");
        let config = DriverConfig {
            virsh_uri: Some("qemu:///system".into()),
            ..DriverConfig::default()
        };
        VirshHypervisor::new(runner.clone(), &config)
            .attach(&volume("data1"), &"node-a".into(), &"vdb".into())
            .await
            .unwrap();
        assert_eq!(
            runner.invocations()[0].command_line(),
            "virsh -c qemu:///system attach-disk node-a /dev/storages/k8s-data1 vdb"
        );
    }

    #[tokio::test]
    async fn repeated_attach_is_success() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_output(1, "", "error: Requested operation is not valid: target vdb already exists");
        runner.push_ok(BLKLIST);
        hypervisor(&runner)
            .attach(&volume("data1"), &"node-a".into(), &"vdb".into())
            .await
            .unwrap();
        assert_eq!(runner.invocations()[1].command_line(), "virsh domblklist node-a");
    }

    #[tokio::test]
    async fn attach_to_slot_held_by_other_disk_fails() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_output(1, "", "error: target vdb already exists");
        runner.push_ok(BLKLIST);
        let err = hypervisor(&runner)
            .attach(&volume("data2"), &"node-a".into(), &"vdb".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Unavailable(_)));
    }

    #[tokio::test]
    async fn attach_fails_when_domain_is_unreachable() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_output(1, "", "error: failed to get domain 'node-x'");
        runner.push_output(1, "", "error: failed to get domain 'node-x'");
        let err = hypervisor(&runner)
            .attach(&volume("data1"), &"node-x".into(), &"vdb".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Unavailable(_)));
    }

    #[tokio::test]
    async fn detach_of_absent_disk_is_success() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_output(1, "", "error: No disk found whose source path or target is /dev/storages/k8s-data2");
        runner.push_ok(BLKLIST);
        hypervisor(&runner)
            .detach(&volume("data2"), &"node-a".into())
            .await
            .unwrap();
        assert_eq!(
            runner.invocations()[0].command_line(),
            "virsh detach-disk node-a /dev/storages/k8s-data2"
        );
    }

    #[tokio::test]
    async fn detach_failure_of_attached_disk_is_unavailable() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_output(1, "", "error: internal error: unable to execute QEMU command");
        runner.push_ok(BLKLIST);
        let err = hypervisor(&runner)
            .detach(&volume("data1"), &"node-a".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Unavailable(_)));
    }
}
