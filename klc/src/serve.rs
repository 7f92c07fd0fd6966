//! Service wiring: real adapters behind the socket server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use libklc::backend::LvmBackend;
use libklc::exec::SystemRunner;
use libklc::hypervisor::VirshHypervisor;
use libklc::mount::SystemMounter;
use libklc::transport::{CsiServer, Dispatch};
use libklc::{ControllerService, DriverConfig, NodeService, Registry};
use tracing::info;

async fn open_registry(config: &DriverConfig) -> Result<Arc<Registry>> {
    let alphabet = config
        .slot_alphabet()
        .context("invalid device slot alphabet")?;
    let registry = Registry::open(&config.data_dir, alphabet)
        .await
        .with_context(|| format!("failed to open registry at {}", config.data_dir.display()))?;
    Ok(Arc::new(registry))
}

pub fn build_controller(config: &DriverConfig, registry: Arc<Registry>) -> ControllerService {
    let runner = Arc::new(SystemRunner);
    ControllerService::new(
        registry,
        Arc::new(LvmBackend::new(runner.clone(), config)),
        Arc::new(VirshHypervisor::new(runner, config)),
        config,
    )
}

pub async fn controller(config: &DriverConfig, socket: PathBuf) -> Result<()> {
    let registry = open_registry(config).await?;
    run(socket, build_controller(config, registry)).await
}

pub async fn node(config: &DriverConfig, socket: PathBuf) -> Result<()> {
    if config.node_id.is_empty() {
        bail!("node id is not set; pass --node-id or set KLC_NODE_ID");
    }
    let registry = open_registry(config).await?;
    let service = NodeService::new(
        config.node_id.as_str().into(),
        registry,
        Arc::new(SystemMounter),
    );
    run(socket, service).await
}

async fn run<T: Dispatch>(socket: PathBuf, service: T) -> Result<()> {
    let server = CsiServer::bind(socket, Arc::new(service)).context("failed to bind socket")?;
    server
        .serve_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    info!("stopped");
    Ok(())
}
