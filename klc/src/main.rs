//! `klc`: controller and node plugin processes.
//!
//! ```text
//! klc controller --socket /run/klc/controller.sock
//! klc node --node-id node-a --socket /run/klc/node.sock
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

mod serve;

/// Block volumes for KVM guests, carved from an LVM volume group.
#[derive(Parser, Debug)]
#[command(name = "klc", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, env = "KLC_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding attachment records (overrides the configuration)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the identity and controller services
    Controller {
        /// Unix socket to listen on
        #[arg(long, default_value = "/run/klc/controller.sock")]
        socket: PathBuf,
    },
    /// Serve the identity and node services on a compute node
    Node {
        /// Unix socket to listen on
        #[arg(long, default_value = "/run/klc/node.sock")]
        socket: PathBuf,

        /// Identity of this node (overrides the configuration)
        #[arg(long)]
        node_id: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, &cli.log_level)?;

    let mut config = libklc::DriverConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Command::Controller { socket } => {
            info!(socket = %socket.display(), data_dir = %config.data_dir.display(), "starting controller");
            serve::controller(&config, socket).await
        }
        Command::Node { socket, node_id } => {
            if let Some(node_id) = node_id {
                config.node_id = node_id;
            }
            info!(socket = %socket.display(), node_id = %config.node_id, "starting node");
            serve::node(&config, socket).await
        }
    }
}

fn init_logging(format: LogFormat, level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("failed to create log filter")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.with_target(false).compact().init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_subcommand() {
        let cli = Cli::try_parse_from([
            "klc",
            "--log-format",
            "json",
            "node",
            "--node-id",
            "node-a",
            "--socket",
            "/tmp/n.sock",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Node { socket, node_id } => {
                assert_eq!(socket, PathBuf::from("/tmp/n.sock"));
                assert_eq!(node_id.as_deref(), Some("node-a"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn controller_socket_has_default() {
        let cli = Cli::try_parse_from(["klc", "controller"]).unwrap();
        match cli.command {
            Command::Controller { socket } => {
                assert_eq!(socket, PathBuf::from("/run/klc/controller.sock"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn command_is_required() {
        assert!(Cli::try_parse_from(["klc"]).is_err());
    }
}
