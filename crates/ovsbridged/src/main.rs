//! ovsbridged entry point.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-6: Configuration Settings - Settings come from the TOML file, flags override
//! - AU-12: Audit Record Generation - Every provisioning action is logged

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ovs_bridged::config::DEFAULT_CONFIG_PATH;
use ovs_bridged::{load_config_or_default, BridgeDriver};
use ovs_cfgmgr_common::IpCommandHost;
use ovs_ovsdb::PortKind;
use ovs_types::VlanTag;
use tracing::{error, info};

/// Open vSwitch bridge provisioning daemon
#[derive(Parser, Debug)]
#[command(name = "ovsbridged")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Bridge name, overriding network.bridge_name
    #[arg(short = 'b', long)]
    bridge: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the bridge and attach the host uplink
    Setup,
    /// Remove the bridge
    Teardown,
    /// Add a port to the bridge
    AddPort {
        port: String,
        /// VLAN tag; 0 leaves the port untagged
        #[arg(long, default_value_t = 0)]
        tag: u16,
        /// Create an OVS internal port
        #[arg(long, conflicts_with = "vxlan_remote")]
        internal: bool,
        /// Create a VXLAN tunnel port to this remote
        #[arg(long)]
        vxlan_remote: Option<IpAddr>,
    },
    /// Remove a port from the bridge
    DelPort { port: String },
    /// List bridges and their ports
    Show,
}

fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .init();
}

async fn run(args: Args) -> Result<()> {
    let mut config = load_config_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(bridge) = args.bridge {
        config.network.bridge_name = bridge;
        config.validate()?;
    }
    let network = config.network.clone();

    let driver = BridgeDriver::init(&config, Arc::new(IpCommandHost::default()))
        .await
        .with_context(|| format!("connecting to {}", config.ovsdb.endpoint))?;

    let result = match args.command {
        Command::Setup => driver.create_network(&network).await,
        Command::Teardown => driver.delete_network(&network).await,
        Command::AddPort {
            port,
            tag,
            internal,
            vxlan_remote,
        } => {
            let kind = match (internal, vxlan_remote) {
                (_, Some(remote_ip)) => PortKind::Vxlan { remote_ip },
                (true, None) => PortKind::Internal,
                (false, None) => PortKind::System,
            };
            let tag = VlanTag::new(tag).context("invalid --tag")?;
            driver.add_port(&network.bridge_name, &port, kind, tag).await
        }
        Command::DelPort { port } => driver.delete_port(&network.bridge_name, &port).await,
        Command::Show => {
            for bridge in driver.bridges() {
                println!("{}", bridge.name);
                for port in bridge.ports {
                    println!("    {}", port);
                }
            }
            Ok(())
        }
    };

    driver.shutdown().await;
    result.with_context(|| format!("bridge {}", network.bridge_name))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(config = %args.config.display(), command = ?args.command, "Starting ovsbridged");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
