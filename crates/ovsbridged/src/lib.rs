//! ovsbridged - OVS bridge provisioning for container networks
//!
//! Brings up an Open vSwitch bridge through a plan of setup steps (create,
//! verify, loopback routing, device up, uplink attachment) and tears it
//! down again. Moving the host uplink onto the bridge runs as a
//! compensating command pipeline: if any host mutation fails, the ones
//! already applied are undone in reverse order.

pub mod commands;
pub mod config;
pub mod error;
pub mod network;
pub mod setup;
pub mod steps;

pub use commands::{CommandEnv, CommandManager, CommandStack, HostCommand, PipelineState};
pub use config::{load_config, load_config_or_default, BridgedConfig, DriverConfig, NetworkConfig};
pub use error::{ProvisionError, Result};
pub use network::{bridge_summaries, plan_network, BridgeDriver, BridgeSummary};
pub use setup::{BridgeSetup, SetupContext, SetupStep};
pub use steps::{AttachNic, DeviceUp, LoopbackAddressRouting, SetupDevice, VerifyInterface};
