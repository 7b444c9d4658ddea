//! Compensating host command pipeline
//!
//! Moving the host uplink onto the bridge takes several host mutations that
//! cannot be made atomic. Each [`HostCommand`] carries the state its forward
//! action acquired so the inverse can run without looking anything up again.
//! [`CommandManager`] runs them in order and, if one fails, undoes the ones
//! that succeeded in reverse order.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use ovs_cfgmgr_common::{CfgMgrError, HostNetwork, Link, Route};
use ovs_ovsdb::{OvsdbClient, OvsdbError, PortKind};
use ovs_types::{InterfaceAddress, VlanTag};
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};

/// Attempts at removing the uplink's original default route once the
/// bridge route is in place.
pub const STALE_ROUTE_RETRIES: u32 = 3;

pub const STALE_ROUTE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// What a command runs against.
#[derive(Clone, Copy)]
pub struct CommandEnv<'a> {
    pub host: &'a dyn HostNetwork,
    pub ovsdb: &'a OvsdbClient,
    pub stale_route_retry_interval: Duration,
}

impl<'a> CommandEnv<'a> {
    pub fn new(host: &'a dyn HostNetwork, ovsdb: &'a OvsdbClient) -> Self {
        Self {
            host,
            ovsdb,
            stale_route_retry_interval: STALE_ROUTE_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.stale_route_retry_interval = interval;
        self
    }

    async fn resolve(&self, name: &str) -> Result<Link> {
        self.host
            .link_by_name(name)
            .await?
            .ok_or_else(|| ProvisionError::InterfaceNotFound(name.to_string()))
    }
}

/// One undoable host mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// `ip addr add <address> dev <device>`
    AddAddress {
        device: String,
        address: InterfaceAddress,
        link: Option<Link>,
    },
    /// `ip addr del <address> dev <device>`
    RemoveAddress {
        device: String,
        address: InterfaceAddress,
        link: Option<Link>,
    },
    /// Adds `device` to `bridge` as a system port.
    AttachInterface {
        bridge: String,
        device: String,
        via_vsctl: bool,
    },
    /// Deletes the default route through `device`. A failed delete is not
    /// an error; `deleted` records whether anything needs restoring.
    DeleteRoute {
        device: String,
        gateway: IpAddr,
        deleted: Option<Route>,
    },
    /// Adds the default route through `bridge`, then clears out the stale
    /// one still pointing at `device`.
    AddRoute {
        bridge: String,
        device: String,
        gateway: IpAddr,
        added: Option<Route>,
    },
}

impl HostCommand {
    pub fn add_address(device: &str, address: InterfaceAddress) -> Self {
        HostCommand::AddAddress {
            device: device.to_string(),
            address,
            link: None,
        }
    }

    pub fn remove_address(device: &str, address: InterfaceAddress) -> Self {
        HostCommand::RemoveAddress {
            device: device.to_string(),
            address,
            link: None,
        }
    }

    pub fn attach_interface(bridge: &str, device: &str) -> Self {
        HostCommand::AttachInterface {
            bridge: bridge.to_string(),
            device: device.to_string(),
            via_vsctl: false,
        }
    }

    pub fn delete_route(device: &str, gateway: IpAddr) -> Self {
        HostCommand::DeleteRoute {
            device: device.to_string(),
            gateway,
            deleted: None,
        }
    }

    pub fn add_route(bridge: &str, device: &str, gateway: IpAddr) -> Self {
        HostCommand::AddRoute {
            bridge: bridge.to_string(),
            device: device.to_string(),
            gateway,
            added: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HostCommand::AddAddress { .. } => "add-address",
            HostCommand::RemoveAddress { .. } => "remove-address",
            HostCommand::AttachInterface { .. } => "attach-interface",
            HostCommand::DeleteRoute { .. } => "delete-route",
            HostCommand::AddRoute { .. } => "add-route",
        }
    }

    /// Runs the forward action, keeping whatever [`undo`](Self::undo) needs.
    pub async fn execute(&mut self, env: &CommandEnv<'_>) -> Result<()> {
        debug!(command = %self, "Executing");
        match self {
            HostCommand::AddAddress {
                device,
                address,
                link,
            } => {
                let found = env.resolve(device).await?;
                env.host.addr_add(&found, address).await?;
                *link = Some(found);
            }
            HostCommand::RemoveAddress {
                device,
                address,
                link,
            } => {
                let found = env.resolve(device).await?;
                env.host.addr_del(&found, address).await?;
                *link = Some(found);
            }
            HostCommand::AttachInterface {
                bridge,
                device,
                via_vsctl,
            } => {
                if let Err(e) = env
                    .ovsdb
                    .add_port(bridge, device, PortKind::System, VlanTag::UNTAGGED)
                    .await
                {
                    if e.is_connection_error() {
                        return Err(e.into());
                    }
                    warn!(bridge = %bridge, device = %device, error = %e,
                        "Native add-port failed, falling back to ovs-vsctl");
                    env.ovsdb
                        .vsctl()
                        .add_port(bridge, device)
                        .await
                        .map_err(OvsdbError::Fallback)?;
                    *via_vsctl = true;
                }
            }
            HostCommand::DeleteRoute {
                device,
                gateway,
                deleted,
            } => {
                env.resolve(device).await?;
                let route = Route::default_via(*gateway, device.as_str());
                match env.host.route_del(&route).await {
                    Ok(()) => *deleted = Some(route),
                    Err(e) => debug!(route = %route, error = %e, "Ignoring failed default route delete"),
                }
            }
            HostCommand::AddRoute {
                bridge,
                device,
                gateway,
                added,
            } => {
                env.resolve(bridge).await?;
                let route = Route::default_via(*gateway, bridge.as_str());
                env.host.route_add(&route).await?;
                *added = Some(route);

                flush_route_cache(env).await;
                remove_stale_route(env, &Route::default_via(*gateway, device.as_str())).await;
                flush_route_cache(env).await;
            }
        }
        Ok(())
    }

    /// Reverts a successful [`execute`](Self::execute).
    pub async fn undo(&self, env: &CommandEnv<'_>) -> Result<()> {
        debug!(command = %self, "Undoing");
        match self {
            HostCommand::AddAddress { address, link, .. } => {
                env.host.addr_del(executed(link)?, address).await?;
            }
            HostCommand::RemoveAddress { address, link, .. } => {
                env.host.addr_add(executed(link)?, address).await?;
            }
            HostCommand::AttachInterface {
                bridge,
                device,
                via_vsctl,
            } => {
                let native = if *via_vsctl {
                    None
                } else {
                    env.ovsdb.delete_port(bridge, device).await.err()
                };
                if *via_vsctl || native.is_some() {
                    env.ovsdb
                        .vsctl()
                        .del_port(bridge, device)
                        .await
                        .map_err(OvsdbError::Fallback)?;
                }
            }
            HostCommand::DeleteRoute { deleted, .. } => {
                if let Some(route) = deleted {
                    env.host.route_add(route).await?;
                }
            }
            HostCommand::AddRoute { added, .. } => {
                if let Some(route) = added {
                    env.host.route_del(route).await?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostCommand::AddAddress {
                device, address, ..
            } => write!(f, "add address {} to {}", address, device),
            HostCommand::RemoveAddress {
                device, address, ..
            } => write!(f, "remove address {} from {}", address, device),
            HostCommand::AttachInterface { bridge, device, .. } => {
                write!(f, "attach {} to bridge {}", device, bridge)
            }
            HostCommand::DeleteRoute {
                device, gateway, ..
            } => write!(f, "delete default route via {} dev {}", gateway, device),
            HostCommand::AddRoute {
                bridge, gateway, ..
            } => write!(f, "add default route via {} dev {}", gateway, bridge),
        }
    }
}

fn executed(link: &Option<Link>) -> Result<&Link> {
    link.as_ref()
        .ok_or_else(|| CfgMgrError::internal("undo of a command that never ran").into())
}

async fn flush_route_cache(env: &CommandEnv<'_>) {
    if let Err(e) = env.host.route_flush_cache().await {
        debug!(error = %e, "Ignoring route cache flush failure");
    }
}

async fn remove_stale_route(env: &CommandEnv<'_>, stale: &Route) {
    for attempt in 1..=STALE_ROUTE_RETRIES {
        match env.host.route_del(stale).await {
            Ok(()) => return,
            Err(e) => {
                debug!(route = %stale, attempt, error = %e, "Stale default route still present");
                if attempt < STALE_ROUTE_RETRIES {
                    tokio::time::sleep(env.stale_route_retry_interval).await;
                }
            }
        }
    }
    debug!(route = %stale, "Giving up on stale default route");
}

/// LIFO of executed commands, used only for unwinding.
#[derive(Debug, Default)]
pub struct CommandStack {
    commands: Vec<HostCommand>,
}

impl CommandStack {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, command: HostCommand) {
        self.commands.push(command);
    }

    pub fn pop(&mut self) -> Result<HostCommand> {
        self.commands.pop().ok_or(ProvisionError::EmptyStack)
    }

    pub fn peek(&self) -> Result<&HostCommand> {
        self.commands.last().ok_or(ProvisionError::EmptyStack)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Lifecycle of one [`CommandManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Committed,
    RolledBack,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Committed => "committed",
            PipelineState::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// Runs a fixed list of [`HostCommand`]s once, strictly in order.
#[derive(Debug)]
pub struct CommandManager {
    commands: Vec<HostCommand>,
    undo: CommandStack,
    state: PipelineState,
}

impl Default for CommandManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandManager {
    pub fn new() -> Self {
        Self {
            commands: Vec::with_capacity(5),
            undo: CommandStack::with_capacity(5),
            state: PipelineState::Idle,
        }
    }

    pub fn add_command(&mut self, command: HostCommand) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(ProvisionError::NotIdle(self.state));
        }
        self.commands.push(command);
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Executes every command. On the first failure, undoes the commands
    /// that already succeeded, newest first.
    ///
    /// If nothing had succeeded yet the failure is returned as is.
    /// Otherwise it comes back as [`ProvisionError::Rollback`] with the
    /// failure as `cause` and any undo failures alongside.
    pub async fn execute(&mut self, env: &CommandEnv<'_>) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(ProvisionError::NotIdle(self.state));
        }
        self.state = PipelineState::Running;

        for mut command in std::mem::take(&mut self.commands) {
            if let Err(cause) = command.execute(env).await {
                warn!(command = %command, error = %cause, "Command failed");
                self.state = PipelineState::RolledBack;
                if self.undo.is_empty() {
                    return Err(cause);
                }
                let undo_errors = self.unwind(env).await;
                return Err(ProvisionError::Rollback {
                    cause: Box::new(cause),
                    undo_errors,
                });
            }
            self.undo.push(command);
        }

        self.state = PipelineState::Committed;
        info!(commands = self.undo.len(), "Command pipeline committed");
        Ok(())
    }

    async fn unwind(&mut self, env: &CommandEnv<'_>) -> Vec<ProvisionError> {
        let mut errors = Vec::new();
        loop {
            let command = match self.undo.pop() {
                Ok(command) => command,
                Err(_) => break,
            };
            if let Err(e) = command.undo(env).await {
                warn!(command = %command, error = %e, "Undo failed");
                errors.push(e);
            }
        }
        errors
    }
}
