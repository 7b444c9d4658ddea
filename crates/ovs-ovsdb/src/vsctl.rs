//! `ovs-vsctl` compatibility path.
//!
//! Used when a native transaction fails. Only the exit status is observed.

use ovs_cfgmgr_common::shell::{self, shellquote, OVS_VSCTL_CMD};
use ovs_cfgmgr_common::CfgMgrResult;
use ovs_types::{MacAddress, VlanTag};
use tracing::info;

use crate::bridge::PortKind;

/// Thin wrapper around the `ovs-vsctl` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vsctl {
    cmd: String,
}

impl Default for Vsctl {
    fn default() -> Self {
        Self::new(OVS_VSCTL_CMD)
    }
}

impl Vsctl {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }

    /// Builds the shell command line for `args`, each argument quoted.
    pub fn command_line(&self, args: &[&str]) -> String {
        let mut line = self.cmd.clone();
        for arg in args {
            line.push(' ');
            line.push_str(&shellquote(arg));
        }
        line
    }

    async fn run(&self, args: &[&str]) -> CfgMgrResult<()> {
        shell::exec_or_throw(&self.command_line(args)).await?;
        Ok(())
    }

    /// `ovs-vsctl add-br <bridge>`, then sets `other-config:hwaddr` if asked.
    pub async fn add_br(&self, bridge: &str, hwaddr: Option<MacAddress>) -> CfgMgrResult<()> {
        self.run(&["add-br", bridge]).await?;
        if let Some(mac) = hwaddr {
            let arg = format!("other-config:hwaddr={}", mac);
            self.run(&["set", "bridge", bridge, &arg]).await?;
            info!(bridge, %mac, "Set bridge hardware address via ovs-vsctl");
        }
        Ok(())
    }

    pub async fn del_br(&self, bridge: &str) -> CfgMgrResult<()> {
        self.run(&["--if-exists", "del-br", bridge]).await
    }

    pub async fn add_port(&self, bridge: &str, port: &str) -> CfgMgrResult<()> {
        self.add_typed_port(bridge, port, PortKind::System, VlanTag::UNTAGGED)
            .await
    }

    /// `ovs-vsctl add-port` with the access tag and interface type the
    /// native transaction would have written.
    pub async fn add_typed_port(
        &self,
        bridge: &str,
        port: &str,
        kind: PortKind,
        tag: VlanTag,
    ) -> CfgMgrResult<()> {
        let args = add_port_args(bridge, port, kind, tag);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args).await
    }

    pub async fn del_port(&self, bridge: &str, port: &str) -> CfgMgrResult<()> {
        self.run(&["--if-exists", "del-port", bridge, port]).await
    }
}

fn add_port_args(bridge: &str, port: &str, kind: PortKind, tag: VlanTag) -> Vec<String> {
    let mut args = vec!["add-port".to_string(), bridge.to_string(), port.to_string()];
    if !tag.is_untagged() {
        args.push(format!("tag={}", tag.as_u16()));
    }
    match kind {
        PortKind::System => {}
        PortKind::Internal => {
            args.extend(["--", "set", "Interface", port, "type=internal"].map(String::from));
        }
        PortKind::Vxlan { remote_ip } => {
            args.extend(["--", "set", "Interface", port, "type=vxlan"].map(String::from));
            args.push(format!("options:remote_ip={}", remote_ip));
        }
    }
    args
}
