//! Host network capability surface.
//!
//! [`HostNetwork`] is everything the bridge setup steps and compensating
//! commands need from the Linux network stack. [`IpCommandHost`] is the
//! production implementation, driving `ip(8)` through [`crate::shell`] and
//! reading `/proc` directly. Tests substitute a recording fake.

use async_trait::async_trait;
use ovs_types::{InterfaceAddress, MacAddress};
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use crate::error::{CfgMgrError, CfgMgrResult};
use crate::route::{default_routes, parse_route_table, DefaultRoute};
use crate::shell::{self, shellquote, IP_CMD};

/// A resolved network device.
///
/// Commands keep the `Link` they resolved during execute so their undo
/// acts on the same device without looking it up again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    pub up: bool,
    pub loopback: bool,
    pub point_to_point: bool,
    pub mac: Option<MacAddress>,
}

/// An IPv4/IPv6 route in the main table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// `None` is the default route.
    pub destination: Option<InterfaceAddress>,
    pub gateway: Option<IpAddr>,
    pub device: String,
}

impl Route {
    /// Default route through `gateway` on `device`.
    pub fn default_via(gateway: IpAddr, device: impl Into<String>) -> Self {
        Self {
            destination: None,
            gateway: Some(gateway),
            device: device.into(),
        }
    }

    /// Renders the route selector as accepted by `ip route add|del`.
    pub fn to_ip_args(&self) -> String {
        let mut args = match &self.destination {
            Some(dst) => shellquote(&dst.to_string()),
            None => "default".to_string(),
        };
        if let Some(gw) = &self.gateway {
            args.push_str(&format!(" via {}", shellquote(&gw.to_string())));
        }
        args.push_str(&format!(" dev {}", shellquote(&self.device)));
        args
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.destination {
            Some(dst) => write!(f, "{}", dst)?,
            None => write!(f, "default")?,
        }
        if let Some(gw) = &self.gateway {
            write!(f, " via {}", gw)?;
        }
        write!(f, " dev {}", self.device)
    }
}

/// The interface carrying the host's default route, with what is needed
/// to move its addressing onto a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostUplink {
    pub link: Link,
    pub address: InterfaceAddress,
    /// `None` when the uplink was picked without a routing table to consult.
    pub gateway: Option<IpAddr>,
}

/// Host-level network mutations and queries.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Looks up a device by name. `Ok(None)` if it does not exist.
    async fn link_by_name(&self, name: &str) -> CfgMgrResult<Option<Link>>;

    /// Sets the device administratively up.
    async fn link_set_up(&self, link: &Link) -> CfgMgrResult<()>;

    /// Sets the device MTU.
    async fn link_set_mtu(&self, link: &Link, mtu: u32) -> CfgMgrResult<()>;

    /// Assigns an address to the device.
    async fn addr_add(&self, link: &Link, addr: &InterfaceAddress) -> CfgMgrResult<()>;

    /// Removes an address from the device.
    async fn addr_del(&self, link: &Link, addr: &InterfaceAddress) -> CfgMgrResult<()>;

    /// Adds a route to the main table.
    async fn route_add(&self, route: &Route) -> CfgMgrResult<()>;

    /// Deletes a route from the main table.
    async fn route_del(&self, route: &Route) -> CfgMgrResult<()>;

    /// Flushes the kernel route cache.
    async fn route_flush_cache(&self) -> CfgMgrResult<()>;

    /// Reads a value below `/proc/sys`. `key` is slash separated, e.g.
    /// `net/ipv4/conf/ovs0/route_localnet`, so device names may contain dots.
    async fn read_sysctl(&self, key: &str) -> CfgMgrResult<String>;

    /// Writes a value below `/proc/sys`.
    async fn write_sysctl(&self, key: &str, value: &str) -> CfgMgrResult<()>;

    /// Default routes in kernel IPv4 table order. `Ok(None)` when the host
    /// exposes no routing table at all.
    async fn default_routes(&self) -> CfgMgrResult<Option<Vec<DefaultRoute>>>;

    /// Every device, ordered by index.
    async fn links(&self) -> CfgMgrResult<Vec<Link>>;

    /// First global-scope IPv4 address of `name`, only if the device is up.
    async fn interface_ipv4(&self, name: &str) -> CfgMgrResult<Option<InterfaceAddress>>;
}

/// Picks the interface that holds a default route and gathers its
/// address and gateway.
///
/// Default routes are tried in table order; device routes and devices
/// without a usable IPv4 address are passed over. With no routing table
/// the first up, non-loopback, non-point-to-point device with a usable
/// address is taken. `Ok(None)` when nothing qualifies.
pub async fn choose_host_uplink(host: &dyn HostNetwork) -> CfgMgrResult<Option<HostUplink>> {
    let Some(routes) = host.default_routes().await? else {
        debug!("No routing table, choosing uplink from interfaces");
        return choose_uplink_from_links(host).await;
    };

    for route in routes {
        if !route.has_gateway() {
            debug!(device = %route.device, "Skipping default route without gateway");
            continue;
        }
        let Some(link) = host.link_by_name(&route.device).await? else {
            debug!(device = %route.device, "Default route device vanished");
            continue;
        };
        let Some(address) = host.interface_ipv4(&link.name).await? else {
            debug!(device = %link.name, "Default route device has no usable IPv4 address");
            continue;
        };
        return Ok(Some(HostUplink {
            link,
            address,
            gateway: Some(IpAddr::V4(route.gateway)),
        }));
    }

    debug!("No usable default route on host");
    Ok(None)
}

async fn choose_uplink_from_links(host: &dyn HostNetwork) -> CfgMgrResult<Option<HostUplink>> {
    for link in host.links().await? {
        if !link.up || link.loopback || link.point_to_point {
            continue;
        }
        if let Some(address) = host.interface_ipv4(&link.name).await? {
            return Ok(Some(HostUplink {
                link,
                address,
                gateway: None,
            }));
        }
    }
    Ok(None)
}

/// [`HostNetwork`] backed by `/sbin/ip` and the `/proc` filesystem.
#[derive(Debug, Clone)]
pub struct IpCommandHost {
    proc_root: PathBuf,
}

impl Default for IpCommandHost {
    fn default() -> Self {
        Self::new()
    }
}

impl IpCommandHost {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Uses an alternate procfs mount, e.g. a host `/proc` bind-mounted
    /// into a container.
    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    fn sysctl_path(&self, key: &str) -> PathBuf {
        self.proc_root.join("sys").join(key.trim_start_matches('/'))
    }

    fn route_table_path(&self) -> PathBuf {
        self.proc_root.join("net").join("route")
    }
}

#[async_trait]
impl HostNetwork for IpCommandHost {
    #[instrument(skip(self))]
    async fn link_by_name(&self, name: &str) -> CfgMgrResult<Option<Link>> {
        let cmd = format!("{} -o link show dev {}", IP_CMD, shellquote(name));
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            let out = result.combined_output();
            if out.contains("does not exist") || out.contains("Cannot find device") {
                return Ok(None);
            }
            return Err(CfgMgrError::ShellCommandFailed {
                command: cmd,
                exit_code: result.exit_code,
                output: out,
            });
        }

        let line = result
            .stdout
            .lines()
            .next()
            .ok_or_else(|| CfgMgrError::parse("ip link", "empty output"))?;
        parse_link_line(line).map(Some)
    }

    async fn link_set_up(&self, link: &Link) -> CfgMgrResult<()> {
        let cmd = format!("{} link set dev {} up", IP_CMD, shellquote(&link.name));
        shell::exec_or_throw(&cmd).await?;
        Ok(())
    }

    async fn link_set_mtu(&self, link: &Link, mtu: u32) -> CfgMgrResult<()> {
        let cmd = format!(
            "{} link set dev {} mtu {}",
            IP_CMD,
            shellquote(&link.name),
            mtu
        );
        shell::exec_or_throw(&cmd).await?;
        Ok(())
    }

    async fn addr_add(&self, link: &Link, addr: &InterfaceAddress) -> CfgMgrResult<()> {
        let cmd = format!(
            "{} address add {} dev {}",
            IP_CMD,
            shellquote(&addr.to_string()),
            shellquote(&link.name)
        );
        shell::exec_or_throw(&cmd).await?;
        Ok(())
    }

    async fn addr_del(&self, link: &Link, addr: &InterfaceAddress) -> CfgMgrResult<()> {
        let cmd = format!(
            "{} address del {} dev {}",
            IP_CMD,
            shellquote(&addr.to_string()),
            shellquote(&link.name)
        );
        shell::exec_or_throw(&cmd).await?;
        Ok(())
    }

    async fn route_add(&self, route: &Route) -> CfgMgrResult<()> {
        let cmd = format!("{} route add {}", IP_CMD, route.to_ip_args());
        shell::exec_or_throw(&cmd).await?;
        Ok(())
    }

    async fn route_del(&self, route: &Route) -> CfgMgrResult<()> {
        let cmd = format!("{} route del {}", IP_CMD, route.to_ip_args());
        shell::exec_or_throw(&cmd).await?;
        Ok(())
    }

    async fn route_flush_cache(&self) -> CfgMgrResult<()> {
        shell::exec_or_throw(&format!("{} route flush cache", IP_CMD)).await?;
        Ok(())
    }

    async fn read_sysctl(&self, key: &str) -> CfgMgrResult<String> {
        let path = self.sysctl_path(key);
        tokio::fs::read_to_string(&path)
            .await
            .map(|v| v.trim().to_string())
            .map_err(|source| CfgMgrError::Sysctl {
                key: key.to_string(),
                path,
                source,
            })
    }

    async fn write_sysctl(&self, key: &str, value: &str) -> CfgMgrResult<()> {
        let path = self.sysctl_path(key);
        debug!(key, value, "Writing sysctl");
        tokio::fs::write(&path, format!("{}\n", value))
            .await
            .map_err(|source| CfgMgrError::Sysctl {
                key: key.to_string(),
                path,
                source,
            })
    }

    async fn default_routes(&self) -> CfgMgrResult<Option<Vec<DefaultRoute>>> {
        let path = self.route_table_path();
        let Some(content) = read_proc(&path).await? else {
            return Ok(None);
        };
        let routes = parse_route_table(&content)?;
        Ok(Some(default_routes(&routes)))
    }

    async fn links(&self) -> CfgMgrResult<Vec<Link>> {
        let output = shell::exec_or_throw(&format!("{} -o link show", IP_CMD)).await?;
        let mut links = output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_link_line)
            .collect::<CfgMgrResult<Vec<_>>>()?;
        links.sort_by_key(|l| l.index);
        Ok(links)
    }

    #[instrument(skip(self))]
    async fn interface_ipv4(&self, name: &str) -> CfgMgrResult<Option<InterfaceAddress>> {
        match self.link_by_name(name).await? {
            Some(link) if link.up => {}
            _ => return Ok(None),
        }

        let cmd = format!("{} -4 -o address show dev {}", IP_CMD, shellquote(name));
        let output = shell::exec_or_throw(&cmd).await?;
        Ok(parse_inet_addresses(&output)
            .into_iter()
            .find(InterfaceAddress::is_usable_ipv4))
    }
}

async fn read_proc(path: &Path) -> CfgMgrResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(c) => Ok(Some(c)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CfgMgrError::ProcRead {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Parses one line of `ip -o link show`.
///
/// ```text
/// 4: ovs0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UNKNOWN ...\    link/ether 5e:1d:9a:4b:7c:00 brd ff:ff:ff:ff:ff:ff
/// ```
pub fn parse_link_line(line: &str) -> CfgMgrResult<Link> {
    let bad = |msg: &str| CfgMgrError::parse("ip link", format!("{}: '{}'", msg, line));

    let (index, rest) = line.split_once(':').ok_or_else(|| bad("missing index"))?;
    let index: u32 = index.trim().parse().map_err(|_| bad("bad index"))?;

    let (name, rest) = rest.split_once(':').ok_or_else(|| bad("missing name"))?;
    // veth ends show up as "veth0@if5"
    let name = name.trim().split('@').next().unwrap_or_default().to_string();
    if name.is_empty() {
        return Err(bad("empty name"));
    }

    let flags: Vec<&str> = rest
        .find('<')
        .and_then(|s| {
            let open = &rest[s + 1..];
            open.find('>').map(|e| &open[..e])
        })
        .map(|f| f.split(',').collect())
        .unwrap_or_default();
    let has_flag = |flag: &str| flags.contains(&flag);

    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let value_after = |key: &str| {
        tokens
            .iter()
            .position(|t| *t == key)
            .and_then(|i| tokens.get(i + 1))
            .copied()
    };

    let mtu = value_after("mtu")
        .ok_or_else(|| bad("missing mtu"))?
        .parse()
        .map_err(|_| bad("bad mtu"))?;
    let mac = value_after("link/ether").and_then(|m| m.parse().ok());

    Ok(Link {
        index,
        name,
        mtu,
        up: has_flag("UP"),
        loopback: has_flag("LOOPBACK"),
        point_to_point: has_flag("POINTOPOINT"),
        mac,
    })
}

/// Extracts every `inet`/`inet6` address from `ip -o address show` output.
pub fn parse_inet_addresses(output: &str) -> Vec<InterfaceAddress> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let pos = tokens.iter().position(|t| *t == "inet" || *t == "inet6")?;
            tokens.get(pos + 1)?.parse().ok()
        })
        .collect()
}
