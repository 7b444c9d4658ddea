//! Recording in-memory [`HostNetwork`]
//!
//! Keeps links, addresses, routes and sysctls in memory, logs every
//! successful mutation, and fails calls selected by key. Keys have the form
//! `"<op> <device>"` (`"addr_add eth0"`, `"route_del eth0"`), or
//! `"route_flush_cache"` and `"write_sysctl <key>"`.

use async_trait::async_trait;
use ovs_cfgmgr_common::{CfgMgrError, CfgMgrResult, DefaultRoute, HostNetwork, Link, Route};
use ovs_types::InterfaceAddress;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

#[derive(Debug, Default)]
struct HostState {
    links: BTreeMap<String, Link>,
    next_index: u32,
    addresses: HashMap<String, Vec<InterfaceAddress>>,
    routes: Vec<Route>,
    sysctls: HashMap<String, String>,
    calls: Vec<String>,
    failures: HashSet<String>,
    failed: HashMap<String, usize>,
    no_route_table: bool,
}

/// Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an administratively up device, with the per-device sysctls the
    /// kernel creates alongside it.
    pub fn add_link(&self, name: &str, mtu: u32) -> Link {
        let mut s = self.state.lock();
        s.sysctls
            .entry(route_localnet_key(name))
            .or_insert_with(|| "0".to_string());
        s.next_index += 1;
        let link = Link {
            index: s.next_index,
            name: name.to_string(),
            mtu,
            up: true,
            loopback: name == "lo",
            point_to_point: name.starts_with("tun"),
            mac: None,
        };
        s.links.insert(name.to_string(), link.clone());
        link
    }

    /// Adds a device that is still down, like a freshly created bridge.
    pub fn add_down_link(&self, name: &str) -> Link {
        let mut link = self.add_link(name, 1500);
        link.up = false;
        self.state.lock().links.insert(name.to_string(), link.clone());
        link
    }

    pub fn remove_link(&self, name: &str) {
        let mut s = self.state.lock();
        s.links.remove(name);
        s.addresses.remove(name);
        s.routes.retain(|r| r.device != name);
        s.sysctls.remove(&route_localnet_key(name));
    }

    pub fn link(&self, name: &str) -> Option<Link> {
        self.state.lock().links.get(name).cloned()
    }

    pub fn set_address(&self, device: &str, address: InterfaceAddress) {
        self.state
            .lock()
            .addresses
            .entry(device.to_string())
            .or_default()
            .push(address);
    }

    pub fn addresses(&self, device: &str) -> Vec<InterfaceAddress> {
        self.state
            .lock()
            .addresses
            .get(device)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_default_route(&self, device: &str, gateway: Ipv4Addr) {
        self.state
            .lock()
            .routes
            .push(Route::default_via(IpAddr::V4(gateway), device));
    }

    /// Default route straight out of `device`, as a tunnel installs it.
    pub fn set_device_default_route(&self, device: &str) {
        self.state.lock().routes.push(Route {
            destination: None,
            gateway: None,
            device: device.to_string(),
        });
    }

    /// Makes the host look like one without `/proc/net/route`.
    pub fn hide_route_table(&self) {
        self.state.lock().no_route_table = true;
    }

    pub fn routes(&self) -> Vec<Route> {
        self.state.lock().routes.clone()
    }

    pub fn set_sysctl(&self, key: &str, value: &str) {
        self.state
            .lock()
            .sysctls
            .insert(key.to_string(), value.to_string());
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.state.lock().sysctls.get(key).cloned()
    }

    /// Makes every call matching `key` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, key: &str) {
        self.state.lock().failures.insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Successful mutations, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// How many calls matching `key` were failed on purpose.
    pub fn failed_calls(&self, key: &str) -> usize {
        self.state.lock().failed.get(key).copied().unwrap_or(0)
    }

    /// Runs `apply` unless `key` is marked to fail; logs `entry` on success.
    fn mutate<F>(&self, key: &str, entry: String, apply: F) -> CfgMgrResult<()>
    where
        F: FnOnce(&mut HostState) -> Result<(), String>,
    {
        let mut s = self.state.lock();
        if s.failures.contains(key) {
            *s.failed.entry(key.to_string()).or_default() += 1;
            return Err(CfgMgrError::ShellCommandFailed {
                command: key.to_string(),
                exit_code: 2,
                output: "injected failure".to_string(),
            });
        }
        apply(&mut s).map_err(|output| CfgMgrError::ShellCommandFailed {
            command: entry.clone(),
            exit_code: 2,
            output,
        })?;
        s.calls.push(entry);
        Ok(())
    }
}

fn route_localnet_key(device: &str) -> String {
    format!("net/ipv4/conf/{}/route_localnet", device)
}

fn present(s: &HostState, name: &str) -> Result<(), String> {
    if s.links.contains_key(name) {
        Ok(())
    } else {
        Err(format!("Cannot find device \"{}\"", name))
    }
}

#[async_trait]
impl HostNetwork for FakeHost {
    async fn link_by_name(&self, name: &str) -> CfgMgrResult<Option<Link>> {
        Ok(self.link(name))
    }

    async fn link_set_up(&self, link: &Link) -> CfgMgrResult<()> {
        let name = link.name.clone();
        self.mutate(
            &format!("link_set_up {}", name),
            format!("link_set_up {}", name),
            |s| {
                present(s, &name)?;
                if let Some(l) = s.links.get_mut(&name) {
                    l.up = true;
                }
                Ok(())
            },
        )
    }

    async fn link_set_mtu(&self, link: &Link, mtu: u32) -> CfgMgrResult<()> {
        let name = link.name.clone();
        self.mutate(
            &format!("link_set_mtu {}", name),
            format!("link_set_mtu {} {}", name, mtu),
            |s| {
                present(s, &name)?;
                if let Some(l) = s.links.get_mut(&name) {
                    l.mtu = mtu;
                }
                Ok(())
            },
        )
    }

    async fn addr_add(&self, link: &Link, addr: &InterfaceAddress) -> CfgMgrResult<()> {
        let name = link.name.clone();
        let addr = *addr;
        self.mutate(
            &format!("addr_add {}", name),
            format!("addr_add {} {}", name, addr),
            |s| {
                present(s, &name)?;
                let list = s.addresses.entry(name.clone()).or_default();
                if list.contains(&addr) {
                    return Err("RTNETLINK answers: File exists".to_string());
                }
                list.push(addr);
                Ok(())
            },
        )
    }

    async fn addr_del(&self, link: &Link, addr: &InterfaceAddress) -> CfgMgrResult<()> {
        let name = link.name.clone();
        let addr = *addr;
        self.mutate(
            &format!("addr_del {}", name),
            format!("addr_del {} {}", name, addr),
            |s| {
                present(s, &name)?;
                let list = s.addresses.entry(name.clone()).or_default();
                let before = list.len();
                list.retain(|a| a != &addr);
                if list.len() == before {
                    return Err("RTNETLINK answers: Cannot assign requested address".to_string());
                }
                Ok(())
            },
        )
    }

    async fn route_add(&self, route: &Route) -> CfgMgrResult<()> {
        let route = route.clone();
        self.mutate(
            &format!("route_add {}", route.device),
            format!("route_add {}", route),
            |s| {
                present(s, &route.device)?;
                if s.routes.contains(&route) {
                    return Err("RTNETLINK answers: File exists".to_string());
                }
                s.routes.push(route.clone());
                Ok(())
            },
        )
    }

    async fn route_del(&self, route: &Route) -> CfgMgrResult<()> {
        let route = route.clone();
        self.mutate(
            &format!("route_del {}", route.device),
            format!("route_del {}", route),
            |s| {
                let before = s.routes.len();
                s.routes.retain(|r| r != &route);
                if s.routes.len() == before {
                    return Err("RTNETLINK answers: No such process".to_string());
                }
                Ok(())
            },
        )
    }

    async fn route_flush_cache(&self) -> CfgMgrResult<()> {
        self.mutate("route_flush_cache", "route_flush_cache".to_string(), |_| Ok(()))
    }

    async fn read_sysctl(&self, key: &str) -> CfgMgrResult<String> {
        self.sysctl(key).ok_or_else(|| CfgMgrError::Sysctl {
            key: key.to_string(),
            path: format!("/proc/sys/{}", key).into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }

    async fn write_sysctl(&self, key: &str, value: &str) -> CfgMgrResult<()> {
        let (k, v) = (key.to_string(), value.to_string());
        self.mutate(
            &format!("write_sysctl {}", key),
            format!("write_sysctl {}={}", key, value),
            |s| {
                s.sysctls.insert(k, v);
                Ok(())
            },
        )
    }

    async fn default_routes(&self) -> CfgMgrResult<Option<Vec<DefaultRoute>>> {
        let s = self.state.lock();
        if s.no_route_table {
            return Ok(None);
        }
        let routes = s
            .routes
            .iter()
            .filter(|r| r.destination.is_none())
            .filter_map(|r| {
                let gateway = match r.gateway {
                    Some(IpAddr::V4(gw)) => gw,
                    Some(IpAddr::V6(_)) => return None,
                    None => Ipv4Addr::UNSPECIFIED,
                };
                Some(DefaultRoute {
                    device: r.device.clone(),
                    gateway,
                })
            })
            .collect();
        Ok(Some(routes))
    }

    async fn links(&self) -> CfgMgrResult<Vec<Link>> {
        let mut links: Vec<Link> = self.state.lock().links.values().cloned().collect();
        links.sort_by_key(|l| l.index);
        Ok(links)
    }

    async fn interface_ipv4(&self, name: &str) -> CfgMgrResult<Option<InterfaceAddress>> {
        let s = self.state.lock();
        match s.links.get(name) {
            Some(link) if link.up => {}
            _ => return Ok(None),
        }
        Ok(s.addresses
            .get(name)
            .and_then(|list| list.iter().copied().find(InterfaceAddress::is_usable_ipv4)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_mutations_are_logged_and_applied() {
        let host = FakeHost::new();
        let eth0 = host.add_link("eth0", 1500);
        let addr: InterfaceAddress = "192.168.1.10/24".parse().unwrap();

        host.addr_add(&eth0, &addr).await.unwrap();
        assert!(host.addr_add(&eth0, &addr).await.is_err());
        assert_eq!(host.addresses("eth0"), vec![addr]);
        assert_eq!(host.calls(), vec!["addr_add eth0 192.168.1.10/24"]);
    }

    #[tokio::test]
    async fn test_injected_failures_are_counted() {
        let host = FakeHost::new();
        host.fail_on("route_flush_cache");
        assert_err!(host.route_flush_cache().await);
        assert_err!(host.route_flush_cache().await);
        assert_eq!(host.failed_calls("route_flush_cache"), 2);
        assert!(host.calls().is_empty());

        host.clear_failures();
        assert_ok!(host.route_flush_cache().await);
        assert_eq!(host.calls(), vec!["route_flush_cache"]);
    }

    #[tokio::test]
    async fn test_default_route_and_uplink_address() {
        let host = FakeHost::new();
        host.add_link("eth0", 1500);
        host.set_address("eth0", "127.0.0.1/8".parse().unwrap());
        host.set_address("eth0", "10.1.2.3/16".parse().unwrap());
        host.set_default_route("eth0", Ipv4Addr::new(10, 1, 0, 1));

        let defaults = host.default_routes().await.unwrap().unwrap();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].device, "eth0");
        assert_eq!(
            host.interface_ipv4("eth0").await.unwrap(),
            Some("10.1.2.3/16".parse().unwrap())
        );

        host.add_down_link("ovs0");
        host.set_address("ovs0", "10.9.9.9/24".parse().unwrap());
        assert_eq!(host.interface_ipv4("ovs0").await.unwrap(), None);
    }
}
