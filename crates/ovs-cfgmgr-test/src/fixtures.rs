//! Test fixtures for common host layouts

use std::net::Ipv4Addr;

use ovs_types::InterfaceAddress;

use crate::fake_host::FakeHost;

/// Uplink device of [`uplink_host`].
pub const UPLINK: &str = "eth0";

/// Address of the uplink in [`uplink_host`].
pub fn uplink_address() -> InterfaceAddress {
    InterfaceAddress::new(Ipv4Addr::new(192, 168, 10, 20).into(), 24)
        .expect("valid prefix length")
}

pub fn uplink_gateway() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 10, 1)
}

/// A host with loopback and one uplink holding the default route, running
/// a 5.x kernel with IP forwarding off.
pub fn uplink_host() -> FakeHost {
    let host = FakeHost::new();
    host.add_link("lo", 65536);
    host.set_address(
        "lo",
        InterfaceAddress::new(Ipv4Addr::LOCALHOST.into(), 8).expect("valid prefix length"),
    );
    host.add_link(UPLINK, 1500);
    host.set_address(UPLINK, uplink_address());
    host.set_default_route(UPLINK, uplink_gateway());
    host.set_sysctl("kernel/osrelease", "5.15.0-91-generic");
    host.set_sysctl("net/ipv4/ip_forward", "0");
    host
}
