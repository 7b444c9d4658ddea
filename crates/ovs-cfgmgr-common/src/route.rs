//! Parser for the kernel IPv4 routing table exposed at `/proc/net/route`.
//!
//! The file is whitespace separated with a header line. Address columns
//! are 8 hex digits holding the address in host (little-endian) byte
//! order, so `0102A8C0` is `192.168.2.1`.
//!
//! ```text
//! Iface  Destination  Gateway   Flags  RefCnt  Use  Metric  Mask      MTU  Window  IRTT
//! eth0   00000000     0102A8C0  0003   0       0    100     00000000  0    0       0
//! ```

use std::net::Ipv4Addr;

use crate::error::{CfgMgrError, CfgMgrResult};

/// Default location of the kernel routing table.
pub const PROC_NET_ROUTE: &str = "/proc/net/route";

/// One row of the kernel routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRoute {
    pub iface: String,
    pub destination: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mask: Ipv4Addr,
}

/// A default IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    /// Device the route egresses through.
    pub device: String,
    /// Next hop; `0.0.0.0` for a device route such as a point-to-point tunnel.
    pub gateway: Ipv4Addr,
}

impl DefaultRoute {
    pub fn has_gateway(&self) -> bool {
        !self.gateway.is_unspecified()
    }
}

/// Parses the full contents of `/proc/net/route`.
///
/// Blank lines and the `Iface` header are skipped. A data line with fewer
/// than three columns or a malformed address is an error.
pub fn parse_route_table(content: &str) -> CfgMgrResult<Vec<KernelRoute>> {
    let mut routes = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() || line.starts_with("Iface") {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            return Err(CfgMgrError::parse(
                "route table",
                format!("too few columns in line '{}'", line),
            ));
        }

        let mask = match fields.get(7) {
            Some(m) => parse_hex_ipv4(m)?,
            None => Ipv4Addr::UNSPECIFIED,
        };

        routes.push(KernelRoute {
            iface: fields[0].to_string(),
            destination: parse_hex_ipv4(fields[1])?,
            gateway: parse_hex_ipv4(fields[2])?,
            mask,
        });
    }

    Ok(routes)
}

/// Every route whose destination is `0.0.0.0`, in table order.
pub fn default_routes(routes: &[KernelRoute]) -> Vec<DefaultRoute> {
    routes
        .iter()
        .filter(|r| r.destination.is_unspecified())
        .map(|r| DefaultRoute {
            device: r.iface.clone(),
            gateway: r.gateway,
        })
        .collect()
}

fn parse_hex_ipv4(field: &str) -> CfgMgrResult<Ipv4Addr> {
    if field.len() != 8 {
        return Err(CfgMgrError::parse(
            "route table",
            format!("'{}' is not an IPv4 address", field),
        ));
    }
    let raw = u32::from_str_radix(field, 16)
        .map_err(|e| CfgMgrError::parse("route table", format!("'{}': {}", field, e)))?;
    Ok(Ipv4Addr::from(raw.to_le_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TABLE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t0064A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
eth0\t00000000\t0164A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
docker0\t000011AC\t00000000\t0001\t0\t0\t0\t0000FFFF\t0\t0\t0
";

    #[test]
    fn test_parse_little_endian_addresses() {
        let routes = parse_route_table(TABLE).unwrap();
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0].destination, Ipv4Addr::new(192, 168, 100, 0));
        assert_eq!(routes[0].mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(routes[1].gateway, Ipv4Addr::new(192, 168, 100, 1));
        assert_eq!(routes[2].destination, Ipv4Addr::new(172, 17, 0, 0));
    }

    #[test]
    fn test_default_routes() {
        let routes = parse_route_table(TABLE).unwrap();
        assert_eq!(
            default_routes(&routes),
            vec![DefaultRoute {
                device: "eth0".to_string(),
                gateway: Ipv4Addr::new(192, 168, 100, 1),
            }]
        );
    }

    #[test]
    fn test_default_routes_keep_table_order() {
        let table = "Iface\tDestination\tGateway\n\
                     tun0\t00000000\t00000000\n\
                     eth0\t00000000\t010AA8C0\n";
        let routes = default_routes(&parse_route_table(table).unwrap());
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].device, "tun0");
        assert!(!routes[0].has_gateway());
        assert_eq!(routes[1].device, "eth0");
        assert_eq!(routes[1].gateway, Ipv4Addr::new(192, 168, 10, 1));
        assert!(routes[1].has_gateway());
    }

    #[test]
    fn test_no_default_route() {
        let table = "Iface\tDestination\tGateway\n\
                     eth0\t0064A8C0\t00000000\n";
        let routes = parse_route_table(table).unwrap();
        assert!(default_routes(&routes).is_empty());
    }

    #[test]
    fn test_rejects_ipv6_width_and_garbage() {
        assert!(parse_route_table("eth0\t0000000000000000\t00000000\n").is_err());
        assert!(parse_route_table("eth0\tZZZZZZZZ\t00000000\n").is_err());
        assert!(parse_route_table("eth0\n").is_err());
    }
}
