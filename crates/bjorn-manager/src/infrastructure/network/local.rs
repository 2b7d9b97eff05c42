//! The host's own network facts: routing-table gateways and interface
//! addresses.
//!
//! Gateways come from `/proc/net/route`, so they are only known on Linux.
//! Elsewhere the default-gateway /24 is simply not swept; the fixed USB and
//! Bluetooth subnets still are.

use std::collections::BTreeSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};

use tracing::debug;

use crate::application::discover_devices::LocalNetwork;

const ROUTE_TABLE: &str = "/proc/net/route";

/// One row of the kernel IPv4 routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl Route {
    pub fn is_default(&self) -> bool {
        self.destination.is_unspecified()
    }
}

/// Parses `/proc/net/route`.  Addresses are little-endian hex; malformed
/// rows are skipped.
pub fn parse_route_table(text: &str) -> Vec<Route> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let _iface = cols.next()?;
            let destination = parse_hex_addr(cols.next()?)?;
            let gateway = parse_hex_addr(cols.next()?)?;
            Some(Route {
                destination,
                gateway,
            })
        })
        .collect()
}

fn parse_hex_addr(hex: &str) -> Option<Ipv4Addr> {
    let raw = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(raw.to_le_bytes()))
}

/// [`LocalNetwork`] backed by the running system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNetwork;

impl SystemNetwork {
    fn routes(&self) -> Vec<Route> {
        match fs::read_to_string(ROUTE_TABLE) {
            Ok(text) => parse_route_table(&text),
            Err(e) => {
                debug!("cannot read {ROUTE_TABLE}: {e}");
                Vec::new()
            }
        }
    }
}

impl LocalNetwork for SystemNetwork {
    fn default_gateway(&self) -> Option<Ipv4Addr> {
        self.routes()
            .into_iter()
            .find(|r| r.is_default() && !r.gateway.is_unspecified())
            .map(|r| r.gateway)
    }

    fn gateways(&self) -> Vec<Ipv4Addr> {
        let unique: BTreeSet<Ipv4Addr> = self
            .routes()
            .into_iter()
            .map(|r| r.gateway)
            .filter(|gw| !gw.is_unspecified())
            .collect();
        unique.into_iter().collect()
    }

    fn interface_addresses(&self) -> Vec<IpAddr> {
        match if_addrs::get_if_addrs() {
            Ok(ifaces) => ifaces.iter().map(|iface| iface.ip()).collect(),
            Err(e) => {
                debug!("cannot list interfaces: {e}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
wlan0\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0
wlan0\t0001A8C0\t00000000\t0001\t0\t0\t600\t00FFFFFF\t0\t0\t0
usb0\t000214AC\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
eth1\t0000000A\t0100000A\t0003\t0\t0\t100\t000000FF\t0\t0\t0
garbage line
";

    #[test]
    fn test_parse_route_table_decodes_little_endian_hex() {
        // Act
        let routes = parse_route_table(SAMPLE);

        // Assert
        assert_eq!(routes.len(), 4);
        assert!(routes[0].is_default());
        assert_eq!(routes[0].gateway, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(routes[2].destination, Ipv4Addr::new(172, 20, 2, 0));
        assert_eq!(routes[3].gateway, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_empty_table_has_no_routes() {
        assert!(parse_route_table("").is_empty());
        assert!(parse_route_table("Iface\tDestination\tGateway\n").is_empty());
    }

    #[test]
    fn test_interface_addresses_include_loopback() {
        let addrs = SystemNetwork.interface_addresses();
        if !addrs.is_empty() {
            assert!(addrs.iter().any(IpAddr::is_loopback));
        }
    }
}
