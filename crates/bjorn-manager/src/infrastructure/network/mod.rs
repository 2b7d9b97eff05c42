//! Network adapters for the discovery engine.
//!
//! # Sub-modules
//!
//! - **`probe`** – TCP connect probe ([`probe::TcpProbe`]) and reverse DNS
//!   ([`probe::DnsResolver`]).
//!
//! - **`mdns`** – mDNS browser for `_ssh._tcp` and `_workstation._tcp`
//!   advertisements ([`mdns::MdnsBrowser`]).
//!
//! - **`local`** – gateways from the routing table and the host's own
//!   interface addresses ([`local::SystemNetwork`]), used for the sweep
//!   targets and the ignore-list.

pub mod local;
pub mod mdns;
pub mod probe;

use std::sync::Arc;

use crate::application::discover_devices::DiscoveryPorts;

/// Ports wired to the real network.
pub fn system_ports() -> DiscoveryPorts {
    DiscoveryPorts {
        probe: Arc::new(probe::TcpProbe),
        resolver: Arc::new(probe::DnsResolver),
        browser: Arc::new(mdns::MdnsBrowser::new()),
        local: Arc::new(local::SystemNetwork),
    }
}
