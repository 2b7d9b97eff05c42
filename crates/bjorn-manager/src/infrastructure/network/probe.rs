//! TCP reachability probe and reverse DNS resolver.

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::debug;

use crate::application::discover_devices::{NameResolver, NetworkProbe};

/// Probes a port with a plain TCP connect.  The connection is dropped as soon
/// as it is established.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl NetworkProbe for TcpProbe {
    fn is_port_open(&self, addr: IpAddr, port: u16, timeout: Duration) -> bool {
        TcpStream::connect_timeout(&SocketAddr::new(addr, port), timeout).is_ok()
    }
}

/// Reverse lookup through the system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

impl NameResolver for DnsResolver {
    fn reverse_lookup(&self, addr: IpAddr) -> Option<String> {
        match dns_lookup::lookup_addr(&addr) {
            Ok(name) => meaningful_name(addr, name),
            Err(e) => {
                debug!("reverse lookup of {addr} failed: {e}");
                None
            }
        }
    }
}

/// Some resolvers answer with the numeric address itself; that is no name.
fn meaningful_name(addr: IpAddr, name: String) -> Option<String> {
    let trimmed = name.trim().trim_end_matches('.');
    if trimmed.is_empty() || trimmed.parse::<IpAddr>().is_ok_and(|ip| ip == addr) {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    #[test]
    fn test_probe_detects_listening_port() {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // Act
        let open = TcpProbe.is_port_open(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            Duration::from_millis(400),
        );

        // Assert
        assert!(open);
    }

    #[test]
    fn test_probe_reports_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!TcpProbe.is_port_open(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            Duration::from_millis(400)
        ));
    }

    #[test]
    fn test_numeric_answer_is_not_a_name() {
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(meaningful_name(addr, "10.0.0.5".to_string()), None);
        assert_eq!(meaningful_name(addr, String::new()), None);
        assert_eq!(
            meaningful_name(addr, "bjorn.lan".to_string()),
            Some("bjorn.lan".to_string())
        );
    }
}
