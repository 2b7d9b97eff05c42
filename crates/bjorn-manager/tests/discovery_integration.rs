//! Integration tests for the discovery engine.
//!
//! The engine runs with its real background threads against hand-written
//! fakes of the network seams: advertisements are pushed through a channel
//! browser, TCP probes answer from a fixed table, and the host's own network
//! facts are constants.  Events are collected through a plain
//! `std::sync::mpsc` channel, the same way a front-end would consume them.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bjorn_core::{Event, EventSink};
use bjorn_manager::application::discover_devices::{
    Advertisement, DiscoveryConfig, DiscoveryEngine, DiscoveryError, DiscoveryPorts, EngineState,
    LocalNetwork, NameResolver, NetworkProbe, ServiceBrowser,
};

// ── Fakes ─────────────────────────────────────────────────────────────────────

/// Answers probes from a fixed set of open `(address, port)` pairs.
#[derive(Default)]
struct FixedProbe {
    open: HashSet<(IpAddr, u16)>,
}

impl NetworkProbe for FixedProbe {
    fn is_port_open(&self, addr: IpAddr, port: u16, _timeout: Duration) -> bool {
        self.open.contains(&(addr, port))
    }
}

struct NoNames;

impl NameResolver for NoNames {
    fn reverse_lookup(&self, _addr: IpAddr) -> Option<String> {
        None
    }
}

/// A host on 192.168.1.0/24 behind 192.168.1.1.
struct HomeNetwork;

impl LocalNetwork for HomeNetwork {
    fn default_gateway(&self) -> Option<Ipv4Addr> {
        Some(Ipv4Addr::new(192, 168, 1, 1))
    }

    fn gateways(&self) -> Vec<Ipv4Addr> {
        vec![Ipv4Addr::new(192, 168, 1, 1)]
    }

    fn interface_addresses(&self) -> Vec<IpAddr> {
        vec![ip("192.168.1.20"), ip("127.0.0.1")]
    }
}

/// Lets the test play the part of the mDNS daemon.
#[derive(Default)]
struct ChannelBrowser {
    tx: Mutex<Option<Sender<Advertisement>>>,
}

impl ChannelBrowser {
    fn announce(&self, hostname: &str, addr: &str) {
        let tx = self.tx.lock().unwrap();
        tx.as_ref()
            .expect("browser not started")
            .send(Advertisement {
                hostname: hostname.to_string(),
                addresses: vec![ip(addr)],
            })
            .unwrap();
    }
}

impl ServiceBrowser for ChannelBrowser {
    fn start(&self, _service_types: &[&str]) -> Result<Receiver<Advertisement>, DiscoveryError> {
        let (tx, rx) = mpsc::channel();
        *self.tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    fn stop(&self) {
        self.tx.lock().unwrap().take();
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn quick_config() -> DiscoveryConfig {
    DiscoveryConfig {
        stale_timeout: Duration::from_secs(3600),
        poll_interval: Duration::from_secs(3600),
        ssh_probe_timeout: Duration::from_millis(1),
        webapp_probe_timeout: Duration::from_millis(1),
        join_timeout: Duration::from_secs(5),
        ..DiscoveryConfig::default()
    }
}

fn engine_with(
    probe: FixedProbe,
    browser: Arc<ChannelBrowser>,
) -> (DiscoveryEngine, Receiver<Event>) {
    let (tx, rx) = mpsc::channel();
    let ports = DiscoveryPorts {
        probe: Arc::new(probe),
        resolver: Arc::new(NoNames),
        browser,
        local: Arc::new(HomeNetwork),
    };
    let sink: Arc<dyn EventSink> = Arc::new(tx);
    (DiscoveryEngine::new(quick_config(), ports, sink), rx)
}

/// Waits for the next `device_found`, skipping every other event.
fn next_found(rx: &Receiver<Event>, within: Duration) -> Option<(String, String, bool)> {
    let deadline = Instant::now() + within;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(Event::DeviceFound {
                alias,
                address,
                webapp_reachable,
            }) => return Some((alias, address, webapp_reachable)),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

fn drain(rx: &Receiver<Event>) -> Vec<Event> {
    rx.try_iter().collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn test_device_seen_on_lan_then_usb_keeps_its_alias() {
    // Arrange: the device's web UI answers on its USB address only
    let browser = Arc::new(ChannelBrowser::default());
    let probe = FixedProbe {
        open: [(ip("172.20.2.7"), 8000)].into_iter().collect(),
    };
    let (engine, rx) = engine_with(probe, Arc::clone(&browser));
    assert!(engine.start());

    // Act
    browser.announce("bjorn-01.local.", "10.0.0.5");
    let first = next_found(&rx, Duration::from_secs(5));
    browser.announce("bjorn-01.local.", "172.20.2.7");
    let second = next_found(&rx, Duration::from_secs(5));

    // Assert
    assert_eq!(
        first,
        Some(("Device 1 (LAN)".to_string(), "10.0.0.5".to_string(), false))
    );
    assert_eq!(
        second,
        Some(("Device 1 (USB)".to_string(), "172.20.2.7".to_string(), true))
    );
    assert_eq!(engine.registry().len(), 1);

    engine.stop();
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[test]
fn test_repeated_advertisement_is_announced_once() {
    // Arrange
    let browser = Arc::new(ChannelBrowser::default());
    let (engine, rx) = engine_with(FixedProbe::default(), Arc::clone(&browser));
    assert!(engine.start());

    // Act
    browser.announce("bjorn.local.", "10.0.0.5");
    browser.announce("bjorn.local.", "10.0.0.5");
    let first = next_found(&rx, Duration::from_secs(5));
    let second = next_found(&rx, Duration::from_millis(500));

    // Assert
    assert!(first.is_some());
    assert_eq!(second, None);
    engine.stop();
}

#[test]
fn test_ignored_addresses_never_produce_events() {
    // Arrange: gateway, well-known router and own address, all "named" bjorn
    let (engine, rx) = engine_with(FixedProbe::default(), Arc::new(ChannelBrowser::default()));

    // Act
    let found = ["192.168.1.1", "10.0.0.1", "192.168.1.20"]
        .iter()
        .map(|a| engine.observe("bjorn", ip(a)))
        .collect::<Vec<_>>();

    // Assert
    assert_eq!(found, vec![false, false, false]);
    assert!(drain(&rx).is_empty());
    assert!(engine.registry().is_empty());
}

#[test]
fn test_strict_mode_skips_foreign_hosts() {
    // Arrange
    let (engine, rx) = engine_with(FixedProbe::default(), Arc::new(ChannelBrowser::default()));

    // Act
    let found = engine.observe("printer.local.", ip("192.168.1.40"));

    // Assert
    assert!(!found);
    assert!(drain(&rx).is_empty());
}

#[test]
fn test_stale_device_is_gone_exactly_once() {
    // Arrange
    let (engine, rx) = engine_with(FixedProbe::default(), Arc::new(ChannelBrowser::default()));
    assert!(engine.observe("bjorn-01", ip("10.0.0.5")));
    drain(&rx);
    let later = Instant::now() + Duration::from_secs(3601);

    // Act
    let first = engine.sweep_stale(later);
    let second = engine.sweep_stale(later);

    // Assert
    assert_eq!((first, second), (1, 0));
    let gone: Vec<Event> = drain(&rx)
        .into_iter()
        .filter(|e| matches!(e, Event::DeviceGone { .. }))
        .collect();
    assert_eq!(
        gone,
        vec![Event::DeviceGone {
            address: "10.0.0.5".to_string()
        }]
    );
    assert!(engine.discovered_addresses().is_empty());
}

#[test]
fn test_alias_number_is_reused_after_eviction() {
    // Arrange
    let (engine, rx) = engine_with(FixedProbe::default(), Arc::new(ChannelBrowser::default()));
    engine.observe("bjorn-01", ip("10.0.0.5"));
    engine.sweep_stale(Instant::now() + Duration::from_secs(3601));
    drain(&rx);

    // Act
    engine.observe("bjorn-02", ip("10.0.0.6"));

    // Assert
    let aliases: Vec<String> = drain(&rx)
        .into_iter()
        .filter_map(|e| match e {
            Event::DeviceFound { alias, .. } => Some(alias),
            _ => None,
        })
        .collect();
    assert_eq!(aliases, vec!["Device 1 (LAN)".to_string()]);
}

#[test]
fn test_manual_poll_reports_every_known_address() {
    // Arrange
    let probe = FixedProbe {
        open: [(ip("172.20.1.9"), 8000)].into_iter().collect(),
    };
    let (engine, rx) = engine_with(probe, Arc::new(ChannelBrowser::default()));
    engine.observe("bjorn", ip("172.20.1.9"));
    engine.observe("bjorn", ip("10.0.0.5"));
    drain(&rx);

    // Act
    engine.poll_webapps();

    // Assert
    let mut statuses: Vec<(String, bool)> = drain(&rx)
        .into_iter()
        .filter_map(|e| match e {
            Event::WebappStatus { address, reachable } => Some((address, reachable)),
            _ => None,
        })
        .collect();
    statuses.sort();
    assert_eq!(
        statuses,
        vec![
            ("10.0.0.5".to_string(), false),
            ("172.20.1.9".to_string(), true)
        ]
    );
}

#[test]
fn test_start_twice_is_rejected_and_restart_works() {
    // Arrange
    let (engine, _rx) = engine_with(FixedProbe::default(), Arc::new(ChannelBrowser::default()));

    // Act / Assert
    assert!(engine.start());
    assert!(!engine.start());
    engine.stop();
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(engine.start());
    engine.stop();
}
