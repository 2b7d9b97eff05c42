//! DiscoverDevicesUseCase: finds Bjorn devices and keeps the device list live.
//!
//! The [`DiscoveryEngine`] owns four background activities, each on its own
//! named thread:
//!
//! ```text
//! start()
//!  ├─ bjorn-mdns      service-broadcast listener (_ssh._tcp, _workstation._tcp)
//!  ├─ bjorn-sweep     one-shot subnet sweep (gateway /24 + USB + Bluetooth)
//!  │    └─ bjorn-poll liveness poller, started once the sweep completes
//!  └─ bjorn-stale     staleness sweeper
//! ```
//!
//! mDNS is fast but does not cross every link (USB gadget interfaces in
//! particular), so the SSH port of every host in the candidate subnets is
//! probed once.  After that only the management web port of already-known
//! addresses is polled.
//!
//! All activities feed the same sighting pipeline ([`DiscoveryEngine::observe`])
//! which filters, deduplicates through the [`DeviceRegistry`] and emits
//! `device_found` events.
//!
//! # Architecture
//!
//! This use case depends only on the traits below.  The infrastructure layer
//! provides TCP, DNS, mDNS and interface-table implementations; tests inject
//! mocks.
//!
//! # Shutdown
//!
//! Every loop checks a shared `running` flag and sleeps in short slices, so
//! [`DiscoveryEngine::stop`] returns within about a second.  Joins are
//! bounded: a thread that does not finish in time is detached and logged.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, RwLock,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bjorn_core::{
    is_device_hostname, normalize_hostname, DeviceRegistry, Event, EventSink, Ipv4Subnet,
    LogLevel, NetworkSegment, BLUETOOTH_SUBNET, USB_SUBNET,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// mDNS service types browsed by the listener.
pub const SERVICE_TYPES: [&str; 2] = ["_ssh._tcp.local.", "_workstation._tcp.local."];

/// Router addresses that are never a Bjorn device.
pub const WELL_KNOWN_ROUTERS: [Ipv4Addr; 4] = [
    Ipv4Addr::new(192, 168, 1, 1),
    Ipv4Addr::new(192, 168, 0, 1),
    Ipv4Addr::new(192, 168, 1, 254),
    Ipv4Addr::new(10, 0, 0, 1),
];

/// Longest single sleep inside a background loop.
const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// How long the mDNS listener blocks on its channel before re-checking the
/// running flag.
const LISTENER_RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The mDNS daemon or one of its browsers could not be started.
    #[error("service browser failed: {0}")]
    Browse(String),
    /// A background thread could not be spawned.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

// ── Ports (implemented by infrastructure) ─────────────────────────────────────

/// TCP reachability probe.
#[cfg_attr(test, mockall::automock)]
pub trait NetworkProbe: Send + Sync {
    /// Returns `true` if a TCP connection to `addr:port` succeeds within `timeout`.
    fn is_port_open(&self, addr: IpAddr, port: u16, timeout: Duration) -> bool;
}

/// Reverse name resolution.
#[cfg_attr(test, mockall::automock)]
pub trait NameResolver: Send + Sync {
    fn reverse_lookup(&self, addr: IpAddr) -> Option<String>;
}

/// Facts about the host's own network configuration.
#[cfg_attr(test, mockall::automock)]
pub trait LocalNetwork: Send + Sync {
    /// Gateway of the default route.
    fn default_gateway(&self) -> Option<Ipv4Addr>;
    /// Every gateway in the routing table, default included.
    fn gateways(&self) -> Vec<Ipv4Addr>;
    /// Addresses assigned to this machine's interfaces.
    fn interface_addresses(&self) -> Vec<IpAddr>;
}

/// A resolved mDNS advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Server hostname (e.g. `bjorn.local.`), or the instance name when the
    /// record carries no server.
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
}

/// Service-broadcast browser.
///
/// The production implementation wraps an mDNS daemon; tests push
/// advertisements through a channel.
pub trait ServiceBrowser: Send + Sync {
    /// Starts browsing `service_types` and returns a receiver of resolved
    /// advertisements.  The receiver disconnects after [`ServiceBrowser::stop`].
    fn start(&self, service_types: &[&str]) -> Result<Receiver<Advertisement>, DiscoveryError>;
    /// Stops browsing and releases the sockets.
    fn stop(&self);
}

/// The infrastructure a [`DiscoveryEngine`] runs on.
#[derive(Clone)]
pub struct DiscoveryPorts {
    pub probe: Arc<dyn NetworkProbe>,
    pub resolver: Arc<dyn NameResolver>,
    pub browser: Arc<dyn ServiceBrowser>,
    pub local: Arc<dyn LocalNetwork>,
}

// ── Configuration and state types ─────────────────────────────────────────────

/// Tunables of the discovery engine.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Only accept hosts whose name follows the device naming convention.
    pub strict_mode: bool,
    /// Port probed by the subnet sweep.
    pub ssh_port: u16,
    /// Management web UI port probed for `webapp_status`.
    pub webapp_port: u16,
    /// Fixed subnets swept in addition to the gateway /24.
    pub subnets: Vec<Ipv4Subnet>,
    /// Extra addresses that are never reported.
    pub ignored_addresses: Vec<IpAddr>,
    pub stale_timeout: Duration,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub ssh_probe_timeout: Duration,
    pub webapp_probe_timeout: Duration,
    /// Concurrent probes per swept network.
    pub sweep_workers: usize,
    /// Concurrent probes per liveness cycle.
    pub poll_workers: usize,
    /// Bounded wait per thread in [`DiscoveryEngine::stop`].
    pub join_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            strict_mode: true,
            ssh_port: 22,
            webapp_port: 8000,
            subnets: vec![BLUETOOTH_SUBNET, USB_SUBNET],
            ignored_addresses: Vec::new(),
            stale_timeout: Duration::from_secs(90),
            poll_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            ssh_probe_timeout: Duration::from_millis(400),
            webapp_probe_timeout: Duration::from_millis(350),
            sweep_workers: 24,
            poll_workers: 8,
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// Lifecycle of a [`DiscoveryEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// An address currently associated with a device and the last known
/// reachability of its web UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub address: IpAddr,
    pub webapp_reachable: bool,
}

// ── Engine ────────────────────────────────────────────────────────────────────

struct Control {
    state: EngineState,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

/// State shared between the engine handle and its background threads.
struct Shared {
    config: DiscoveryConfig,
    ports: DiscoveryPorts,
    sink: Arc<dyn EventSink>,
    registry: DeviceRegistry,
    /// Addresses accepted by the sighting pipeline; polled for liveness.
    seen: Mutex<BTreeSet<IpAddr>>,
    webapp: Mutex<HashMap<IpAddr, bool>>,
    ignored: RwLock<HashSet<IpAddr>>,
    running: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the discovery activities.  See the module docs.
pub struct DiscoveryEngine {
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DiscoveryEngine {
    /// Creates a stopped engine with an in-memory registry.
    ///
    /// The ignore-list (gateways, well-known routers, own addresses) is
    /// computed here, once.
    pub fn new(config: DiscoveryConfig, ports: DiscoveryPorts, sink: Arc<dyn EventSink>) -> Self {
        Self::with_registry(config, ports, sink, DeviceRegistry::new())
    }

    /// Like [`DiscoveryEngine::new`] with a caller-built registry (e.g. one
    /// backed by a persistent alias store).
    pub fn with_registry(
        config: DiscoveryConfig,
        ports: DiscoveryPorts,
        sink: Arc<dyn EventSink>,
        registry: DeviceRegistry,
    ) -> Self {
        let shared = Arc::new(Shared {
            config,
            ports,
            sink,
            registry,
            seen: Mutex::new(BTreeSet::new()),
            webapp: Mutex::new(HashMap::new()),
            ignored: RwLock::new(HashSet::new()),
            running: AtomicBool::new(false),
            poller: Mutex::new(None),
        });
        shared.build_ignore_list();
        Self {
            shared,
            control: Mutex::new(Control {
                state: EngineState::Stopped,
                workers: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        lock(&self.control).state
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.shared.registry
    }

    /// Snapshot of every accepted address with its last web UI status.
    pub fn discovered_addresses(&self) -> Vec<DiscoveredAddress> {
        let seen = lock(&self.shared.seen).clone();
        let webapp = lock(&self.shared.webapp);
        seen.into_iter()
            .map(|address| DiscoveredAddress {
                address,
                webapp_reachable: webapp.get(&address).copied().unwrap_or(false),
            })
            .collect()
    }

    /// Returns `true` if `addr` is on the ignore-list.
    pub fn is_ignored(&self, addr: IpAddr) -> bool {
        self.shared.is_ignored(addr)
    }

    /// Starts the four discovery activities.
    ///
    /// Only acts from [`EngineState::Stopped`]; returns `false` otherwise.
    /// An activity that fails to start is logged and skipped.
    pub fn start(&self) -> bool {
        let mut control = lock(&self.control);
        if control.state != EngineState::Stopped {
            debug!("discovery start ignored in state {:?}", control.state);
            return false;
        }
        control.state = EngineState::Starting;
        self.shared.log("Starting network discovery...", LogLevel::Info);
        self.shared.running.store(true, Ordering::SeqCst);

        match self.shared.ports.browser.start(&SERVICE_TYPES) {
            Ok(rx) => {
                let shared = Arc::clone(&self.shared);
                if let Some(h) = spawn_activity(&self.shared, "bjorn-mdns", move || {
                    shared.listen(rx);
                }) {
                    control.workers.push(("bjorn-mdns", h));
                    self.shared.log("mDNS browsers started", LogLevel::Info);
                }
            }
            Err(e) => self
                .shared
                .log(&format!("mDNS browser failed: {e}"), LogLevel::Error),
        }

        let shared = Arc::clone(&self.shared);
        if let Some(h) = spawn_activity(&self.shared, "bjorn-sweep", move || {
            shared.sweep_subnets();
        }) {
            control.workers.push(("bjorn-sweep", h));
        }

        let shared = Arc::clone(&self.shared);
        if let Some(h) = spawn_activity(&self.shared, "bjorn-stale", move || {
            shared.staleness_loop();
        }) {
            control.workers.push(("bjorn-stale", h));
        }

        control.state = EngineState::Running;
        true
    }

    /// Stops every activity and waits for them, each for at most
    /// `join_timeout`.  Calling it on a stopped engine does nothing.
    pub fn stop(&self) {
        let mut control = lock(&self.control);
        if control.state == EngineState::Stopped {
            return;
        }
        control.state = EngineState::Stopping;
        self.shared.log("Stopping network discovery...", LogLevel::Info);
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.ports.browser.stop();

        let timeout = self.shared.config.join_timeout;
        for (name, handle) in control.workers.drain(..) {
            join_bounded(name, handle, timeout);
        }
        // Taken after the sweep thread has been joined: it is the only writer.
        let poller = lock(&self.shared.poller).take();
        if let Some(handle) = poller {
            join_bounded("bjorn-poll", handle, timeout);
        }

        control.state = EngineState::Stopped;
        self.shared.log("Network discovery stopped", LogLevel::Info);
    }

    /// Stops, forgets every device and address, then starts again.
    pub fn reset(&self) {
        self.stop();
        self.shared.registry.clear();
        lock(&self.shared.seen).clear();
        lock(&self.shared.webapp).clear();
        self.start();
    }

    /// Runs one sighting through the pipeline.  Returns `true` when a
    /// `device_found` event was emitted.
    ///
    /// An empty `label` is replaced by a reverse lookup of `address`.
    pub fn observe(&self, label: &str, address: IpAddr) -> bool {
        self.shared.observe(label, address)
    }

    /// Evicts devices not seen for `stale_timeout` as of `now` and emits
    /// `device_gone` for each of their addresses.  Returns the number of
    /// evicted devices.
    pub fn sweep_stale(&self, now: Instant) -> usize {
        self.shared.sweep_stale(now)
    }

    /// Probes the web UI port of every accepted address once and emits
    /// `webapp_status` for each.
    pub fn poll_webapps(&self) {
        let addresses: Vec<IpAddr> = lock(&self.shared.seen).iter().copied().collect();
        self.shared.poll_webapps(&addresses, false);
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn log(&self, message: &str, level: LogLevel) {
        match level {
            LogLevel::Error => error!("{message}"),
            LogLevel::Warning => warn!("{message}"),
            _ => info!("{message}"),
        }
        self.sink.emit(Event::log(message, level));
    }

    fn build_ignore_list(&self) {
        let local = &self.ports.local;
        let mut ignored: HashSet<IpAddr> = HashSet::new();
        if let Some(gw) = local.default_gateway() {
            ignored.insert(IpAddr::V4(gw));
        }
        ignored.extend(local.gateways().into_iter().map(IpAddr::V4));
        ignored.extend(WELL_KNOWN_ROUTERS.iter().copied().map(IpAddr::V4));
        ignored.extend(local.interface_addresses());
        ignored.extend(self.config.ignored_addresses.iter().copied());
        debug!("ignore-list holds {} address(es)", ignored.len());
        *self.ignored.write().unwrap_or_else(PoisonError::into_inner) = ignored;
    }

    fn is_ignored(&self, addr: IpAddr) -> bool {
        self.ignored
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&addr)
    }

    // ── Sighting pipeline ────────────────────────────────────────────────────

    fn observe(&self, label: &str, address: IpAddr) -> bool {
        if self.is_ignored(address) {
            debug!("ignoring sighting of {address}: on the ignore-list");
            return false;
        }

        let label = if label.trim().is_empty() {
            self.ports.resolver.reverse_lookup(address).unwrap_or_default()
        } else {
            label.to_string()
        };
        let host = normalize_hostname(&label);
        let is_device = is_device_hostname(&host);
        if self.config.strict_mode && !is_device {
            debug!("ignoring sighting of {address}: {host:?} is not a device hostname");
            return false;
        }

        let device_key = if is_device { host } else { address.to_string() };
        let segment = NetworkSegment::classify(address);

        // `seen` is held across registration so a concurrent stale sweep
        // cannot drop the address between the two updates.
        let sighting = {
            let mut seen = lock(&self.seen);
            seen.insert(address);
            self.registry
                .register_sighting(&device_key, address, Instant::now())
        };
        if !sighting.is_news() {
            return false;
        }

        let reachable =
            self.ports
                .probe
                .is_port_open(address, self.config.webapp_port, self.config.webapp_probe_timeout);
        lock(&self.webapp).insert(address, reachable);

        let alias = format!("{} ({})", sighting.alias, segment.tag());
        info!("device found: {alias} at {address} (key={device_key}, webapp={reachable})");
        self.sink.emit(Event::DeviceFound {
            alias,
            address: address.to_string(),
            webapp_reachable: reachable,
        });
        true
    }

    // ── Activity 1: mDNS listener ────────────────────────────────────────────

    fn listen(&self, rx: Receiver<Advertisement>) {
        while self.is_running() {
            match rx.recv_timeout(LISTENER_RECV_TIMEOUT) {
                Ok(ad) => self.on_advertisement(&ad),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("mDNS listener stopped");
    }

    fn on_advertisement(&self, ad: &Advertisement) {
        if self.config.strict_mode && !is_device_hostname(&ad.hostname) {
            debug!("skipping advertisement from {:?}", ad.hostname);
            return;
        }
        for addr in ad.addresses.iter().filter(|a| a.is_ipv4()) {
            self.observe(&ad.hostname, *addr);
        }
    }

    // ── Activity 2: subnet sweep ─────────────────────────────────────────────

    fn scan_targets(&self) -> Vec<Ipv4Subnet> {
        let mut targets = Vec::new();
        if let Some(gw) = self.ports.local.default_gateway() {
            targets.push(Ipv4Subnet::slash24_of(gw));
        }
        for net in &self.config.subnets {
            if !targets.contains(net) {
                targets.push(*net);
            }
        }
        targets
    }

    fn sweep_subnets(self: &Arc<Self>) {
        let targets = self.scan_targets();
        self.log(
            &format!("Subnet sweep started ({} network(s))", targets.len()),
            LogLevel::Info,
        );
        for net in targets {
            if !self.is_running() {
                break;
            }
            debug!("sweeping {net} on port {}", self.config.ssh_port);
            self.sweep_network(net);
        }
        self.log("Subnet sweep completed", LogLevel::Info);
        self.start_poller();
    }

    fn sweep_network(&self, net: Ipv4Subnet) {
        let queue = Mutex::new(net.hosts().collect::<VecDeque<Ipv4Addr>>());
        thread::scope(|scope| {
            for i in 0..self.config.sweep_workers.max(1) {
                let worker = || {
                    while self.is_running() {
                        let Some(host) = lock(&queue).pop_front() else {
                            break;
                        };
                        let addr = IpAddr::V4(host);
                        if self.ports.probe.is_port_open(
                            addr,
                            self.config.ssh_port,
                            self.config.ssh_probe_timeout,
                        ) {
                            debug!("{addr} answers on port {}", self.config.ssh_port);
                            self.observe("", addr);
                        }
                    }
                };
                if let Err(e) = thread::Builder::new()
                    .name(format!("bjorn-sweep-{i}"))
                    .spawn_scoped(scope, worker)
                {
                    warn!("failed to spawn sweep worker: {e}");
                    break;
                }
            }
        });
    }

    fn start_poller(self: &Arc<Self>) {
        let mut slot = lock(&self.poller);
        if slot.is_some() || !self.is_running() {
            return;
        }
        let shared = Arc::clone(self);
        *slot = spawn_activity(self, "bjorn-poll", move || shared.poll_loop());
    }

    // ── Activity 3: liveness poller ──────────────────────────────────────────

    fn poll_loop(&self) {
        while self.is_running() {
            let addresses: Vec<IpAddr> = lock(&self.seen).iter().copied().collect();
            if !addresses.is_empty() {
                self.poll_webapps(&addresses, true);
            }
            self.sleep_while_running(self.config.poll_interval);
        }
        debug!("liveness poller stopped");
    }

    /// With `respect_stop` set, a stop request cuts the cycle short.
    fn poll_webapps(&self, addresses: &[IpAddr], respect_stop: bool) {
        let queue = Mutex::new(addresses.iter().copied().collect::<VecDeque<IpAddr>>());
        let probe_one = || loop {
            if respect_stop && !self.is_running() {
                break;
            }
            let Some(addr) = lock(&queue).pop_front() else {
                break;
            };
            let up = self.ports.probe.is_port_open(
                addr,
                self.config.webapp_port,
                self.config.webapp_probe_timeout,
            );
            lock(&self.webapp).insert(addr, up);
            self.sink.emit(Event::WebappStatus {
                address: addr.to_string(),
                reachable: up,
            });
        };
        thread::scope(|scope| {
            for i in 0..self.config.poll_workers.max(1) {
                if let Err(e) = thread::Builder::new()
                    .name(format!("bjorn-poll-{i}"))
                    .spawn_scoped(scope, probe_one)
                {
                    warn!("failed to spawn poll worker: {e}");
                    break;
                }
            }
        });
    }

    // ── Activity 4: staleness sweeper ────────────────────────────────────────

    fn staleness_loop(&self) {
        while self.is_running() {
            self.sweep_stale(Instant::now());
            self.sleep_while_running(self.config.sweep_interval);
        }
        debug!("staleness sweeper stopped");
    }

    fn sweep_stale(&self, now: Instant) -> usize {
        let evicted = {
            let mut seen = lock(&self.seen);
            let evicted = self.registry.sweep(now, self.config.stale_timeout);
            if !evicted.is_empty() {
                // An address may belong to another, still-live device key.
                let live: HashSet<IpAddr> = self.registry.addresses().into_iter().collect();
                let mut webapp = lock(&self.webapp);
                for addr in evicted.iter().flat_map(|d| &d.addresses) {
                    if !live.contains(addr) {
                        seen.remove(addr);
                        webapp.remove(addr);
                    }
                }
            }
            evicted
        };
        for device in &evicted {
            info!(
                "device gone: {} ({}), {} address(es)",
                device.alias,
                device.device_key,
                device.addresses.len()
            );
            for addr in &device.addresses {
                self.sink.emit(Event::DeviceGone {
                    address: addr.to_string(),
                });
            }
        }
        evicted.len()
    }

    fn sleep_while_running(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Spawns a named activity thread; a spawn failure is logged and `None`
/// returned so the remaining activities still start.
fn spawn_activity<F>(shared: &Shared, name: &'static str, f: F) -> Option<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    match thread::Builder::new().name(name.to_string()).spawn(f) {
        Ok(handle) => Some(handle),
        Err(source) => {
            let e = DiscoveryError::Spawn { name, source };
            shared.log(&e.to_string(), LogLevel::Error);
            None
        }
    }
}

/// Waits up to `timeout` for `handle`; detaches it if it is still running.
fn join_bounded(name: &str, handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{name} did not stop within {timeout:?}; detaching");
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    if handle.join().is_err() {
        error!("{name} thread panicked");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
