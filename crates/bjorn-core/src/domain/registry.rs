//! DeviceRegistry: the in-memory database of Bjorn devices seen on the network.
//!
//! Every sighting (an mDNS advertisement or an open SSH port found by the
//! subnet sweep) is reduced to a `(device_key, address)` pair.  The registry:
//!
//! - Deduplicates sightings so the same device reached over LAN, USB and
//!   Bluetooth is one entry with several addresses.
//! - Hands out human-readable aliases (`"Device 1"`, `"Device 2"` ...), always
//!   picking the lowest number not currently bound.
//! - Evicts entries whose `last_seen` is older than the staleness threshold.
//!
//! # Locking
//!
//! All state sits behind one `std::sync::Mutex`.  The lock is held only for
//! the map mutation itself; alias persistence happens on a copy after the
//! lock is released, so a slow disk never stalls the discovery threads.
//! Copies carry a generation number and saves are serialized behind a second
//! lock; a copy older than the last one written is skipped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Prefix of every allocated alias.
const ALIAS_PREFIX: &str = "Device ";

/// Error type for alias persistence back-ends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be read or written.
    #[error("alias store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored content could not be decoded or encoded.
    #[error("alias store format error: {0}")]
    Format(String),
}

/// Persistence seam for `device_key → alias` bindings.
///
/// The manager crate implements this with a TOML file; tests use an
/// in-memory fake.
pub trait AliasStore: Send + Sync {
    /// Loads every persisted binding.
    fn load(&self) -> Result<BTreeMap<String, String>, StoreError>;
    /// Replaces the persisted bindings with `aliases`.
    fn save(&self, aliases: &BTreeMap<String, String>) -> Result<(), StoreError>;
}

/// A device tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_key: String,
    pub alias: String,
    pub addresses: BTreeSet<IpAddr>,
    pub last_seen: Instant,
}

/// Outcome of [`DeviceRegistry::register_sighting`].
///
/// The caller emits a `device_found` event when either flag is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub is_new_device: bool,
    pub is_new_address: bool,
    /// Base alias of the device (without the segment tag).
    pub alias: String,
}

impl Sighting {
    /// `true` when the sighting should be announced.
    pub fn is_news(&self) -> bool {
        self.is_new_device || self.is_new_address
    }
}

/// A device removed by [`DeviceRegistry::sweep`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedDevice {
    pub device_key: String,
    pub alias: String,
    pub addresses: Vec<IpAddr>,
}

#[derive(Default)]
struct RegistryState {
    devices: HashMap<String, DeviceRecord>,
    aliases: BTreeMap<String, String>,
    /// Bumped on every alias change.
    generation: u64,
}

/// Alias bindings as of one generation, waiting to be saved.
struct AliasSnapshot {
    generation: u64,
    aliases: BTreeMap<String, String>,
}

impl RegistryState {
    fn snapshot(&mut self) -> AliasSnapshot {
        self.generation += 1;
        AliasSnapshot {
            generation: self.generation,
            aliases: self.aliases.clone(),
        }
    }

    /// Lowest `N ≥ 1` such that `"Device N"` is not bound to any key.
    fn next_alias_number(&self) -> u32 {
        let used: BTreeSet<u32> = self
            .aliases
            .values()
            .filter_map(|alias| alias.strip_prefix(ALIAS_PREFIX))
            .filter_map(|n| n.trim().parse().ok())
            .collect();
        (1..).find(|n| !used.contains(n)).unwrap_or(1)
    }

    /// Returns the alias for `key`, allocating one if needed.  The second
    /// element is `true` when a new binding was created.
    fn alias_for(&mut self, key: &str) -> (String, bool) {
        if let Some(alias) = self.aliases.get(key) {
            return (alias.clone(), false);
        }
        let alias = format!("{ALIAS_PREFIX}{}", self.next_alias_number());
        self.aliases.insert(key.to_string(), alias.clone());
        (alias, true)
    }
}

/// Thread-safe registry of known devices.  See the module docs.
pub struct DeviceRegistry {
    state: Mutex<RegistryState>,
    store: Option<Box<dyn AliasStore>>,
    /// Generation last written to `store`.
    saved_generation: Mutex<u64>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Creates an empty registry with in-memory aliases only.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            store: None,
            saved_generation: Mutex::new(0),
        }
    }

    /// Creates a registry backed by `store`, preloading its bindings.
    ///
    /// A store that cannot be read is logged and treated as empty.
    pub fn with_store(store: Box<dyn AliasStore>) -> Self {
        let aliases = store.load().unwrap_or_else(|e| {
            warn!("failed to load persisted aliases: {e}");
            BTreeMap::new()
        });
        debug!("loaded {} persisted alias binding(s)", aliases.len());
        Self {
            state: Mutex::new(RegistryState {
                devices: HashMap::new(),
                aliases,
                generation: 0,
            }),
            store: Some(store),
            saved_generation: Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the alias bound to `device_key`, allocating the lowest free
    /// `"Device N"` on first use.
    pub fn alias_for(&self, device_key: &str) -> String {
        let (alias, snapshot) = {
            let mut state = self.lock();
            let (alias, created) = state.alias_for(device_key);
            (alias, created.then(|| state.snapshot()))
        };
        if let Some(snapshot) = snapshot {
            self.persist(snapshot);
        }
        alias
    }

    /// Records that `device_key` was seen at `address` at time `now`.
    pub fn register_sighting(&self, device_key: &str, address: IpAddr, now: Instant) -> Sighting {
        let (sighting, snapshot) = {
            let mut state = self.lock();
            let (alias, created) = state.alias_for(device_key);
            let snapshot = created.then(|| state.snapshot());

            let mut is_new_device = false;
            let record = state
                .devices
                .entry(device_key.to_string())
                .or_insert_with(|| {
                    is_new_device = true;
                    DeviceRecord {
                        device_key: device_key.to_string(),
                        alias: alias.clone(),
                        addresses: BTreeSet::new(),
                        last_seen: now,
                    }
                });
            let is_new_address = record.addresses.insert(address);
            record.last_seen = now;

            (
                Sighting {
                    is_new_device,
                    is_new_address,
                    alias,
                },
                snapshot,
            )
        };
        if let Some(snapshot) = snapshot {
            self.persist(snapshot);
        }
        sighting
    }

    /// Removes and returns every device not seen within `threshold` of `now`.
    ///
    /// Evicted keys release their alias, making the number available again.
    pub fn sweep(&self, now: Instant, threshold: Duration) -> Vec<EvictedDevice> {
        let (evicted, snapshot) = {
            let mut state = self.lock();
            let stale: Vec<String> = state
                .devices
                .values()
                .filter(|rec| now.saturating_duration_since(rec.last_seen) > threshold)
                .map(|rec| rec.device_key.clone())
                .collect();
            if stale.is_empty() {
                return Vec::new();
            }
            let mut evicted = Vec::with_capacity(stale.len());
            for key in stale {
                if let Some(rec) = state.devices.remove(&key) {
                    state.aliases.remove(&key);
                    evicted.push(EvictedDevice {
                        device_key: rec.device_key,
                        alias: rec.alias,
                        addresses: rec.addresses.into_iter().collect(),
                    });
                }
            }
            (evicted, state.snapshot())
        };
        self.persist(snapshot);
        evicted
    }

    /// Snapshot of every address currently associated with a device.
    pub fn addresses(&self) -> Vec<IpAddr> {
        let state = self.lock();
        let mut all: Vec<IpAddr> = state
            .devices
            .values()
            .flat_map(|rec| rec.addresses.iter().copied())
            .collect();
        all.sort();
        all
    }

    /// Snapshot of all device records, ordered by alias.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        let mut all: Vec<DeviceRecord> = self.lock().devices.values().cloned().collect();
        all.sort_by(|a, b| a.alias.cmp(&b.alias));
        all
    }

    /// Returns the record for `device_key`, if known.
    pub fn get(&self, device_key: &str) -> Option<DeviceRecord> {
        self.lock().devices.get(device_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().devices.is_empty()
    }

    /// Forgets every device.  In-memory aliases are reset to the persisted
    /// bindings (or to nothing when no store is configured).
    pub fn clear(&self) {
        let persisted = match &self.store {
            Some(store) => store.load().unwrap_or_else(|e| {
                warn!("failed to reload persisted aliases: {e}");
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };
        let mut state = self.lock();
        state.devices.clear();
        state.aliases = persisted;
    }

    fn persist(&self, snapshot: AliasSnapshot) {
        let Some(store) = &self.store else {
            return;
        };
        let mut saved = self
            .saved_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if snapshot.generation <= *saved {
            debug!("skipping stale alias snapshot {}", snapshot.generation);
            return;
        }
        match store.save(&snapshot.aliases) {
            Ok(()) => *saved = snapshot.generation,
            Err(e) => warn!("failed to persist aliases (kept in memory): {e}"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    /// In-memory store that records every save.
    #[derive(Default, Clone)]
    struct MemoryStore {
        saved: Arc<Mutex<BTreeMap<String, String>>>,
        fail: bool,
    }

    impl AliasStore for MemoryStore {
        fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
            Ok(self.saved.lock().unwrap().clone())
        }
        fn save(&self, aliases: &BTreeMap<String, String>) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Format("disk full".to_string()));
            }
            *self.saved.lock().unwrap() = aliases.clone();
            Ok(())
        }
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = DeviceRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.addresses().is_empty());
    }

    #[test]
    fn test_alias_for_allocates_sequential_numbers() {
        // Arrange
        let registry = DeviceRegistry::new();

        // Act
        let aliases: Vec<String> = ["a", "b", "c"].iter().map(|k| registry.alias_for(k)).collect();

        // Assert
        assert_eq!(aliases, vec!["Device 1", "Device 2", "Device 3"]);
    }

    #[test]
    fn test_alias_for_is_stable_per_key() {
        let registry = DeviceRegistry::new();
        let first = registry.alias_for("bjorn");
        registry.alias_for("other");
        assert_eq!(registry.alias_for("bjorn"), first);
    }

    #[test]
    fn test_first_sighting_is_new_device() {
        let registry = DeviceRegistry::new();
        let s = registry.register_sighting("bjorn", ip("10.0.0.5"), Instant::now());
        assert!(s.is_new_device);
        assert!(s.is_new_address);
        assert_eq!(s.alias, "Device 1");
    }

    #[test]
    fn test_repeat_sighting_is_not_news() {
        // Arrange
        let registry = DeviceRegistry::new();
        let now = Instant::now();
        registry.register_sighting("bjorn", ip("10.0.0.5"), now);

        // Act
        let s = registry.register_sighting("bjorn", ip("10.0.0.5"), now);

        // Assert
        assert!(!s.is_news());
    }

    #[test]
    fn test_new_address_on_known_device_is_news() {
        let registry = DeviceRegistry::new();
        let now = Instant::now();
        registry.register_sighting("bjorn", ip("10.0.0.5"), now);
        let s = registry.register_sighting("bjorn", ip("172.20.2.7"), now);
        assert!(!s.is_new_device);
        assert!(s.is_new_address);
        assert_eq!(s.alias, "Device 1");
        assert_eq!(registry.get("bjorn").unwrap().addresses.len(), 2);
    }

    #[test]
    fn test_sweep_evicts_stale_devices_once() {
        // Arrange
        let registry = DeviceRegistry::new();
        let t0 = Instant::now();
        registry.register_sighting("old", ip("10.0.0.5"), t0);
        registry.register_sighting("old", ip("172.20.2.7"), t0);
        registry.register_sighting("fresh", ip("10.0.0.6"), t0 + Duration::from_secs(80));

        // Act
        let later = t0 + Duration::from_secs(100);
        let evicted = registry.sweep(later, Duration::from_secs(90));
        let again = registry.sweep(later, Duration::from_secs(90));

        // Assert
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].device_key, "old");
        assert_eq!(evicted[0].addresses.len(), 2);
        assert!(again.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_sighting_refreshes_last_seen() {
        let registry = DeviceRegistry::new();
        let t0 = Instant::now();
        registry.register_sighting("bjorn", ip("10.0.0.5"), t0);
        registry.register_sighting("bjorn", ip("10.0.0.5"), t0 + Duration::from_secs(60));
        let evicted = registry.sweep(t0 + Duration::from_secs(120), Duration::from_secs(90));
        assert!(evicted.is_empty());
    }

    #[test]
    fn test_freed_alias_is_reused_lowest_first() {
        // Arrange
        let registry = DeviceRegistry::new();
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(50);
        registry.register_sighting("one", ip("10.0.0.1"), later);
        registry.register_sighting("two", ip("10.0.0.2"), t0);
        registry.register_sighting("three", ip("10.0.0.3"), later);

        // Act: "two" goes stale and is evicted
        let evicted = registry.sweep(t0 + Duration::from_secs(100), Duration::from_secs(90));
        let s = registry.register_sighting("four", ip("10.0.0.4"), later);

        // Assert
        assert_eq!(evicted[0].alias, "Device 2");
        assert_eq!(s.alias, "Device 2");
    }

    #[test]
    fn test_store_receives_new_bindings() {
        // Arrange
        let store = MemoryStore::default();
        let registry = DeviceRegistry::with_store(Box::new(store.clone()));

        // Act
        registry.alias_for("bjorn");

        // Assert
        assert_eq!(
            store.saved.lock().unwrap().get("bjorn").map(String::as_str),
            Some("Device 1")
        );
    }

    #[test]
    fn test_persisted_aliases_are_reused() {
        let store = MemoryStore::default();
        store
            .saved
            .lock()
            .unwrap()
            .insert("bjorn-lab".to_string(), "Device 3".to_string());
        let registry = DeviceRegistry::with_store(Box::new(store));

        assert_eq!(registry.alias_for("bjorn-lab"), "Device 3");
        assert_eq!(registry.alias_for("new"), "Device 1");
    }

    #[test]
    fn test_older_alias_snapshot_never_overwrites_newer_one() {
        // Arrange: two snapshots taken in order, saved in reverse order
        let store = MemoryStore::default();
        let registry = DeviceRegistry::with_store(Box::new(store.clone()));
        let (older, newer) = {
            let mut state = registry.lock();
            state.aliases.insert("bjorn-01".to_string(), "Device 1".to_string());
            let older = state.snapshot();
            state.aliases.insert("bjorn-02".to_string(), "Device 2".to_string());
            (older, state.snapshot())
        };

        // Act
        registry.persist(newer);
        registry.persist(older);

        // Assert
        let saved = store.saved.lock().unwrap().clone();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved.get("bjorn-02").map(String::as_str), Some("Device 2"));
    }

    #[test]
    fn test_concurrent_sightings_persist_every_binding() {
        // Arrange
        let store = MemoryStore::default();
        let registry = Arc::new(DeviceRegistry::with_store(Box::new(store.clone())));

        // Act
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.register_sighting(&format!("bjorn-{i}"), ip("10.0.0.5"), Instant::now());
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Assert
        assert_eq!(store.saved.lock().unwrap().len(), 8);
    }

    #[test]
    fn test_store_failure_keeps_alias_in_memory() {
        let store = MemoryStore {
            fail: true,
            ..MemoryStore::default()
        };
        let registry = DeviceRegistry::with_store(Box::new(store));
        assert_eq!(registry.alias_for("bjorn"), "Device 1");
        assert_eq!(registry.alias_for("bjorn"), "Device 1");
    }

    #[test]
    fn test_clear_forgets_devices_and_memory_aliases() {
        let registry = DeviceRegistry::new();
        registry.register_sighting("a", ip("10.0.0.1"), Instant::now());
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.alias_for("b"), "Device 1");
    }
}
