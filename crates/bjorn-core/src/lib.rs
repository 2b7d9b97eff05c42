//! # bjorn-core
//!
//! Shared library for Bjorn Manager containing the device registry, the
//! address classification rules and the event protocol pushed to the UI.
//!
//! This crate is used by the manager application and its tests.
//! It has zero dependencies on sockets, SSH or the file system.  The optional
//! `tokio` feature adds an [`EventSink`] impl for Tokio's unbounded sender
//! and pulls in only Tokio's `sync` module.
//!
//! # Architecture overview
//!
//! Bjorn Manager finds headless Bjorn devices on the local network (over
//! Ethernet/Wi-Fi, a USB gadget link or a Bluetooth PAN) and installs or
//! maintains software on them over SSH.
//!
//! - **`domain`** – Pure rules.  `address` decides which network segment an
//!   IP belongs to and whether a hostname looks like a Bjorn device;
//!   `registry` deduplicates sightings by stable identity and hands out
//!   `"Device N"` aliases.
//!
//! - **`event`** – The closed set of notifications (`log`, `progress`,
//!   `device_found`, `device_gone`, `webapp_status`) and the [`EventSink`]
//!   trait they are pushed through.

pub mod domain;
pub mod event;

pub use domain::address::{
    is_device_hostname, normalize_hostname, AddressError, Ipv4Subnet, NetworkSegment,
    BLUETOOTH_SUBNET, USB_SUBNET,
};
pub use domain::registry::{
    AliasStore, DeviceRecord, DeviceRegistry, EvictedDevice, Sighting, StoreError,
};
pub use event::{Event, EventSink, LogLevel};
