//! Address classification and hostname conventions.
//!
//! Bjorn devices can be reached over three kinds of link at once:
//!
//! | Segment     | Subnet           | Tag         |
//! |-------------|------------------|-------------|
//! | USB gadget  | `172.20.2.0/24`  | `USB`       |
//! | Bluetooth   | `172.20.1.0/24`  | `Bluetooth` |
//! | Anything else (Ethernet / Wi-Fi) | – | `LAN` |
//!
//! The same device therefore shows up under several IPs.  Identity is taken
//! from the hostname whenever it follows the device naming convention
//! (`bjorn`, `bjorn-01`, `bjorn_lab`, `lab-bjorn`, `bjorn.local` ...), see
//! [`is_device_hostname`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use thiserror::Error;

/// Stem every device hostname is built around.
pub const DEVICE_HOSTNAME_STEM: &str = "bjorn";

/// Fixed subnet of the USB gadget (RNDIS/ECM) link.
pub const USB_SUBNET: Ipv4Subnet = Ipv4Subnet::from_parts(Ipv4Addr::new(172, 20, 2, 0), 24);

/// Fixed subnet of the Bluetooth PAN link.
pub const BLUETOOTH_SUBNET: Ipv4Subnet = Ipv4Subnet::from_parts(Ipv4Addr::new(172, 20, 1, 0), 24);

/// Errors produced while parsing address notation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The text is not of the form `a.b.c.d/len`.
    #[error("invalid CIDR notation: {0:?}")]
    InvalidCidr(String),

    /// The prefix length is larger than 32.
    #[error("prefix length {0} is out of range (0-32)")]
    PrefixOutOfRange(u8),
}

// ── Network segment ───────────────────────────────────────────────────────────

/// The kind of link an address was observed on, used as a display tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkSegment {
    /// Ordinary Ethernet / Wi-Fi network.
    Lan,
    /// USB gadget link.
    Usb,
    /// Bluetooth PAN link.
    Bluetooth,
}

impl NetworkSegment {
    /// Classifies `addr` by the fixed USB / Bluetooth subnets.
    pub fn classify(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) if USB_SUBNET.contains(v4) => Self::Usb,
            IpAddr::V4(v4) if BLUETOOTH_SUBNET.contains(v4) => Self::Bluetooth,
            _ => Self::Lan,
        }
    }

    /// Short label appended to aliases, e.g. `"Device 1 (USB)"`.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Lan => "LAN",
            Self::Usb => "USB",
            Self::Bluetooth => "Bluetooth",
        }
    }
}

impl fmt::Display for NetworkSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ── IPv4 subnet ───────────────────────────────────────────────────────────────

/// An IPv4 network in CIDR form.  The stored address is always the network
/// address (host bits cleared).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Subnet {
    /// Builds a subnet, clearing host bits.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::PrefixOutOfRange`] when `prefix > 32`.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, AddressError> {
        if prefix > 32 {
            return Err(AddressError::PrefixOutOfRange(prefix));
        }
        Ok(Self::from_parts(addr, prefix))
    }

    /// `const` constructor for well-known subnets.  `prefix` must be ≤ 32.
    pub const fn from_parts(addr: Ipv4Addr, prefix: u8) -> Self {
        let raw = u32::from_be_bytes(addr.octets()) & mask(prefix);
        let o = raw.to_be_bytes();
        Self {
            network: Ipv4Addr::new(o[0], o[1], o[2], o[3]),
            prefix,
        }
    }

    /// The /24 network containing `addr` (used for the default gateway).
    pub fn slash24_of(addr: Ipv4Addr) -> Self {
        Self::from_parts(addr, 24)
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Returns `true` if `addr` lies inside this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix) == u32::from(self.network)
    }

    /// Usable host addresses: the network and broadcast addresses are
    /// excluded for prefixes shorter than /31.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.network);
        let size = 1u64 << (32 - u32::from(self.prefix));
        let (first, last) = if self.prefix >= 31 {
            (u64::from(base), u64::from(base) + size - 1)
        } else {
            (u64::from(base) + 1, u64::from(base) + size - 2)
        };
        // Every value is within the subnet, which fits in 32 bits.
        (first..=last).map(|n| Ipv4Addr::from(n as u32))
    }
}

const fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressError::InvalidCidr(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

// ── Hostname rules ────────────────────────────────────────────────────────────

/// Case-folds and trims a hostname, strips a trailing dot and a `.local` or
/// `.home` suffix.
///
/// ```
/// use bjorn_core::normalize_hostname;
/// assert_eq!(normalize_hostname("Bjorn-01.local."), "bjorn-01");
/// ```
pub fn normalize_hostname(host: &str) -> String {
    let h = host.trim().to_lowercase();
    let h = h.trim_end_matches('.');
    let h = h
        .strip_suffix(".local")
        .or_else(|| h.strip_suffix(".home"))
        .unwrap_or(h);
    h.to_string()
}

/// Returns `true` if `host` follows the device naming convention.
///
/// Accepted forms (case-insensitive, trailing dot ignored): the bare stem,
/// the stem with a `-`/`_` separated suffix or prefix, and any of those under
/// the `.local` / `.home` domains.
pub fn is_device_hostname(host: &str) -> bool {
    let h = normalize_hostname(host);
    if h.is_empty() {
        return false;
    }
    let stem = DEVICE_HOSTNAME_STEM;
    if h == stem {
        return true;
    }
    if let Some(rest) = h.strip_prefix(stem) {
        return rest.starts_with('-') || rest.starts_with('_');
    }
    if let Some(rest) = h.strip_suffix(stem) {
        return rest.ends_with('-') || rest.ends_with('_');
    }
    false
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_classify_usb_subnet() {
        assert_eq!(NetworkSegment::classify(ip("172.20.2.7")), NetworkSegment::Usb);
    }

    #[test]
    fn test_classify_bluetooth_subnet() {
        assert_eq!(
            NetworkSegment::classify(ip("172.20.1.14")),
            NetworkSegment::Bluetooth
        );
    }

    #[test]
    fn test_classify_everything_else_is_lan() {
        assert_eq!(NetworkSegment::classify(ip("10.0.0.5")), NetworkSegment::Lan);
        assert_eq!(NetworkSegment::classify(ip("172.20.3.1")), NetworkSegment::Lan);
        assert_eq!(NetworkSegment::classify(ip("fe80::1")), NetworkSegment::Lan);
    }

    #[test]
    fn test_segment_tags() {
        assert_eq!(NetworkSegment::Lan.to_string(), "LAN");
        assert_eq!(NetworkSegment::Usb.tag(), "USB");
        assert_eq!(NetworkSegment::Bluetooth.tag(), "Bluetooth");
    }

    #[test]
    fn test_subnet_parse_clears_host_bits() {
        // Arrange / Act
        let net: Ipv4Subnet = "192.168.1.77/24".parse().unwrap();

        // Assert
        assert_eq!(net.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(net.prefix(), 24);
        assert_eq!(net.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_subnet_parse_rejects_garbage() {
        assert!(matches!(
            "not-a-cidr".parse::<Ipv4Subnet>(),
            Err(AddressError::InvalidCidr(_))
        ));
        assert!(matches!(
            "10.0.0.0/x".parse::<Ipv4Subnet>(),
            Err(AddressError::InvalidCidr(_))
        ));
        assert_eq!(
            "10.0.0.0/33".parse::<Ipv4Subnet>(),
            Err(AddressError::PrefixOutOfRange(33))
        );
    }

    #[test]
    fn test_slash24_hosts_excludes_network_and_broadcast() {
        // Arrange
        let net = Ipv4Subnet::slash24_of(Ipv4Addr::new(192, 168, 1, 1));

        // Act
        let hosts: Vec<Ipv4Addr> = net.hosts().collect();

        // Assert
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn test_slash32_has_single_host() {
        let net = Ipv4Subnet::new(Ipv4Addr::new(10, 1, 2, 3), 32).unwrap();
        assert_eq!(net.hosts().collect::<Vec<_>>(), vec![Ipv4Addr::new(10, 1, 2, 3)]);
    }

    #[test]
    fn test_contains() {
        assert!(USB_SUBNET.contains(Ipv4Addr::new(172, 20, 2, 254)));
        assert!(!USB_SUBNET.contains(Ipv4Addr::new(172, 20, 1, 1)));
    }

    #[test]
    fn test_normalize_hostname_strips_suffixes() {
        assert_eq!(normalize_hostname("  BJORN.local. "), "bjorn");
        assert_eq!(normalize_hostname("bjorn-01.home"), "bjorn-01");
        assert_eq!(normalize_hostname("raspberrypi"), "raspberrypi");
        assert_eq!(normalize_hostname(""), "");
    }

    #[test]
    fn test_device_hostname_accepts_convention() {
        for name in [
            "bjorn",
            "Bjorn.local",
            "bjorn.home.",
            "bjorn-01",
            "bjorn_lab.local",
            "garage-bjorn",
            "lab_bjorn",
        ] {
            assert!(is_device_hostname(name), "{name} must be accepted");
        }
    }

    #[test]
    fn test_device_hostname_rejects_other_names() {
        for name in ["", "raspberrypi", "bjornify", "notbjorn", "router.home", "bjorn.example.com"] {
            assert!(!is_device_hostname(name), "{name} must be rejected");
        }
    }
}
