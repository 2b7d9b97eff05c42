//! bjorn-manager library.
//!
//! `application` holds the use cases (discovery, remote sessions,
//! installation, maintenance) written against traits; `infrastructure`
//! implements those traits with mDNS, TCP probes, libssh2 and TOML files.
//! The binary and the integration tests in `tests/` both build on this
//! module tree.

pub mod application;
pub mod infrastructure;
