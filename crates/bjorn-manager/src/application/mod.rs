//! Application layer use cases of the Bjorn manager.
//!
//! Use cases in this layer orchestrate domain objects from `bjorn_core` and
//! depend on traits (ports) rather than concrete network or SSH code, so the
//! infrastructure can be swapped for mocks in tests.  No sockets are opened
//! here.
//!
//! # Sub-modules
//!
//! - **`discover_devices`** – the [`DiscoveryEngine`](discover_devices::DiscoveryEngine):
//!   mDNS listener, subnet sweep, liveness poller and staleness sweeper
//!   feeding the device registry.
//!
//! - **`remote_session`** – one SSH connection to a device: key/password
//!   authentication, one-shot and privileged commands, SFTP uploads and the
//!   journal follower.
//!
//! - **`install_device`** – non-interactive installer invocation and the PTY
//!   output loop that turns installer output into log and progress events.
//!
//! - **`maintain_device`** – service restart, e-paper driver change, reboot
//!   and debug archive deployment.
//!
//! - **`channel_output`** – line reassembly shared by the output loops.

pub mod channel_output;
pub mod discover_devices;
pub mod install_device;
pub mod maintain_device;
pub mod remote_session;
