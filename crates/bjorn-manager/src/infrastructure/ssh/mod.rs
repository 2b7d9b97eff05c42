//! SSH transports behind the `SshConnector` port of
//! [`crate::application::remote_session`].
//!
//! - [`libssh2`] talks to real devices.
//! - [`mock`] replays scripted output for tests.

pub mod libssh2;
pub mod mock;

pub use libssh2::Libssh2Connector;
pub use mock::MockConnector;
