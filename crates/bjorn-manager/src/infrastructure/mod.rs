//! Infrastructure layer of the Bjorn manager.
//!
//! Contains OS-facing adapters: TCP/DNS/mDNS network access, the libssh2
//! transport and file-system storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `bjorn_core`, but MUST NOT be imported by the `application` or domain
//! layers outside of tests.

pub mod network;
pub mod ssh;
pub mod storage;
