//! Domain entities for Bjorn Manager.
//!
//! This module contains pure business logic with no infrastructure
//! dependencies: it never opens a socket, reads a file or spawns a thread.
//! Persistence is reached only through the [`registry::AliasStore`] trait,
//! which the manager crate implements.

/// Address classification and hostname conventions.
pub mod address;

/// Device identity registry and alias allocation.
///
/// See [`registry::DeviceRegistry`] for the main type.
pub mod registry;
