//! Storage infrastructure: configuration and alias files.
//!
//! - **`config`** – `config.toml` in the platform config directory, with
//!   serde defaults for every key.
//! - **`aliases`** – `aliases.toml`, the optional persistent
//!   [`bjorn_core::AliasStore`].

pub mod aliases;
pub mod config;
