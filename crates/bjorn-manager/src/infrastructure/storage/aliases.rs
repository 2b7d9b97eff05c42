//! `aliases.toml`: persisted `device_key → alias` bindings.
//!
//! ```toml
//! [aliases]
//! bjorn = "Device 1"
//! bjorn-lab = "Device 2"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bjorn_core::{AliasStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::{config_dir, ConfigError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct AliasFile {
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

/// [`AliasStore`] backed by a TOML file.
#[derive(Debug, Clone)]
pub struct FileAliasStore {
    path: PathBuf,
}

impl FileAliasStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `aliases.toml` next to the config file.
    pub fn in_config_dir() -> Result<Self, ConfigError> {
        Ok(Self::new(config_dir()?.join("aliases.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AliasStore for FileAliasStore {
    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no alias file at {}", self.path.display());
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(e.into()),
        };
        let file: AliasFile =
            toml::from_str(&content).map_err(|e| StoreError::Format(e.to_string()))?;
        Ok(file.aliases)
    }

    fn save(&self, aliases: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = AliasFile {
            aliases: aliases.clone(),
        };
        let content = toml::to_string_pretty(&file).map_err(|e| StoreError::Format(e.to_string()))?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bjorn_core::DeviceRegistry;
    use std::time::Instant;

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAliasStore::new(dir.path().join("aliases.toml"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let store = FileAliasStore::new(dir.path().join("sub").join("aliases.toml"));
        let mut aliases = BTreeMap::new();
        aliases.insert("bjorn".to_string(), "Device 1".to_string());
        aliases.insert("bjorn-lab".to_string(), "Device 2".to_string());

        // Act
        store.save(&aliases).unwrap();

        // Assert
        assert_eq!(store.load().unwrap(), aliases);
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("[aliases]"));
    }

    #[test]
    fn test_malformed_file_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases.toml");
        std::fs::write(&path, "aliases = 3").unwrap();
        let store = FileAliasStore::new(path);
        assert!(matches!(store.load(), Err(StoreError::Format(_))));
    }

    #[test]
    fn test_registry_restores_aliases_from_file() {
        // Arrange: first run binds an alias and persists it
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases.toml");
        {
            let registry = DeviceRegistry::with_store(Box::new(FileAliasStore::new(&path)));
            registry.register_sighting("bjorn-a", "10.0.0.5".parse().unwrap(), Instant::now());
            registry.register_sighting("bjorn-b", "10.0.0.6".parse().unwrap(), Instant::now());
        }

        // Act: second run sees only the second device
        let registry = DeviceRegistry::with_store(Box::new(FileAliasStore::new(&path)));
        let sighting = registry.register_sighting("bjorn-b", "10.0.0.6".parse().unwrap(), Instant::now());

        // Assert
        assert_eq!(sighting.alias, "Device 2");
    }
}
