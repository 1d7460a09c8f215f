use super::{open_storage, Storage, StorageError, StorageType};
use crate::config::{default_config_dir, ConfigError, ConfigManager};
use std::path::PathBuf;

/// The medium and location the configuration resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub storage_type: StorageType,
    pub storage_path: PathBuf,
}

impl StorageConfig {
    pub fn from_config_manager(manager: &ConfigManager) -> Result<Self, ConfigError> {
        let storage_type = manager
            .get("storage.type")
            .and_then(|s| StorageType::parse(&s))
            .unwrap_or(StorageType::Json);

        let storage_path = match manager.get("storage.path") {
            Some(path) => PathBuf::from(shellexpand::tilde(&path).to_string()),
            None => {
                let dir = default_config_dir()?;
                match storage_type {
                    StorageType::Json => dir.join("data"),
                    StorageType::Sqlite => dir.join("data.db"),
                }
            }
        };

        Ok(Self {
            storage_type,
            storage_path,
        })
    }

    pub fn open(&self) -> Result<Box<dyn Storage>, StorageError> {
        log::debug!(
            "opening {:?} storage at {}",
            self.storage_type,
            self.storage_path.display()
        );
        open_storage(self.storage_type, &self.storage_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_utils::create_test_config_manager;

    #[test]
    fn test_storage_config_from_manager() {
        let (manager, temp_dir) = create_test_config_manager();
        let config = StorageConfig::from_config_manager(&manager).unwrap();
        assert_eq!(config.storage_type, StorageType::Json);
        assert_eq!(config.storage_path, temp_dir.path().join("test-data"));
        assert!(config.open().is_ok());
    }

    #[test]
    fn test_storage_config_from_manager_with_custom_type() {
        let (mut manager, temp_dir) = create_test_config_manager();
        manager.set("storage.type", "sqlite").unwrap();
        manager
            .set("storage.path", temp_dir.path().join("test.db").to_str().unwrap())
            .unwrap();
        let config = StorageConfig::from_config_manager(&manager).unwrap();
        assert_eq!(config.storage_type, StorageType::Sqlite);
        assert_eq!(config.storage_path, temp_dir.path().join("test.db"));

        let storage = config.open().unwrap();
        storage.write_tasks(&[]).unwrap();
        assert!(temp_dir.path().join("test.db").exists());
    }

    #[test]
    fn test_storage_config_without_type_uses_json() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(
            &config_path,
            format!(
                r#"{{"storage_path": "{}"}}"#,
                temp_dir.path().join("data").display()
            ),
        )
        .unwrap();

        let manager = ConfigManager::new(Some(config_path.as_path())).unwrap();
        let config = StorageConfig::from_config_manager(&manager).unwrap();
        assert_eq!(config.storage_type, StorageType::Json);
        assert_eq!(config.storage_path, temp_dir.path().join("data"));
    }
}
