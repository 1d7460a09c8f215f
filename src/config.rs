use crate::models::Priority;
use crate::view::SortKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the config file when `--config` is not given.
pub const CONFIG_ENV: &str = "TTBOARD_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

const VALID_STORAGE_TYPES: &[&str] = &["json", "sqlite"];
const VALID_PRIORITIES: &[&str] = &["high", "medium", "low"];
const VALID_SORTS: &[&str] = &["manual", "priority", "due-date", "created-at"];

pub const KEYS: &[&str] = &[
    "storage.type",
    "storage.path",
    "default-priority",
    "default-category",
    "default-sort",
];

fn validate_storage_path(path: &str) -> Result<PathBuf, ConfigError> {
    // Check for null bytes and other invalid characters
    if path.contains('\0') {
        return Err(ConfigError::InvalidConfig(
            "Path contains invalid characters".to_string(),
        ));
    }

    if path.trim().is_empty() {
        return Err(ConfigError::InvalidConfig(
            "Path cannot be empty".to_string(),
        ));
    }

    let path = shellexpand::tilde(path);
    let path = PathBuf::from(path.as_ref());

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            return Err(ConfigError::InvalidConfig(format!(
                "Parent directory does not exist: {}",
                parent.display()
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if let Ok(metadata) = parent.metadata() {
                if metadata.mode() & 0o200 == 0 {
                    return Err(ConfigError::InvalidConfig(format!(
                        "Directory is not writable: {}",
                        parent.display()
                    )));
                }
            }
        }
    }

    Ok(path)
}

fn validate_one_of(key: &str, value: &str, valid: &[&str]) -> Result<(), ConfigError> {
    if !valid.contains(&value) {
        return Err(ConfigError::InvalidConfig(format!(
            "{} must be one of: {}",
            key,
            valid.join(", ")
        )));
    }
    Ok(())
}

fn validate_category(value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidConfig(
            "default-category cannot be empty".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage_type: Option<String>,
    #[serde(default)]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub default_priority: Option<String>,
    #[serde(default)]
    pub default_category: Option<String>,
    #[serde(default)]
    pub default_sort: Option<String>,
}

impl Config {
    pub fn with_defaults() -> Self {
        Self {
            storage_type: Some("json".to_string()),
            storage_path: None,
            default_priority: Some("medium".to_string()),
            default_category: None,
            default_sort: Some("manual".to_string()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref storage_type) = self.storage_type {
            validate_one_of("storage.type", storage_type, VALID_STORAGE_TYPES)?;
        }
        if let Some(ref priority) = self.default_priority {
            validate_one_of("default-priority", priority, VALID_PRIORITIES)?;
        }
        if let Some(ref sort) = self.default_sort {
            validate_one_of("default-sort", sort, VALID_SORTS)?;
        }
        if let Some(ref path) = self.storage_path {
            validate_storage_path(path)?;
        }
        Ok(())
    }

    /// Priority for new tasks when none is given.
    pub fn priority(&self) -> Priority {
        self.default_priority
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default()
    }

    /// Sort for `list` when none is given.
    pub fn sort(&self) -> SortKey {
        self.default_sort
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

/// `~/.config/ttboard`
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or_else(|| {
        ConfigError::InvalidConfig("Could not determine home directory".to_string())
    })?;
    Ok(home.join(".config").join("ttboard"))
}

pub struct ConfigManager {
    path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Loads the config at `config_path`, or at the default location. A
    /// missing file yields the defaults and is created on first `set`.
    pub fn new(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match config_path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).to_string()),
            None => default_config_dir()?.join("config.json"),
        };

        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                Config::with_defaults()
            } else {
                let config: Config = serde_json::from_str(&contents)?;
                config.validate()?;
                config
            }
        } else {
            Config::with_defaults()
        };

        log::debug!("using config {}", path.display());
        Ok(Self { path, config })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.config)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let config = &self.config;
        match key {
            "storage.type" => config.storage_type.clone(),
            "storage.path" => config.storage_path.clone(),
            "default-priority" => config.default_priority.clone(),
            "default-category" => config.default_category.clone(),
            "default-sort" => config.default_sort.clone(),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut config = self.config.clone();

        match key {
            "storage.type" => {
                validate_one_of(key, value, VALID_STORAGE_TYPES)?;
                if config.storage_type.as_deref() != Some(value) {
                    log::warn!("changing storage type does not migrate existing data");
                }
                config.storage_type = Some(value.to_string());
            }
            "storage.path" => {
                let path = validate_storage_path(value)?;
                config.storage_path = Some(path.to_string_lossy().to_string());
            }
            "default-priority" => {
                validate_one_of(key, value, VALID_PRIORITIES)?;
                config.default_priority = Some(value.to_string());
            }
            "default-category" => {
                validate_category(value)?;
                config.default_category = Some(value.to_string());
            }
            "default-sort" => {
                validate_one_of(key, value, VALID_SORTS)?;
                config.default_sort = Some(value.to_string());
            }
            _ => {
                return Err(ConfigError::InvalidKey(key.to_string()));
            }
        }
        config.validate()?;
        self.config = config;
        self.save()
    }

    pub fn unset(&mut self, key: &str) -> Result<(), ConfigError> {
        let config = &mut self.config;
        match key {
            "storage.type" => config.storage_type = None,
            "storage.path" => config.storage_path = None,
            "default-priority" => config.default_priority = None,
            "default-category" => config.default_category = None,
            "default-sort" => config.default_sort = None,
            _ => return Err(ConfigError::InvalidKey(key.to_string())),
        }
        self.save()
    }

    /// Every key with its effective value and whether that value is the
    /// built-in default.
    pub fn list(&self) -> Vec<(String, String, bool)> {
        let defaults = Config::with_defaults();
        let defaults = ConfigManager {
            path: self.path.clone(),
            config: defaults,
        };

        KEYS.iter()
            .map(|key| match self.get(key) {
                Some(value) => (key.to_string(), value, false),
                None => (
                    key.to_string(),
                    defaults.get(key).unwrap_or_else(|| "null".to_string()),
                    true,
                ),
            })
            .collect()
    }
}
