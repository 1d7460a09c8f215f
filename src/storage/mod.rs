use crate::models::{default_categories, Category, Task};
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
pub(crate) mod test_utils;

pub mod config;
pub mod json;
pub mod memory;
mod migrations;
pub mod sqlite;
mod watch;

pub use json::JsonStorage;
pub use memory::{MemoryOrigin, MemoryStorage};
pub use sqlite::SqliteStorage;

pub const TASKS_KEY: &str = "tasks";
pub const CATEGORIES_KEY: &str = "categories";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("Storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Json,
    Sqlite,
}

impl StorageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "json" => Some(StorageType::Json),
            "sqlite" => Some(StorageType::Sqlite),
            _ => None,
        }
    }
}

/// A change made to the medium by another tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

#[allow(dead_code)] // Held only so dropping the subscription releases it
pub(crate) enum Registration {
    Inert(mpsc::Sender<StorageEvent>),
    Listener(memory::ListenerGuard),
    Watcher(notify::RecommendedWatcher),
}

/// A registration on a medium's change channel. Dropping it deregisters.
pub struct Subscription {
    rx: mpsc::Receiver<StorageEvent>,
    _registration: Registration,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<StorageEvent>, registration: Registration) -> Self {
        Self {
            rx,
            _registration: registration,
        }
    }

    /// A subscription that never fires. Waiting on it still blocks for the
    /// full timeout.
    pub fn inert() -> Self {
        let (tx, rx) = mpsc::channel();
        Self::new(rx, Registration::Inert(tx))
    }

    pub fn next_timeout(&self, timeout: Duration) -> Option<StorageEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// All queued events, oldest first. Never blocks.
    pub fn drain(&self) -> Vec<StorageEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// The persistence boundary. Media implement the raw item operations; the
/// task and category contract is built on top of them.
pub trait Storage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    fn subscribe(&self) -> Result<Subscription, StorageError>;

    fn read_tasks(&self) -> Result<Vec<Task>, StorageError> {
        parse_tasks(self.get_item(TASKS_KEY)?.as_deref())
    }

    fn write_tasks(&self, tasks: &[Task]) -> Result<(), StorageError> {
        let json = serde_json::to_string(tasks)?;
        self.set_item(TASKS_KEY, &json)
    }

    fn read_categories(&self) -> Result<Vec<Category>, StorageError> {
        let raw = self.get_item(CATEGORIES_KEY)?;
        match present(raw.as_deref()) {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(default_categories()),
        }
    }

    fn write_categories(&self, categories: &[Category]) -> Result<(), StorageError> {
        let json = serde_json::to_string(categories)?;
        self.set_item(CATEGORIES_KEY, &json)
    }
}

/// A stored value that is empty or only whitespace counts as absent.
fn present(raw: Option<&str>) -> Option<&str> {
    raw.filter(|raw| !raw.trim().is_empty())
}

/// Parses a stored task list; an absent or empty value is an empty list.
pub fn parse_tasks(raw: Option<&str>) -> Result<Vec<Task>, StorageError> {
    match present(raw) {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Vec::new()),
    }
}

/// Parses a category list pushed by another tab. Unlike `read_categories`,
/// an absent value here means the key was cleared and yields no categories.
pub fn parse_categories(raw: Option<&str>) -> Result<Vec<Category>, StorageError> {
    match present(raw) {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Vec::new()),
    }
}

/// Returns the store to the "no data yet" state.
pub fn reset_storage(storage: &dyn Storage) -> Result<(), StorageError> {
    storage.remove_item(TASKS_KEY)?;
    storage.remove_item(CATEGORIES_KEY)?;
    log::info!("storage reset to defaults");
    Ok(())
}

/// Used when no durable medium exists: reads are empty, writes vanish.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableStorage;

impl Storage for UnavailableStorage {
    fn get_item(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    fn set_item(&self, key: &str, _value: &str) -> Result<(), StorageError> {
        log::debug!("storage unavailable, dropping write to {}", key);
        Ok(())
    }

    fn remove_item(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn subscribe(&self) -> Result<Subscription, StorageError> {
        Ok(Subscription::inert())
    }
}

pub fn open_storage(
    storage_type: StorageType,
    path: &Path,
) -> Result<Box<dyn Storage>, StorageError> {
    match storage_type {
        StorageType::Json => {
            let storage = JsonStorage::new(path)?;
            Ok(Box::new(storage))
        }
        StorageType::Sqlite => {
            let storage = SqliteStorage::new(path)?;
            Ok(Box::new(storage))
        }
    }
}
