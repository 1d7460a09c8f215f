use crate::config::ConfigManager;
use crate::manager::Clock;
use crate::models::{NewTask, Priority, Task};
use crate::storage::{MemoryOrigin, MemoryStorage};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Creates a config manager backed by a temporary directory so tests never
/// touch the user's real configuration or data.
pub fn create_test_config_manager() -> (ConfigManager, TempDir) {
    let temp_dir = tempfile::Builder::new()
        .prefix("ttboard_test")
        .tempdir()
        .expect("Failed to create temporary directory");

    let config_path = temp_dir.path().join("config.json");
    let storage_path = temp_dir.path().join("test-data");

    let mut config_manager =
        ConfigManager::new(Some(config_path.as_path())).expect("Failed to create config manager");
    config_manager
        .set("storage.type", "json")
        .expect("Failed to set storage.type");
    config_manager
        .set("storage.path", storage_path.to_str().unwrap())
        .expect("Failed to set storage.path");
    config_manager
        .set("default-priority", "medium")
        .expect("Failed to set default-priority");

    (config_manager, temp_dir)
}

/// A single tab on a fresh in-memory origin.
pub fn create_test_storage() -> (MemoryOrigin, MemoryStorage) {
    let origin = MemoryOrigin::new();
    let storage = origin.open_tab();
    (origin, storage)
}

/// A clock that advances one second on every reading.
#[derive(Clone)]
pub struct StepClock {
    next: Arc<AtomicI64>,
}

impl StepClock {
    pub fn starting_at(secs: i64) -> Self {
        Self {
            next: Arc::new(AtomicI64::new(secs)),
        }
    }
}

impl Clock for StepClock {
    fn now(&self) -> DateTime<Utc> {
        let secs = self.next.fetch_add(1, Ordering::SeqCst);
        Utc.timestamp_opt(secs, 0).unwrap()
    }
}

/// A stored task with the given title, priority and position, created
/// `order` minutes after a fixed epoch.
pub fn task(title: &str, priority: Priority, order: u32) -> Task {
    let created = Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::minutes(order as i64);
    let mut input = NewTask::titled(title);
    input.priority = priority;
    let mut task = Task::new(input, "personal".to_string(), order, created).unwrap();
    task.id = format!("id-{}", title.to_lowercase().replace(' ', "-"));
    task
}

pub fn titles(tasks: &[Task]) -> Vec<String> {
    tasks.iter().map(|t| t.title.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn test_storage_initialization() {
        let (_origin, storage) = create_test_storage();
        assert!(storage.read_tasks().unwrap().is_empty());
        assert_eq!(storage.read_categories().unwrap().len(), 4);
    }

    #[test]
    fn test_step_clock_is_strictly_increasing() {
        let clock = StepClock::starting_at(10);
        let first = clock.now();
        assert!(clock.now() > first);
    }

    #[test]
    fn test_config_manager() {
        let (config_manager, temp_dir) = create_test_config_manager();

        let storage_path = config_manager
            .get("storage.path")
            .expect("Storage path not set");
        assert!(storage_path.contains("ttboard_test"));
        assert!(temp_dir.path().join("config.json").exists());
    }
}
