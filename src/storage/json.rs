use super::watch::{self, Snapshots};
use super::{Registration, Storage, StorageError, Subscription};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// Stores each key as `<dir>/<key>.json`.
pub struct JsonStorage {
    dir: PathBuf,
    snapshots: Snapshots,
}

impl JsonStorage {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = PathBuf::from(shellexpand::tilde(&dir.as_ref().to_string_lossy()).to_string());
        if dir.exists() && !dir.is_dir() {
            return Err(StorageError::Storage(format!(
                "Storage path is not a directory: {}",
                dir.display()
            )));
        }
        Ok(Self {
            dir,
            snapshots: Snapshots::default(),
        })
    }

    fn item_path(&self, key: &str) -> PathBuf {
        item_path(&self.dir, key)
    }
}

fn item_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.json", key))
}

fn read_item(path: &Path) -> Result<Option<String>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(contents))
}

fn read_dir_items(dir: &Path) -> Result<HashMap<String, String>, StorageError> {
    let mut items = HashMap::new();
    if !dir.exists() {
        return Ok(items);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(value) = read_item(&path)? {
            items.insert(key.to_string(), value);
        }
    }
    Ok(items)
}

impl Storage for JsonStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        read_item(&self.item_path(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.snapshots.record(key, Some(value), || {
            std::fs::create_dir_all(&self.dir)?;

            // Write to a sibling temp file and rename so readers never see a torn file
            let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
            file.write_all(value.as_bytes())?;
            file.persist(self.item_path(key))
                .map_err(|e| StorageError::Io(e.error))?;
            Ok(())
        })
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.snapshots.record(key, None, || {
            let path = self.item_path(key);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            Ok(())
        })
    }

    fn subscribe(&self) -> Result<Subscription, StorageError> {
        std::fs::create_dir_all(&self.dir)?;
        let known = self.snapshots.register(|| read_dir_items(&self.dir))?;

        let (tx, rx) = mpsc::channel();
        let dir = self.dir.clone();
        let watcher = watch::watch_medium(
            &self.dir,
            |path| path.extension().and_then(|e| e.to_str()) == Some("json"),
            move || read_dir_items(&dir),
            known,
            tx,
        )?;
        log::debug!("watching {}", self.dir.display());
        Ok(Subscription::new(rx, Registration::Watcher(watcher)))
    }
}
