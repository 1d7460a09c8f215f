use super::migrations;
use super::watch::{self, Snapshots};
use super::{Registration, Storage, StorageError, Subscription};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};

/// Stores every key as a row of a `kv` table.
pub struct SqliteStorage {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    snapshots: Snapshots,
}

impl SqliteStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = PathBuf::from(shellexpand::tilde(&path.as_ref().to_string_lossy()).to_string());
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(&path)
            .map_err(|e| StorageError::Storage(format!("Failed to open database: {}", e)))?;
        migrations::apply_migrations(&mut conn)?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            snapshots: Snapshots::default(),
        })
    }

    fn get_connection(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        lock_connection(&self.conn)
    }
}

fn lock_connection(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock()
        .map_err(|e| StorageError::Storage(format!("Failed to lock connection: {}", e)))
}

fn load_items(conn: &Connection) -> Result<HashMap<String, String>, StorageError> {
    let mut stmt = conn
        .prepare("SELECT key, value FROM kv")
        .map_err(|e| StorageError::Storage(format!("Failed to prepare kv query: {}", e)))?;

    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(|e| StorageError::Storage(format!("Failed to query kv: {}", e)))?;

    let mut items = HashMap::new();
    for row in rows {
        let (key, value) =
            row.map_err(|e| StorageError::Storage(format!("Failed to read kv row: {}", e)))?;
        items.insert(key, value);
    }
    Ok(items)
}

impl Storage for SqliteStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.get_connection()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.snapshots.record(key, Some(value), || {
            self.get_connection()?.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.snapshots.record(key, None, || {
            self.get_connection()?
                .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn subscribe(&self) -> Result<Subscription, StorageError> {
        let known = self
            .snapshots
            .register(|| load_items(&*self.get_connection()?))?;

        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        let db_name = self.path.file_name().map(|n| n.to_os_string());
        let conn = Arc::clone(&self.conn);

        let (tx, rx) = mpsc::channel();
        let watcher = watch::watch_medium(
            &dir,
            move |path| match (path.file_name(), db_name.as_ref()) {
                // Also matches the -journal and -wal side files
                (Some(name), Some(db)) => {
                    name.to_string_lossy().starts_with(&*db.to_string_lossy())
                }
                _ => false,
            },
            move || load_items(&*lock_connection(&conn)?),
            known,
            tx,
        )?;
        log::debug!("watching {}", self.path.display());
        Ok(Subscription::new(rx, Registration::Watcher(watcher)))
    }
}
