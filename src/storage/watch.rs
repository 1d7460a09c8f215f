use super::{StorageError, StorageEvent};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, Weak};

type Items = HashMap<String, Option<String>>;

/// Last value of every key as seen by one subscription, either written through
/// its handle or already announced to it. Lock this before touching the medium.
pub(crate) type Snapshot = Arc<Mutex<Items>>;

/// The snapshots of every live subscription on one storage handle.
#[derive(Default)]
pub(crate) struct Snapshots {
    live: Mutex<Vec<Weak<Mutex<Items>>>>,
}

impl Snapshots {
    /// Seeds a new snapshot from `read_all`. No write through the handle can
    /// land between the read and the registration.
    pub(crate) fn register<R>(&self, read_all: R) -> Result<Snapshot, StorageError>
    where
        R: FnOnce() -> Result<HashMap<String, String>, StorageError>,
    {
        let mut live = lock(&self.live)?;
        let items = read_all()?;
        let snapshot: Snapshot = Arc::new(Mutex::new(
            items.into_iter().map(|(key, value)| (key, Some(value))).collect(),
        ));
        live.retain(|weak| weak.strong_count() > 0);
        live.push(Arc::downgrade(&snapshot));
        Ok(snapshot)
    }

    /// Runs `write` with every live snapshot locked, then records `value` for
    /// `key` in each of them so the write is never announced back.
    pub(crate) fn record<W>(
        &self,
        key: &str,
        value: Option<&str>,
        write: W,
    ) -> Result<(), StorageError>
    where
        W: FnOnce() -> Result<(), StorageError>,
    {
        let mut live = lock(&self.live)?;
        live.retain(|weak| weak.strong_count() > 0);
        let snapshots: Vec<Snapshot> = live.iter().filter_map(Weak::upgrade).collect();
        let mut guards = snapshots
            .iter()
            .map(|snapshot| lock(snapshot))
            .collect::<Result<Vec<_>, _>>()?;

        write()?;

        for known in guards.iter_mut() {
            known.insert(key.to_string(), value.map(str::to_string));
        }
        Ok(())
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.live
            .lock()
            .map(|live| live.iter().filter(|weak| weak.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    mutex
        .lock()
        .map_err(|e| StorageError::Storage(format!("Failed to lock snapshot: {}", e)))
}

/// Diffs the medium against the snapshot and records the new values.
pub(crate) fn diff_snapshot(
    known: &mut HashMap<String, Option<String>>,
    current: HashMap<String, String>,
) -> Vec<StorageEvent> {
    let keys: BTreeSet<String> = known.keys().cloned().chain(current.keys().cloned()).collect();
    let mut events = Vec::new();
    for key in keys {
        let new_value = current.get(&key).cloned();
        if known.get(&key) == Some(&new_value) {
            continue;
        }
        known.insert(key.clone(), new_value.clone());
        events.push(StorageEvent { key, new_value });
    }
    events
}

/// Watches `dir` and, whenever a path accepted by `is_relevant` changes,
/// re-reads the medium with `read_all` and sends one event per changed key.
pub(crate) fn watch_medium<F, R>(
    dir: &Path,
    is_relevant: F,
    read_all: R,
    known: Snapshot,
    tx: mpsc::Sender<StorageEvent>,
) -> Result<RecommendedWatcher, StorageError>
where
    F: Fn(&Path) -> bool + Send + 'static,
    R: Fn() -> Result<HashMap<String, String>, StorageError> + Send + 'static,
{
    let dir_owned: PathBuf = dir.to_path_buf();

    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| {
            let event = match result {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("watch error on {}: {}", dir_owned.display(), e);
                    return;
                }
            };

            match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
                _ => return,
            }

            if !event.paths.iter().any(|p| p.starts_with(&dir_owned) && is_relevant(p)) {
                return;
            }

            let mut known = match known.lock() {
                Ok(known) => known,
                Err(_) => return,
            };
            let current = match read_all() {
                Ok(current) => current,
                Err(e) => {
                    // Usually a half-written file; the follow-up event will catch it.
                    log::debug!("skipping change in {}: {}", dir_owned.display(), e);
                    return;
                }
            };
            for change in diff_snapshot(&mut known, current) {
                log::debug!("external change to {}", change.key);
                if tx.send(change).is_err() {
                    return;
                }
            }
        },
        Config::default(),
    )?;

    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
