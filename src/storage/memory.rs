use super::{Registration, Storage, StorageError, StorageEvent, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};

struct Listener {
    id: u64,
    tab: u64,
    tx: mpsc::Sender<StorageEvent>,
}

#[derive(Default)]
struct OriginState {
    items: HashMap<String, String>,
    listeners: Vec<Listener>,
}

/// One in-memory key-value origin shared by any number of tabs.
#[derive(Clone, Default)]
pub struct MemoryOrigin {
    state: Arc<Mutex<OriginState>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle for a new tab. Writes made through it notify every other tab.
    pub fn open_tab(&self) -> MemoryStorage {
        MemoryStorage {
            origin: self.clone(),
            tab: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().map(|state| state.listeners.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, OriginState>, StorageError> {
        self.state
            .lock()
            .map_err(|e| StorageError::Storage(format!("Failed to lock memory origin: {}", e)))
    }

    fn publish(&self, state: &mut OriginState, writer: u64, key: &str, new_value: Option<String>) {
        // Disconnected receivers are pruned here as well as on guard drop.
        state.listeners.retain(|listener| {
            if listener.tab == writer {
                return true;
            }
            let event = StorageEvent {
                key: key.to_string(),
                new_value: new_value.clone(),
            };
            listener.tx.send(event).is_ok()
        });
    }
}

pub(crate) struct ListenerGuard {
    origin: MemoryOrigin,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.origin.lock() {
            state.listeners.retain(|listener| listener.id != self.id);
        }
    }
}

#[derive(Clone)]
pub struct MemoryStorage {
    origin: MemoryOrigin,
    tab: u64,
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.origin.lock()?.items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut state = self.origin.lock()?;
        state.items.insert(key.to_string(), value.to_string());
        self.origin.publish(&mut state, self.tab, key, Some(value.to_string()));
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let mut state = self.origin.lock()?;
        if state.items.remove(key).is_some() {
            self.origin.publish(&mut state, self.tab, key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<Subscription, StorageError> {
        let (tx, rx) = mpsc::channel();
        let id = self.origin.next_id.fetch_add(1, Ordering::Relaxed);
        self.origin.lock()?.listeners.push(Listener { id, tab: self.tab, tx });
        let guard = ListenerGuard {
            origin: self.origin.clone(),
            id,
        };
        Ok(Subscription::new(rx, Registration::Listener(guard)))
    }
}
