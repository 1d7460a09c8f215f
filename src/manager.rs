use crate::models::{Category, NewTask, Task, TaskError, TaskPatch, FALLBACK_CATEGORY};
use crate::storage::{
    parse_categories, parse_tasks, Storage, StorageError, StorageEvent, Subscription,
    CATEGORIES_KEY, TASKS_KEY,
};
use crate::view::{self, Stats, ViewFilter};
use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;

pub trait Clock: Send {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The in-memory task collection of one tab, written through to `storage`
/// on every change and replaced whenever another tab writes.
pub struct CollectionManager<'a> {
    storage: &'a dyn Storage,
    tasks: Vec<Task>, // always sorted by `order`
    categories: Vec<Category>,
    subscription: Option<Subscription>,
    clock: Box<dyn Clock>,
}

impl<'a> CollectionManager<'a> {
    pub fn open(storage: &'a dyn Storage) -> Result<Self, StorageError> {
        Self::with_clock(storage, Box::new(SystemClock))
    }

    pub fn with_clock(
        storage: &'a dyn Storage,
        clock: Box<dyn Clock>,
    ) -> Result<Self, StorageError> {
        // Subscribe before loading so a write landing in between is still announced
        let subscription = storage.subscribe()?;
        let mut tasks = storage.read_tasks()?;
        tasks.sort_by_key(|t| t.order);
        let categories = storage.read_categories()?;

        log::debug!(
            "loaded {} tasks and {} categories",
            tasks.len(),
            categories.len()
        );

        Ok(Self {
            storage,
            tasks,
            categories,
            subscription: Some(subscription),
            clock,
        })
    }

    /// Releases the change subscription. Dropping the manager does the same.
    pub fn close(mut self) {
        self.subscription.take();
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn category(&self, id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    /// The id of the only task whose id starts with `prefix`.
    pub fn resolve_id(&self, prefix: &str) -> Option<String> {
        if prefix.is_empty() {
            return None;
        }
        if let Some(task) = self.get(prefix) {
            return Some(task.id.clone());
        }
        let mut matches = self.tasks.iter().filter(|t| t.id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(task), None) => Some(task.id.clone()),
            _ => None,
        }
    }

    pub fn view(&self, filter: &ViewFilter) -> Vec<Task> {
        view::derive_view(&self.tasks, filter)
    }

    pub fn stats(&self, today: NaiveDate) -> Stats {
        view::stats(&self.tasks, today)
    }

    /// Appends a new task and returns its id. A blank title is ignored.
    pub fn add(&mut self, input: NewTask) -> Result<Option<String>, StorageError> {
        let category = match input.category.trim() {
            "" => self
                .categories
                .first()
                .map(|c| c.id.clone())
                .unwrap_or_else(|| FALLBACK_CATEGORY.to_string()),
            id => id.to_string(),
        };

        let mut task = match Task::new(input, category, self.tasks.len() as u32, self.clock.now()) {
            Ok(task) => task,
            Err(TaskError::EmptyTitle) => {
                log::debug!("ignoring task with empty title");
                return Ok(None);
            }
            Err(e) => return Err(StorageError::Storage(e.to_string())),
        };
        while self.get(&task.id).is_some() {
            task.id = uuid::Uuid::new_v4().to_string();
        }

        let id = task.id.clone();
        let mut next = self.tasks.clone();
        next.push(task);
        self.commit(next)?;

        log::debug!("added task {}", id);
        Ok(Some(id))
    }

    /// Overwrites the supplied fields. Returns `false` for an unknown id.
    pub fn update(&mut self, id: &str, patch: TaskPatch) -> Result<bool, StorageError> {
        let Some(index) = self.position(id) else {
            return Ok(false);
        };

        let mut next = self.tasks.clone();
        next[index].apply(patch, self.clock.now());
        self.commit(next)?;

        log::debug!("updated task {}", id);
        Ok(true)
    }

    pub fn toggle_complete(&mut self, id: &str) -> Result<bool, StorageError> {
        match self.get(id) {
            Some(task) => {
                let completed = !task.completed;
                self.update(id, TaskPatch::completed(completed))
            }
            None => Ok(false),
        }
    }

    /// Removes a task and closes the gap it leaves in the manual order.
    pub fn delete(&mut self, id: &str) -> Result<bool, StorageError> {
        let Some(index) = self.position(id) else {
            return Ok(false);
        };

        let mut next = self.tasks.clone();
        next.remove(index);
        renumber(&mut next);
        self.commit(next)?;

        log::debug!("deleted task {}", id);
        Ok(true)
    }

    /// Moves `view[from]` to where `view[to]` sits. `view` is whatever
    /// projection the user is looking at; positions are mapped back into the
    /// full collection so tasks hidden by a filter keep their places.
    pub fn reorder(&mut self, view: &[Task], from: usize, to: usize) -> Result<bool, StorageError> {
        if from == to || from >= view.len() || to >= view.len() {
            return Ok(false);
        }
        let from_pos = self.position(&view[from].id);
        let to_pos = self.position(&view[to].id);
        let (Some(from_pos), Some(to_pos)) = (from_pos, to_pos) else {
            return Ok(false);
        };

        let mut next = self.tasks.clone();
        let moved = next.remove(from_pos);
        next.insert(to_pos, moved);
        renumber(&mut next);
        self.commit(next)?;

        log::debug!("moved task {} to position {}", view[from].id, to_pos);
        Ok(true)
    }

    /// Replaces local state with a value written by another tab. Never
    /// writes back. Returns whether the event concerned this collection.
    pub fn apply_external_change(&mut self, event: &StorageEvent) -> Result<bool, StorageError> {
        match event.key.as_str() {
            TASKS_KEY => {
                let mut tasks = parse_tasks(event.new_value.as_deref())?;
                tasks.sort_by_key(|t| t.order);
                log::info!("tasks changed in another tab ({} tasks)", tasks.len());
                self.tasks = tasks;
                Ok(true)
            }
            CATEGORIES_KEY => {
                let categories = parse_categories(event.new_value.as_deref())?;
                log::info!(
                    "categories changed in another tab ({} categories)",
                    categories.len()
                );
                self.categories = categories;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Applies every pending external change without blocking.
    pub fn sync(&mut self) -> usize {
        let events = match &self.subscription {
            Some(subscription) => subscription.drain(),
            None => Vec::new(),
        };
        self.apply_all(events)
    }

    /// Waits up to `timeout` for an external change, then applies it along
    /// with anything else already queued.
    pub fn wait_for_change(&mut self, timeout: Duration) -> usize {
        let Some(subscription) = &self.subscription else {
            return 0;
        };
        let Some(first) = subscription.next_timeout(timeout) else {
            return 0;
        };
        let mut events = vec![first];
        events.extend(subscription.drain());
        self.apply_all(events)
    }

    fn apply_all(&mut self, events: Vec<StorageEvent>) -> usize {
        let mut applied = 0;
        for event in events {
            match self.apply_external_change(&event) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => log::warn!("ignoring malformed {} from another tab: {}", event.key, e),
            }
        }
        applied
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    /// Persists `next` and only then makes it the in-memory collection.
    fn commit(&mut self, next: Vec<Task>) -> Result<(), StorageError> {
        self.storage.write_tasks(&next)?;
        self.tasks = next;
        Ok(())
    }
}

fn renumber(tasks: &mut [Task]) {
    for (index, task) in tasks.iter_mut().enumerate() {
        task.order = index as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{default_categories, Priority};
    use crate::storage::test_utils::{create_test_storage, task, titles, StepClock};
    use crate::storage::{MemoryOrigin, UnavailableStorage};
    use crate::view::{CategoryFilter, SortKey};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn open(storage: &dyn Storage) -> CollectionManager<'_> {
        let clock = StepClock::starting_at(1_700_000_000);
        CollectionManager::with_clock(storage, Box::new(clock)).unwrap()
    }

    fn orders(manager: &CollectionManager) -> Vec<u32> {
        manager.tasks().iter().map(|t| t.order).collect()
    }

    fn add(manager: &mut CollectionManager, title: &str) -> String {
        manager.add(NewTask::titled(title)).unwrap().unwrap()
    }

    struct FailingStorage {
        inner: crate::storage::MemoryStorage,
    }

    impl Storage for FailingStorage {
        fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get_item(key)
        }

        fn set_item(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Storage("disk full".to_string()))
        }

        fn remove_item(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove_item(key)
        }

        fn subscribe(&self) -> Result<Subscription, StorageError> {
            self.inner.subscribe()
        }
    }

    #[test]
    fn test_open_sorts_by_order() {
        let (_origin, storage) = create_test_storage();
        storage
            .write_tasks(&[
                task("Third", Priority::Low, 2),
                task("First", Priority::Low, 0),
                task("Second", Priority::Low, 1),
            ])
            .unwrap();

        let manager = open(&storage);
        assert_eq!(titles(manager.tasks()), ["First", "Second", "Third"]);
        assert_eq!(manager.categories(), default_categories().as_slice());
    }

    #[test]
    fn test_add_appends_and_writes_through() {
        let (_origin, storage) = create_test_storage();
        let mut manager = open(&storage);
        add(&mut manager, "Email landlord");
        let id = add(&mut manager, "Book flights");

        let stored = storage.read_tasks().unwrap();
        assert_eq!(stored, manager.tasks());
        let added = manager.get(&id).unwrap();
        assert_eq!(added.order, 1);
        assert_eq!(added.created_at, added.updated_at);
        assert!(!added.completed);

        let view = manager.view(&ViewFilter::default());
        assert_eq!(view.last().unwrap().id, id);
    }

    #[test]
    fn test_add_picks_category() {
        let (_origin, storage) = create_test_storage();
        let mut manager = open(&storage);

        let mut input = NewTask::titled("Standup");
        input.category = "work".to_string();
        let explicit = manager.add(input).unwrap().unwrap();
        let implicit = add(&mut manager, "Read");
        assert_eq!(manager.get(&explicit).unwrap().category, "work");
        assert_eq!(manager.get(&implicit).unwrap().category, "personal");

        storage
            .write_categories(&[Category::new("errands", "Errands", "#123456")])
            .unwrap();
        let mut manager = open(&storage);
        let first_known = add(&mut manager, "Post office");
        assert_eq!(manager.get(&first_known).unwrap().category, "errands");

        storage.write_categories(&[]).unwrap();
        let mut manager = open(&storage);
        let fallback = add(&mut manager, "Anything");
        assert_eq!(manager.get(&fallback).unwrap().category, FALLBACK_CATEGORY);
    }

    #[test]
    fn test_add_with_blank_title_is_noop() {
        let (_origin, storage) = create_test_storage();
        let mut manager = open(&storage);
        assert_eq!(manager.add(NewTask::titled("  ")).unwrap(), None);
        assert!(manager.tasks().is_empty());
        assert_eq!(storage.get_item(TASKS_KEY).unwrap(), None);
    }

    #[test]
    fn test_update_then_toggle_restores_and_bumps_timestamp() {
        let (_origin, storage) = create_test_storage();
        let mut manager = open(&storage);
        let id = add(&mut manager, "Water plants");

        assert!(manager.update(&id, TaskPatch::completed(true)).unwrap());
        let after_update = manager.get(&id).unwrap().clone();
        assert!(after_update.completed);

        assert!(manager.toggle_complete(&id).unwrap());
        let after_toggle = manager.get(&id).unwrap();
        assert!(!after_toggle.completed);
        assert!(after_toggle.updated_at > after_update.updated_at);
        assert!(after_toggle.updated_at >= after_toggle.created_at);
        assert_eq!(after_toggle.created_at, after_update.created_at);
    }

    #[test]
    fn test_update_overwrites_only_supplied_fields() {
        let (_origin, storage) = create_test_storage();
        let mut manager = open(&storage);
        let id = add(&mut manager, "Plan trip");

        let patch = TaskPatch {
            priority: Some(Priority::High),
            due_date: Some(NaiveDate::from_ymd_opt(2024, 7, 1)),
            ..Default::default()
        };
        assert!(manager.update(&id, patch).unwrap());

        let task = manager.get(&id).unwrap();
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.title, "Plan trip");
        assert_eq!(task.order, 0);
        assert_eq!(storage.read_tasks().unwrap()[0].priority, Priority::High);
    }

    #[test]
    fn test_unknown_ids_are_noops() {
        let origin = MemoryOrigin::new();
        let storage = origin.open_tab();
        let observer = origin.open_tab();
        let mut manager = open(&storage);
        add(&mut manager, "Only task");
        let subscription = observer.subscribe().unwrap();

        assert!(!manager.update("missing", TaskPatch::completed(true)).unwrap());
        assert!(!manager.toggle_complete("missing").unwrap());
        assert!(!manager.delete("missing").unwrap());
        assert!(subscription.drain().is_empty());
    }

    #[test]
    fn test_delete_renumbers() {
        let (_origin, storage) = create_test_storage();
        let mut manager = open(&storage);
        let first = add(&mut manager, "First");
        add(&mut manager, "Second");
        assert_eq!(orders(&manager), [0, 1]);

        assert!(manager.delete(&first).unwrap());
        assert_eq!(titles(manager.tasks()), ["Second"]);
        assert_eq!(orders(&manager), [0]);
        assert_eq!(storage.read_tasks().unwrap()[0].order, 0);
    }

    #[test]
    fn test_orders_stay_dense_under_adds_and_deletes() {
        let (_origin, storage) = create_test_storage();
        let mut manager = open(&storage);
        let mut expected: Vec<String> = Vec::new();
        let mut seed: u64 = 42;

        for step in 0..200 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            if expected.is_empty() || seed % 3 != 0 {
                let title = format!("task {}", step);
                add(&mut manager, &title);
                expected.push(title);
            } else {
                let victim = (seed >> 33) as usize % expected.len();
                let id = manager.tasks()[victim].id.clone();
                manager.delete(&id).unwrap();
                expected.remove(victim);
            }

            let n = manager.tasks().len() as u32;
            assert_eq!(orders(&manager), (0..n).collect::<Vec<_>>());
            assert_eq!(titles(manager.tasks()), expected);
        }
    }

    #[test]
    fn test_reorder_full_view() {
        let (_origin, storage) = create_test_storage();
        let mut manager = open(&storage);
        for title in ["A", "B", "C", "D"] {
            add(&mut manager, title);
        }

        let view = manager.view(&ViewFilter::default());
        assert!(manager.reorder(&view, 0, 2).unwrap());
        assert_eq!(titles(manager.tasks()), ["B", "C", "A", "D"]);

        let view = manager.view(&ViewFilter::default());
        assert!(manager.reorder(&view, 3, 0).unwrap());
        assert_eq!(titles(manager.tasks()), ["D", "B", "C", "A"]);
        assert_eq!(orders(&manager), [0, 1, 2, 3]);
        assert_eq!(storage.read_tasks().unwrap(), manager.tasks());
    }

    #[test]
    fn test_reorder_under_filter_keeps_hidden_tasks() {
        let (_origin, storage) = create_test_storage();
        let mut manager = open(&storage);
        for (title, category) in [
            ("A", "work"),
            ("B", "home"),
            ("C", "work"),
            ("D", "home"),
            ("E", "work"),
        ] {
            let mut input = NewTask::titled(title);
            input.category = category.to_string();
            manager.add(input).unwrap();
        }

        let filter = ViewFilter {
            category: CategoryFilter::Only("work".to_string()),
            ..Default::default()
        };
        let view = manager.view(&filter);
        assert_eq!(titles(&view), ["A", "C", "E"]);

        assert!(manager.reorder(&view, 2, 0).unwrap());
        assert_eq!(titles(manager.tasks()), ["E", "A", "B", "C", "D"]);

        let view = manager.view(&filter);
        assert!(manager.reorder(&view, 0, 1).unwrap());
        assert_eq!(titles(&manager.view(&filter)), ["A", "E", "C"]);
        assert_eq!(titles(&storage.read_tasks().unwrap()), ["A", "E", "B", "C", "D"]);
        assert_eq!(orders(&manager), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_reorder_rejects_bad_positions() {
        let (_origin, storage) = create_test_storage();
        let mut manager = open(&storage);
        add(&mut manager, "A");
        add(&mut manager, "B");
        let view = manager.view(&ViewFilter::default());

        assert!(!manager.reorder(&view, 0, 0).unwrap());
        assert!(!manager.reorder(&view, 0, 5).unwrap());
        assert!(!manager.reorder(&[], 0, 1).unwrap());

        let stranger = task("Stranger", Priority::Low, 0);
        assert!(!manager.reorder(&[stranger, view[0].clone()], 0, 1).unwrap());
        assert_eq!(titles(manager.tasks()), ["A", "B"]);
    }

    #[test]
    fn test_failed_write_leaves_memory_untouched() {
        let origin = MemoryOrigin::new();
        let seed = origin.open_tab();
        seed.write_tasks(&[task("Existing", Priority::Low, 0)]).unwrap();

        let storage = FailingStorage {
            inner: origin.open_tab(),
        };
        let mut manager = open(&storage);

        assert!(manager.add(NewTask::titled("New")).is_err());
        assert!(manager.delete("id-existing").is_err());
        assert!(manager.toggle_complete("id-existing").is_err());
        assert_eq!(titles(manager.tasks()), ["Existing"]);
        assert!(!manager.tasks()[0].completed);
    }

    #[test]
    fn test_works_without_storage_medium() {
        let storage = UnavailableStorage;
        let mut manager = open(&storage);
        let id = add(&mut manager, "Ephemeral");
        assert!(manager.toggle_complete(&id).unwrap());
        assert_eq!(manager.tasks().len(), 1);
        assert!(storage.read_tasks().unwrap().is_empty());
        assert_eq!(manager.sync(), 0);
    }

    #[test]
    fn test_resolve_id() {
        let (_origin, storage) = create_test_storage();
        storage
            .write_tasks(&[task("Alpha", Priority::Low, 0), task("Alps", Priority::Low, 1)])
            .unwrap();
        let manager = open(&storage);

        assert_eq!(manager.resolve_id("id-alpha").as_deref(), Some("id-alpha"));
        assert_eq!(manager.resolve_id("id-alps").as_deref(), Some("id-alps"));
        assert_eq!(manager.resolve_id("id-alph").as_deref(), Some("id-alpha"));
        assert_eq!(manager.resolve_id("id-al"), None);
        assert_eq!(manager.resolve_id("nope"), None);
        assert_eq!(manager.resolve_id(""), None);
    }

    #[test]
    fn test_view_sorts_on_manager() {
        let (_origin, storage) = create_test_storage();
        let mut manager = open(&storage);
        for (title, priority) in [
            ("A", Priority::Medium),
            ("B", Priority::High),
            ("C", Priority::Low),
        ] {
            let mut input = NewTask::titled(title);
            input.priority = priority;
            manager.add(input).unwrap();
        }
        let view = manager.view(&ViewFilter::sorted_by(SortKey::Priority));
        assert_eq!(titles(&view), ["B", "A", "C"]);
        let view = manager.view(&ViewFilter::sorted_by(SortKey::CreatedAt));
        assert_eq!(titles(&view), ["C", "B", "A"]);
    }

    #[test]
    fn test_empty_external_value_clears_tasks() {
        let origin = MemoryOrigin::new();
        let writer = origin.open_tab();
        let reader = origin.open_tab();
        writer.write_tasks(&[task("Stale", Priority::Low, 0)]).unwrap();
        let mut manager = open(&reader);
        assert_eq!(manager.tasks().len(), 1);

        writer.set_item(TASKS_KEY, "").unwrap();
        assert_eq!(manager.sync(), 1);
        assert!(manager.tasks().is_empty());

        writer.set_item(CATEGORIES_KEY, "").unwrap();
        assert_eq!(manager.sync(), 1);
        assert!(manager.categories().is_empty());
    }

    struct RecordingStorage {
        inner: crate::storage::MemoryStorage,
        calls: Mutex<Vec<&'static str>>,
    }

    impl RecordingStorage {
        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Storage for RecordingStorage {
        fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.record("get");
            self.inner.get_item(key)
        }

        fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.inner.set_item(key, value)
        }

        fn remove_item(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove_item(key)
        }

        fn subscribe(&self) -> Result<Subscription, StorageError> {
            self.record("subscribe");
            self.inner.subscribe()
        }
    }

    #[test]
    fn test_subscribes_before_loading() {
        let (_origin, inner) = create_test_storage();
        let storage = RecordingStorage {
            inner,
            calls: Mutex::new(Vec::new()),
        };
        let _manager = open(&storage);
        assert_eq!(*storage.calls.lock().unwrap(), ["subscribe", "get", "get"]);
    }
}
