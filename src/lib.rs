pub mod cli;
pub mod config;
pub mod manager;
pub mod models;
pub mod storage;
pub mod view;

pub use manager::CollectionManager;
pub use models::{Category, NewTask, Priority, Task, TaskPatch};
pub use storage::{Storage, StorageError, StorageEvent, Subscription};
pub use view::{derive_view, ViewFilter};
