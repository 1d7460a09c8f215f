use crate::config::{ConfigError, ConfigManager, CONFIG_ENV};
use crate::manager::CollectionManager;
use crate::models::{parse_due_date, NewTask, Priority, Task, TaskError, TaskPatch};
use crate::storage::config::StorageConfig;
use crate::storage::{reset_storage, Storage, StorageError};
use crate::view::{CategoryFilter, PriorityFilter, SortKey, ViewFilter};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "trusty_todo_board", version, about = "A task list shared by every open terminal")]
pub struct Cli {
    /// Config file (defaults to $TTBOARD_CONFIG, then ~/.config/ttboard/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct FilterArgs {
    /// Only tasks whose title or description contains this text
    #[arg(long, default_value = "")]
    pub search: String,
    /// Category id, or `all`
    #[arg(long, default_value = "all")]
    pub category: CategoryFilter,
    /// high, medium, low, or `all`
    #[arg(long, default_value = "all")]
    pub priority: PriorityFilter,
    /// Leave completed tasks out
    #[arg(long)]
    pub hide_completed: bool,
}

impl FilterArgs {
    fn to_filter(&self, sort: SortKey) -> ViewFilter {
        ViewFilter {
            search: self.search.clone(),
            category: self.category.clone(),
            priority: self.priority,
            show_completed: !self.hide_completed,
            sort,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a task at the end of the list
    Add {
        title: String,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short, long)]
        priority: Option<Priority>,
        /// Category id (defaults to the configured or first category)
        #[arg(short, long)]
        category: Option<String>,
        /// Due date as YYYY-MM-DD
        #[arg(long, value_parser = parse_due_date)]
        due: Option<NaiveDate>,
    },
    /// Show tasks
    List {
        #[command(flatten)]
        filter: FilterArgs,
        /// manual, priority, due-date or created-at
        #[arg(long)]
        sort: Option<SortKey>,
    },
    /// Change fields of a task
    Edit {
        /// Task id or a unique prefix of it
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(short, long, conflicts_with = "clear_description")]
        description: Option<String>,
        #[arg(long)]
        clear_description: bool,
        #[arg(short, long)]
        priority: Option<Priority>,
        #[arg(short, long)]
        category: Option<String>,
        #[arg(long, value_parser = parse_due_date, conflicts_with = "clear_due")]
        due: Option<NaiveDate>,
        #[arg(long)]
        clear_due: bool,
    },
    /// Flip a task between pending and completed
    Toggle { id: String },
    /// Delete a task
    Delete { id: String },
    /// Move the task at one position of the manual list to another
    Move {
        /// 1-based position as shown by `list`
        from: usize,
        /// 1-based position as shown by `list`
        to: usize,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Show the known categories
    Categories,
    /// Show total, pending, completed and overdue counts
    Stats,
    /// Print a line whenever another process changes the tasks
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Delete every task and restore the default categories
    Reset,
    /// Read or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    Unset { key: String },
    List,
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("Stored data is unreadable ({0}). Run `reset` to start over.")]
    Malformed(String),
    #[error("Task not found: {0}")]
    NotFound(String),
    #[error("No task at position {0}")]
    InvalidPosition(usize),
    #[error("Nothing to change")]
    NothingToChange,
    #[error("Unknown config key: {0}")]
    UnknownKey(String),
}

fn config_path(cli_path: Option<PathBuf>) -> Option<PathBuf> {
    cli_path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

fn open_board(config_manager: &ConfigManager) -> Result<Box<dyn Storage>, CliError> {
    Ok(StorageConfig::from_config_manager(config_manager)?.open()?)
}

fn open_manager(storage: &dyn Storage) -> Result<CollectionManager<'_>, CliError> {
    CollectionManager::open(storage).map_err(|e| match e {
        StorageError::Serialization(e) => CliError::Malformed(e.to_string()),
        e => CliError::Storage(e),
    })
}

fn resolve(manager: &CollectionManager, id: &str) -> Result<String, CliError> {
    manager
        .resolve_id(id)
        .ok_or_else(|| CliError::NotFound(id.to_string()))
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn format_task(
    manager: &CollectionManager,
    position: usize,
    task: &Task,
    today: NaiveDate,
) -> String {
    let check = if task.completed { "x" } else { " " };
    let category = match manager.category(&task.category) {
        Some(category) => category.name.clone(),
        None => format!("{} (unmatched)", task.category),
    };
    let mut line = format!(
        "{:>3}. [{}] {}  [{}] {}",
        position, check, task.title, task.priority, category
    );
    if let Some(due) = task.due_date {
        line.push_str(&format!("  due {}", due));
        if task.is_overdue(today) {
            line.push_str(" OVERDUE");
        }
    }
    line.push_str(&format!("  ({})", short_id(&task.id)));
    if let Some(description) = task.description.as_deref().filter(|d| !d.is_empty()) {
        line.push_str(&format!("\n       {}", description));
    }
    line
}

pub fn run(cli: Cli) -> Result<(), CliError> {
    let mut config_manager = ConfigManager::new(config_path(cli.config).as_deref())?;
    let config = config_manager.config().clone();
    let today = chrono::Local::now().date_naive();

    match cli.command {
        Command::Add {
            title,
            description,
            priority,
            category,
            due,
        } => {
            let storage = open_board(&config_manager)?;
            let mut manager = open_manager(storage.as_ref())?;
            let input = NewTask {
                title: title.clone(),
                description,
                priority: priority.unwrap_or_else(|| config.priority()),
                category: category
                    .or_else(|| config.default_category.clone())
                    .unwrap_or_default(),
                due_date: due,
                completed: false,
            };
            let id = manager.add(input)?.ok_or(TaskError::EmptyTitle)?;
            println!("Added task {}: {}", short_id(&id), title.trim());
        }
        Command::List { filter, sort } => {
            let storage = open_board(&config_manager)?;
            let manager = open_manager(storage.as_ref())?;
            let view = manager.view(&filter.to_filter(sort.unwrap_or_else(|| config.sort())));
            if view.is_empty() {
                if manager.tasks().is_empty() {
                    println!("No todos yet. Use `add` to get started!");
                } else {
                    println!("No todos found. Try adjusting your filters.");
                }
            }
            for (index, task) in view.iter().enumerate() {
                println!("{}", format_task(&manager, index + 1, task, today));
            }
        }
        Command::Edit {
            id,
            title,
            description,
            clear_description,
            priority,
            category,
            due,
            clear_due,
        } => {
            let storage = open_board(&config_manager)?;
            let mut manager = open_manager(storage.as_ref())?;
            let id = resolve(&manager, &id)?;
            let patch = TaskPatch {
                title,
                description: if clear_description { Some(None) } else { description.map(Some) },
                completed: None,
                priority,
                category,
                due_date: if clear_due { Some(None) } else { due.map(Some) },
            };
            if patch.is_empty() {
                return Err(CliError::NothingToChange);
            }
            manager.update(&id, patch)?;
            println!("Updated task {}", short_id(&id));
        }
        Command::Toggle { id } => {
            let storage = open_board(&config_manager)?;
            let mut manager = open_manager(storage.as_ref())?;
            let id = resolve(&manager, &id)?;
            manager.toggle_complete(&id)?;
            let state = match manager.get(&id) {
                Some(task) if task.completed => "completed",
                _ => "pending",
            };
            println!("Task {} is now {}", short_id(&id), state);
        }
        Command::Delete { id } => {
            let storage = open_board(&config_manager)?;
            let mut manager = open_manager(storage.as_ref())?;
            let id = resolve(&manager, &id)?;
            manager.delete(&id)?;
            println!("Deleted task {}", short_id(&id));
        }
        Command::Move { from, to, filter } => {
            let storage = open_board(&config_manager)?;
            let mut manager = open_manager(storage.as_ref())?;
            let view = manager.view(&filter.to_filter(SortKey::Manual));
            for position in [from, to] {
                if position == 0 || position > view.len() {
                    return Err(CliError::InvalidPosition(position));
                }
            }
            if manager.reorder(&view, from - 1, to - 1)? {
                println!("Moved \"{}\" from {} to {}", view[from - 1].title, from, to);
            } else {
                println!("Nothing to move");
            }
        }
        Command::Categories => {
            let storage = open_board(&config_manager)?;
            let manager = open_manager(storage.as_ref())?;
            for category in manager.categories() {
                println!("{:<10} {:<10} {}", category.id, category.name, category.color);
            }
        }
        Command::Stats => {
            let storage = open_board(&config_manager)?;
            let manager = open_manager(storage.as_ref())?;
            let stats = manager.stats(today);
            println!("Total:     {}", stats.total);
            println!("Pending:   {}", stats.pending);
            println!("Completed: {}", stats.completed);
            println!("Overdue:   {}", stats.overdue);
        }
        Command::Watch { timeout_secs } => {
            let storage = open_board(&config_manager)?;
            let mut manager = open_manager(storage.as_ref())?;
            let deadline = timeout_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
            println!("Watching for changes ({} tasks)", manager.tasks().len());
            while deadline.map_or(true, |d| Instant::now() < d) {
                if manager.wait_for_change(Duration::from_millis(250)) > 0 {
                    let stats = manager.stats(today);
                    println!(
                        "Changed: {} tasks, {} pending, {} categories",
                        stats.total,
                        stats.pending,
                        manager.categories().len()
                    );
                }
            }
            manager.close();
        }
        Command::Reset => {
            println!("Warning: This will delete all tasks and categories. Continue? [y/N]");
            let mut answer = String::new();
            std::io::stdin().lock().read_line(&mut answer).map_err(StorageError::from)?;
            if answer.trim().eq_ignore_ascii_case("y") {
                reset_storage(open_board(&config_manager)?.as_ref())?;
                println!("Storage has been reset to the default categories");
            } else {
                println!("Operation cancelled");
            }
        }
        Command::Config { action } => run_config(&mut config_manager, &action)?,
    }

    Ok(())
}

fn run_config(manager: &mut ConfigManager, action: &ConfigAction) -> Result<(), CliError> {
    match action {
        ConfigAction::Get { key } => match manager.get(key) {
            Some(value) => println!("{}", value),
            None if crate::config::KEYS.contains(&key.as_str()) => println!("null"),
            None => return Err(CliError::UnknownKey(key.clone())),
        },
        ConfigAction::Set { key, value } => {
            manager.set(key, value)?;
            println!("{} = {}", key, value);
        }
        ConfigAction::Unset { key } => {
            manager.unset(key)?;
            println!("Unset {}", key);
        }
        ConfigAction::List => {
            for (key, value, is_default) in manager.list() {
                let marker = if is_default { " (default)" } else { "" };
                println!("{} = {}{}", key, value, marker);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_list_filters() {
        let cli = Cli::try_parse_from([
            "trusty_todo_board",
            "list",
            "--category",
            "work",
            "--priority",
            "high",
            "--hide-completed",
            "--sort",
            "due-date",
        ])
        .unwrap();
        match cli.command {
            Command::List { filter, sort } => {
                let filter = filter.to_filter(sort.unwrap());
                assert_eq!(filter.category, CategoryFilter::Only("work".to_string()));
                assert_eq!(filter.priority, PriorityFilter::Only(Priority::High));
                assert!(!filter.show_completed);
                assert_eq!(filter.sort, SortKey::DueDate);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_due_date() {
        let result = Cli::try_parse_from(["trusty_todo_board", "add", "Dentist", "--due", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_edit_clear_flags_conflict() {
        let result = Cli::try_parse_from([
            "trusty_todo_board",
            "edit",
            "abc",
            "--due",
            "2024-01-01",
            "--clear-due",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
