//! Read-only projections over a task collection: the filtered and sorted view
//! a front end displays, and the summary counts shown above it.

use crate::models::{Priority, PriorityError, Task};
use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Manual,
    Priority,
    DueDate,
    CreatedAt,
}

impl SortKey {
    pub fn to_str(self) -> &'static str {
        match self {
            SortKey::Manual => "manual",
            SortKey::Priority => "priority",
            SortKey::DueDate => "due-date",
            SortKey::CreatedAt => "created-at",
        }
    }
}

impl FromStr for SortKey {
    type Err = ViewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(SortKey::Manual),
            "priority" => Ok(SortKey::Priority),
            "due-date" | "duedate" => Ok(SortKey::DueDate),
            "created-at" | "createdat" | "created" => Ok(SortKey::CreatedAt),
            _ => Err(ViewError::InvalidSort(s.to_string())),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

/// `all` or one category id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CategoryFilter {
    #[default]
    All,
    Only(String),
}

impl FromStr for CategoryFilter {
    type Err = ViewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(ViewError::EmptyCategory),
            "all" => Ok(CategoryFilter::All),
            id => Ok(CategoryFilter::Only(id.to_string())),
        }
    }
}

/// `all` or one priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityFilter {
    #[default]
    All,
    Only(Priority),
}

impl FromStr for PriorityFilter {
    type Err = ViewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(PriorityFilter::All);
        }
        Ok(PriorityFilter::Only(s.parse()?))
    }
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("Invalid sort: {0} (expected manual, priority, due-date or created-at)")]
    InvalidSort(String),
    #[error("Category filter cannot be empty")]
    EmptyCategory,
    #[error(transparent)]
    Priority(#[from] PriorityError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewFilter {
    pub search: String,
    pub category: CategoryFilter,
    pub priority: PriorityFilter,
    pub show_completed: bool,
    pub sort: SortKey,
}

impl Default for ViewFilter {
    /// Every task, in manual order.
    fn default() -> Self {
        Self {
            search: String::new(),
            category: CategoryFilter::All,
            priority: PriorityFilter::All,
            show_completed: true,
            sort: SortKey::Manual,
        }
    }
}

impl ViewFilter {
    pub fn sorted_by(sort: SortKey) -> Self {
        Self {
            sort,
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        let needle = self.search.to_lowercase();
        let matches_search = needle.is_empty()
            || task.title.to_lowercase().contains(&needle)
            || task
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&needle));
        let matches_category = match &self.category {
            CategoryFilter::All => true,
            CategoryFilter::Only(id) => &task.category == id,
        };
        let matches_priority = match self.priority {
            PriorityFilter::All => true,
            PriorityFilter::Only(priority) => task.priority == priority,
        };
        let matches_completed = self.show_completed || !task.completed;

        matches_search && matches_category && matches_priority && matches_completed
    }
}

/// Filters `tasks`, then sorts the survivors. Every sort is stable, so ties
/// keep the order the tasks came in.
pub fn derive_view(tasks: &[Task], filter: &ViewFilter) -> Vec<Task> {
    let mut view: Vec<Task> = tasks.iter().filter(|t| filter.matches(t)).cloned().collect();

    match filter.sort {
        SortKey::Manual => view.sort_by_key(|t| t.order),
        SortKey::Priority => view.sort_by_key(|t| t.priority.rank()),
        // Undated tasks rank equal to each other and after every dated one
        SortKey::DueDate => view.sort_by_key(|t| (t.due_date.is_none(), t.due_date)),
        SortKey::CreatedAt => view.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
    }

    view
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub overdue: usize,
}

pub fn stats(tasks: &[Task], today: NaiveDate) -> Stats {
    let completed = tasks.iter().filter(|t| t.completed).count();
    Stats {
        total: tasks.len(),
        pending: tasks.len() - completed,
        completed,
        overdue: tasks.iter().filter(|t| t.is_overdue(today)).count(),
    }
}
