//! TaskStore port: persisted task definitions.
//!
//! # Implementations
//! - `impls::memory::InMemoryStore` (tests, dry runs)
//! - `impls::fs::FsStore` (JSON documents under a data directory)

use async_trait::async_trait;

use crate::domain::{StoreError, Task, TaskKey};

/// Predicate used by `TaskStore::list`.
pub type TaskFilter<'a> = &'a (dyn Fn(&Task) -> bool + Send + Sync);

/// Keyed store of task definitions.
///
/// # Design
/// - `put` is atomic: readers observe either the old or the new definition
/// - last write wins
/// - `list` returns tasks ordered by key
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn put(&self, task: &Task) -> Result<(), StoreError>;

    /// Fails with `StoreError::NotFound` for unknown keys.
    async fn get(&self, key: &TaskKey) -> Result<Task, StoreError>;

    async fn list(&self, filter: TaskFilter<'_>) -> Result<Vec<Task>, StoreError>;
}
