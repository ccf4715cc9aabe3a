//! ResultStore port: append-only result records.

use async_trait::async_trait;

use crate::domain::{ResultRecord, StoreError, TaskKey};

/// Append-only store of result records, one per recorded attempt.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Fails with `StoreError::AlreadyExists` if the attempt id was recorded before.
    async fn append(&self, record: &ResultRecord) -> Result<(), StoreError>;

    /// All records of a task, oldest first.
    async fn list(&self, key: &TaskKey) -> Result<Vec<ResultRecord>, StoreError>;

    /// The most recent record of a task.
    async fn latest(&self, key: &TaskKey) -> Result<Option<ResultRecord>, StoreError> {
        Ok(self.list(key).await?.pop())
    }
}
