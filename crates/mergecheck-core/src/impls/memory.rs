//! In-memory stores for tests and dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::lock::{evaluate_claim, owned_by};
use crate::domain::result::sort_chronologically;
use crate::domain::{
    AttemptId, Claim, ClaimRequest, LockState, LockStatus, ResultRecord, RunId, StoreError, Task,
    TaskKey,
};
use crate::ports::{LockStore, ResultStore, TaskFilter, TaskStore};

#[derive(Default)]
struct InMemoryState {
    tasks: BTreeMap<TaskKey, Task>,
    results: BTreeMap<TaskKey, Vec<ResultRecord>>,
    attempt_ids: HashSet<AttemptId>,
    locks: BTreeMap<TaskKey, LockState>,
    /// Most locks ever `running` at once.
    max_running: usize,
}

impl InMemoryState {
    fn running(&self) -> usize {
        self.locks
            .values()
            .filter(|l| l.status == LockStatus::Running)
            .count()
    }
}

/// Task, result and lock store backed by one mutex-guarded state.
///
/// Cloning shares the state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a lock (e.g. to simulate a crashed run).
    pub async fn insert_lock(&self, lock: LockState) {
        let mut state = self.state.lock().await;
        state.locks.insert(lock.task_key.clone(), lock);
    }

    /// Number of locks currently `running`.
    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running()
    }

    /// High-water mark of `running` locks since the store was created.
    pub async fn max_running(&self) -> usize {
        self.state.lock().await.max_running
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn put(&self, task: &Task) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.tasks.insert(task.key.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, key: &TaskKey) -> Result<Task, StoreError> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(&self, filter: TaskFilter<'_>) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.values().filter(|t| filter(t)).cloned().collect())
    }
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn append(&self, record: &ResultRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.attempt_ids.insert(record.attempt_id) {
            return Err(StoreError::AlreadyExists(record.attempt_id.to_string()));
        }
        let records = state.results.entry(record.task_key.clone()).or_default();
        records.push(record.clone());
        sort_chronologically(records);
        Ok(())
    }

    async fn list(&self, key: &TaskKey) -> Result<Vec<ResultRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.results.get(key).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl LockStore for InMemoryStore {
    async fn load(&self, key: &TaskKey) -> Result<Option<LockState>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.locks.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<LockState>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.locks.values().cloned().collect())
    }

    async fn register_pending(
        &self,
        key: &TaskKey,
        owner: RunId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .locks
            .entry(key.clone())
            .or_insert_with(|| LockState::pending(key.clone(), owner, now));
        Ok(())
    }

    async fn try_claim(&self, key: &TaskKey, request: ClaimRequest) -> Result<Claim, StoreError> {
        let mut state = self.state.lock().await;
        let claim = evaluate_claim(state.locks.get(key), key, &request);
        if let Claim::Acquired(lock) = &claim {
            state.locks.insert(key.clone(), lock.clone());
            state.max_running = state.max_running.max(state.running());
        }
        Ok(claim)
    }

    async fn heartbeat(
        &self,
        key: &TaskKey,
        owner: RunId,
        attempt_id: Option<AttemptId>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        owned_by(state.locks.get_mut(key), key, owner)?.touch(attempt_id, now);
        Ok(())
    }

    async fn finish(
        &self,
        key: &TaskKey,
        owner: RunId,
        status: LockStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        owned_by(state.locks.get_mut(key), key, owner)?.finish(status, now);
        Ok(())
    }
}
