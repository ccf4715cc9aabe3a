//! File-backed stores: JSON documents under a data directory.
//!
//! Layout:
//! - `tasks/<key>.json`
//! - `results/<key>/<attempt_id>.json`
//! - `locks/<key>.json`, guarded by an advisory lock on `locks/.guard`
//!
//! Every write goes to a temporary file in the target directory and is renamed
//! into place, so readers never observe a partial document. Lock transitions
//! take the guard file lock, which makes compare-and-set safe across processes
//! sharing the data directory.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::domain::lock::{evaluate_claim, owned_by};
use crate::domain::result::sort_chronologically;
use crate::domain::{
    AttemptId, Claim, ClaimRequest, LockState, LockStatus, ResultRecord, RunId, StoreError, Task,
    TaskKey,
};
use crate::ports::{LockStore, ResultStore, TaskFilter, TaskStore};

const GUARD_FILE: &str = ".guard";

/// Task, result and lock store rooted at a data directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Opens (and creates) the directory layout under `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };
        for dir in [store.tasks_dir(), store.results_root(), store.locks_dir()] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    fn results_root(&self) -> PathBuf {
        self.root.join("results")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn task_path(&self, key: &TaskKey) -> PathBuf {
        self.tasks_dir().join(format!("{key}.json"))
    }

    fn results_dir(&self, key: &TaskKey) -> PathBuf {
        self.results_root().join(key.as_str())
    }

    fn lock_path(&self, key: &TaskKey) -> PathBuf {
        self.locks_dir().join(format!("{key}.json"))
    }

    /// Runs `f` while holding the exclusive guard lock.
    fn with_guard<T>(
        &self,
        f: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard_path = self.locks_dir().join(GUARD_FILE);
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&guard_path)
            .map_err(|e| StoreError::io(&guard_path, e))?;
        guard
            .lock_exclusive()
            .map_err(|e| StoreError::io(&guard_path, e))?;
        let result = f();
        // Dropping the handle releases the lock as well.
        let _ = FileExt::unlock(&guard);
        result
    }

    fn update_lock(
        &self,
        key: &TaskKey,
        owner: RunId,
        apply: impl FnOnce(&mut LockState),
    ) -> Result<(), StoreError> {
        let path = self.lock_path(key);
        self.with_guard(|| {
            let mut current: Option<LockState> = read_json(&path)?;
            apply(owned_by(current.as_mut(), key, owner)?);
            if let Some(lock) = &current {
                write_json_atomic(&path, lock, true)?;
            }
            Ok(())
        })
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Serde {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T, overwrite: bool) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serde {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(&bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;

    let persisted = if overwrite {
        tmp.persist(path).map(|_| ())
    } else {
        tmp.persist_noclobber(path).map(|_| ())
    };
    persisted.map_err(|e| {
        if e.error.kind() == IoErrorKind::AlreadyExists {
            StoreError::AlreadyExists(path.display().to_string())
        } else {
            StoreError::io(path, e.error)
        }
    })
}

/// Reads every `*.json` document in `dir` (missing dir reads as empty).
fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(doc) = read_json(&path)? {
            out.push(doc);
        }
    }
    Ok(out)
}

#[async_trait]
impl TaskStore for FsStore {
    async fn put(&self, task: &Task) -> Result<(), StoreError> {
        let path = self.task_path(&task.key);
        let task = task.clone();
        blocking(move || write_json_atomic(&path, &task, true)).await
    }

    async fn get(&self, key: &TaskKey) -> Result<Task, StoreError> {
        let path = self.task_path(key);
        let missing = key.clone();
        blocking(move || read_json(&path)?.ok_or(StoreError::NotFound(missing))).await
    }

    async fn list(&self, filter: TaskFilter<'_>) -> Result<Vec<Task>, StoreError> {
        let dir = self.tasks_dir();
        let mut tasks: Vec<Task> = blocking(move || read_dir_json(&dir)).await?;
        tasks.retain(|t| filter(t));
        tasks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(tasks)
    }
}

#[async_trait]
impl ResultStore for FsStore {
    async fn append(&self, record: &ResultRecord) -> Result<(), StoreError> {
        let path = self
            .results_dir(&record.task_key)
            .join(format!("{}.json", record.attempt_id));
        let record = record.clone();
        blocking(move || write_json_atomic(&path, &record, false)).await
    }

    async fn list(&self, key: &TaskKey) -> Result<Vec<ResultRecord>, StoreError> {
        let dir = self.results_dir(key);
        let mut records: Vec<ResultRecord> = blocking(move || read_dir_json(&dir)).await?;
        sort_chronologically(&mut records);
        Ok(records)
    }
}

#[async_trait]
impl LockStore for FsStore {
    async fn load(&self, key: &TaskKey) -> Result<Option<LockState>, StoreError> {
        let path = self.lock_path(key);
        blocking(move || read_json(&path)).await
    }

    async fn list(&self) -> Result<Vec<LockState>, StoreError> {
        let dir = self.locks_dir();
        let mut locks: Vec<LockState> = blocking(move || read_dir_json(&dir)).await?;
        locks.sort_by(|a, b| a.task_key.cmp(&b.task_key));
        Ok(locks)
    }

    async fn register_pending(
        &self,
        key: &TaskKey,
        owner: RunId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let key = key.clone();
        blocking(move || {
            let path = store.lock_path(&key);
            store.with_guard(|| {
                if read_json::<LockState>(&path)?.is_none() {
                    write_json_atomic(&path, &LockState::pending(key.clone(), owner, now), true)?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn try_claim(&self, key: &TaskKey, request: ClaimRequest) -> Result<Claim, StoreError> {
        let store = self.clone();
        let key = key.clone();
        blocking(move || {
            let path = store.lock_path(&key);
            store.with_guard(|| {
                let current: Option<LockState> = read_json(&path)?;
                let claim = evaluate_claim(current.as_ref(), &key, &request);
                if let Claim::Acquired(lock) = &claim {
                    write_json_atomic(&path, lock, true)?;
                }
                Ok(claim)
            })
        })
        .await
    }

    async fn heartbeat(
        &self,
        key: &TaskKey,
        owner: RunId,
        attempt_id: Option<AttemptId>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let key = key.clone();
        blocking(move || store.update_lock(&key, owner, |lock| lock.touch(attempt_id, now))).await
    }

    async fn finish(
        &self,
        key: &TaskKey,
        owner: RunId,
        status: LockStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let key = key.clone();
        blocking(move || store.update_lock(&key, owner, |lock| lock.finish(status, now))).await
    }
}
