//! LockStore port: per-task ownership with compare-and-set claims.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{AttemptId, Claim, ClaimRequest, LockState, LockStatus, RunId, StoreError, TaskKey};

/// Store of `LockState`s.
///
/// # Design
/// - `try_claim` evaluates `domain::lock::evaluate_claim` and writes the
///   result inside one exclusive section: of several concurrent claimants
///   exactly one gets `Claim::Acquired`
/// - `heartbeat` and `finish` only apply to locks owned by the caller
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn load(&self, key: &TaskKey) -> Result<Option<LockState>, StoreError>;

    /// All locks, ordered by key.
    async fn list(&self) -> Result<Vec<LockState>, StoreError>;

    /// Creates a `pending` lock if none exists. Existing locks are left untouched.
    async fn register_pending(
        &self,
        key: &TaskKey,
        owner: RunId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn try_claim(&self, key: &TaskKey, request: ClaimRequest) -> Result<Claim, StoreError>;

    /// Refreshes `updated_at` (and records the attempt in flight).
    async fn heartbeat(
        &self,
        key: &TaskKey,
        owner: RunId,
        attempt_id: Option<AttemptId>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn finish(
        &self,
        key: &TaskKey,
        owner: RunId,
        status: LockStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
