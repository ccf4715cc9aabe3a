//! LockState: per-task ownership and resume bookkeeping.
//!
//! Stores keep one `LockState` per task key. All status transitions go through
//! the methods here; the claim rule (`evaluate_claim`) is a pure function that
//! stores run inside their exclusive section to get compare-and-set semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StoreError;
use super::ids::{AttemptId, RunId, TaskKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// Planned by a run, not started yet.
    Pending,
    /// An attempt owns the task. Kept alive by heartbeats.
    Running,
    /// A definitive result was recorded.
    Done,
    /// Transient infrastructure failures exhausted the retry budget.
    Failed,
}

impl LockStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, LockStatus::Done | LockStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub task_key: TaskKey,
    pub status: LockStatus,
    pub owner: RunId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<AttemptId>,

    /// Last transition or heartbeat.
    pub updated_at: DateTime<Utc>,
}

impl LockState {
    pub fn pending(task_key: TaskKey, owner: RunId, now: DateTime<Utc>) -> Self {
        Self {
            task_key,
            status: LockStatus::Pending,
            owner,
            attempt_id: None,
            updated_at: now,
        }
    }

    /// A running lock whose heartbeat is older than `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == LockStatus::Running && now - self.updated_at > stale_after
    }

    /// Mark as running for `owner`.
    pub fn start(&mut self, owner: RunId, now: DateTime<Utc>) {
        self.status = LockStatus::Running;
        self.owner = owner;
        self.attempt_id = None;
        self.updated_at = now;
    }

    /// Record the attempt currently in flight and refresh the heartbeat.
    pub fn touch(&mut self, attempt_id: Option<AttemptId>, now: DateTime<Utc>) {
        if attempt_id.is_some() {
            self.attempt_id = attempt_id;
        }
        self.updated_at = now;
    }

    /// Mark as done/failed.
    pub fn finish(&mut self, status: LockStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

/// Parameters of a claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest {
    pub owner: RunId,
    pub now: DateTime<Utc>,
    /// Grace period after which a running lock without heartbeat is reclaimable.
    pub stale_after: chrono::Duration,
    /// Re-run tasks that are already done.
    pub force: bool,
}

/// Result of a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the task.
    Acquired(LockState),
    /// The task is done and `force` was not set.
    AlreadyDone,
    /// Another live owner is running the task.
    Busy { owner: RunId },
}

/// Claim rule.
///
/// - absent, `pending`, `failed`: claimable
/// - `running`: claimable when owned by the caller's run or stale
/// - `done`: claimable only with `force`
pub fn evaluate_claim(current: Option<&LockState>, key: &TaskKey, req: &ClaimRequest) -> Claim {
    let mut next = match current {
        None => LockState::pending(key.clone(), req.owner, req.now),
        Some(state) => {
            match state.status {
                LockStatus::Pending | LockStatus::Failed => {}
                LockStatus::Running => {
                    if state.owner != req.owner && !state.is_stale(req.now, req.stale_after) {
                        return Claim::Busy { owner: state.owner };
                    }
                }
                LockStatus::Done => {
                    if !req.force {
                        return Claim::AlreadyDone;
                    }
                }
            }
            state.clone()
        }
    };
    next.start(req.owner, req.now);
    Claim::Acquired(next)
}

/// Returns the lock if `owner` holds it as `running`.
pub fn owned_by<'a>(
    current: Option<&'a mut LockState>,
    key: &TaskKey,
    owner: RunId,
) -> Result<&'a mut LockState, StoreError> {
    match current {
        Some(state) if state.owner == owner && state.status == LockStatus::Running => Ok(state),
        _ => Err(StoreError::NotOwner { key: key.clone() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn request(owner: RunId, at: DateTime<Utc>, force: bool) -> ClaimRequest {
        ClaimRequest {
            owner,
            now: at,
            stale_after: Duration::seconds(60),
            force,
        }
    }

    fn state(status: LockStatus, owner: RunId, updated_at: DateTime<Utc>) -> LockState {
        LockState {
            task_key: TaskKey::new("o_r_1"),
            status,
            owner,
            attempt_id: None,
            updated_at,
        }
    }

    #[test]
    fn absent_lock_is_claimed() {
        let me = RunId::from_ulid(Ulid::new());
        let key = TaskKey::new("o_r_1");
        let Claim::Acquired(lock) = evaluate_claim(None, &key, &request(me, t0(), false)) else {
            panic!("expected claim");
        };
        assert_eq!(lock.status, LockStatus::Running);
        assert_eq!(lock.owner, me);
    }

    #[rstest]
    #[case::pending(LockStatus::Pending, 0, false, true)]
    #[case::failed(LockStatus::Failed, 0, false, true)]
    #[case::live_running(LockStatus::Running, 30, false, false)]
    #[case::stale_running(LockStatus::Running, 61, false, true)]
    #[case::done(LockStatus::Done, 0, false, false)]
    #[case::done_forced(LockStatus::Done, 0, true, true)]
    fn claim_rule_for_foreign_locks(
        #[case] status: LockStatus,
        #[case] age_sec: i64,
        #[case] force: bool,
        #[case] claimable: bool,
    ) {
        let other = RunId::from_ulid(Ulid::new());
        let me = RunId::from_ulid(Ulid::new());
        let current = state(status, other, t0());
        let req = request(me, t0() + Duration::seconds(age_sec), force);

        let claim = evaluate_claim(Some(&current), &current.task_key, &req);
        assert_eq!(matches!(claim, Claim::Acquired(_)), claimable, "{claim:?}");
    }

    #[test]
    fn done_without_force_reports_already_done() {
        let me = RunId::from_ulid(Ulid::new());
        let current = state(LockStatus::Done, me, t0());
        let claim = evaluate_claim(Some(&current), &current.task_key, &request(me, t0(), false));
        assert_eq!(claim, Claim::AlreadyDone);
    }

    #[test]
    fn reclaimed_lock_rejects_previous_owner() {
        let old = RunId::from_ulid(Ulid::new());
        let me = RunId::from_ulid(Ulid::new());
        let mut current = state(LockStatus::Running, me, t0());

        assert!(owned_by(Some(&mut current), &TaskKey::new("o_r_1"), old).is_err());
        assert!(owned_by(Some(&mut current), &TaskKey::new("o_r_1"), me).is_ok());
        assert!(owned_by(None, &TaskKey::new("o_r_1"), me).is_err());
    }

    #[test]
    fn own_running_lock_is_reentrant() {
        let me = RunId::from_ulid(Ulid::new());
        let current = state(LockStatus::Running, me, t0());
        let claim = evaluate_claim(Some(&current), &current.task_key, &request(me, t0(), false));
        assert!(matches!(claim, Claim::Acquired(_)));
    }
}
