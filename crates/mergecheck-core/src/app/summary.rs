//! Batch report: every requested task is either in `results` or in `skipped`.

use serde::Serialize;

use crate::domain::{MergeStatus, ResultRecord, RunId, TaskKey};

/// Why a requested task produced no result in this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A definitive result exists and `force` was not set.
    Done,
    /// Another live run holds the task.
    Busy { owner: RunId },
    /// No task is stored under the requested key.
    Missing,
    /// The batch was cancelled before the task was admitted.
    Cancelled,
    /// An interrupted run recorded the task's result before it could finish
    /// the lock. The lock was settled from that record.
    Recorded { run_id: RunId },
    /// The task's bookkeeping could not be read or written.
    Error { cause: String },
}

impl SkipReason {
    /// The task's result was recorded by an earlier run.
    pub fn settled_earlier(&self) -> bool {
        matches!(self, SkipReason::Done | SkipReason::Recorded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub task_key: TaskKey,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// Counts per terminal category.
///
/// A conflicted merge counts as `conflicted` whatever its build did. Tasks
/// skipped because an earlier run already recorded them count by that
/// earlier record, not as `skipped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub clean_success: usize,
    pub conflicted: usize,
    pub build_failed: usize,
    pub fetch_failed: usize,
    pub infra_error: usize,
    pub skipped: usize,
}

impl BatchSummary {
    pub fn from_parts(results: &[ResultRecord], previous: &[ResultRecord], skipped: &[Skipped]) -> Self {
        let mut summary = BatchSummary::default();
        for record in results.iter().chain(previous) {
            summary.count(record);
        }
        summary.skipped = skipped
            .iter()
            .filter(|s| {
                !(s.reason.settled_earlier() && previous.iter().any(|r| r.task_key == s.task_key))
            })
            .count();
        summary
    }

    fn count(&mut self, record: &ResultRecord) {
        match record.merge_outcome {
            MergeStatus::Conflicted => self.conflicted += 1,
            MergeStatus::FetchFailed => self.fetch_failed += 1,
            MergeStatus::InfraError => self.infra_error += 1,
            MergeStatus::Clean if record.build_success == Some(true) => self.clean_success += 1,
            MergeStatus::Clean if record.build_success == Some(false) => self.build_failed += 1,
            MergeStatus::Clean => self.infra_error += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.clean_success
            + self.conflicted
            + self.build_failed
            + self.fetch_failed
            + self.infra_error
            + self.skipped
    }

    /// Every requested task merged cleanly and built.
    pub fn is_clean(&self) -> bool {
        self.total() == self.clean_success
    }
}

/// Everything one orchestrator run produced.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: RunId,
    /// One terminal record per executed task, oldest first.
    pub results: Vec<ResultRecord>,
    /// Latest records of tasks skipped because an earlier run recorded them.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub previous: Vec<ResultRecord>,
    pub skipped: Vec<Skipped>,
    pub summary: BatchSummary,
}

impl BatchReport {
    pub fn new(
        run_id: RunId,
        mut results: Vec<ResultRecord>,
        mut previous: Vec<ResultRecord>,
        mut skipped: Vec<Skipped>,
    ) -> Self {
        crate::domain::result::sort_chronologically(&mut results);
        crate::domain::result::sort_chronologically(&mut previous);
        skipped.sort_by(|a, b| a.task_key.cmp(&b.task_key));
        let summary = BatchSummary::from_parts(&results, &previous, &skipped);
        Self {
            run_id,
            results,
            previous,
            skipped,
            summary,
        }
    }

    pub fn result_for(&self, key: &TaskKey) -> Option<&ResultRecord> {
        self.results.iter().find(|r| &r.task_key == key)
    }

    pub fn skip_reason(&self, key: &TaskKey) -> Option<&SkipReason> {
        self.skipped
            .iter()
            .find(|s| &s.task_key == key)
            .map(|s| &s.reason)
    }
}
