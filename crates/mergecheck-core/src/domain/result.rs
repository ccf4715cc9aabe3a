//! Result records: one immutable record per recorded attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AttemptId, RunId, TaskKey};
use super::outcome::{FailureClass, MergeStatus};

/// Outcome record of one attempt.
///
/// Design:
/// - Written exactly once; stores refuse to overwrite an existing attempt id.
/// - `build_success` is `None` when the build never ran (fetch failure,
///   infrastructure failure before the build phase).
/// - `merge_outcome` and `build_success` are independent signals. A conflicted
///   merge that still builds is recorded as such; deciding whether that counts
///   as a pass is left to the reader of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_key: TaskKey,
    pub run_id: RunId,
    pub attempt_id: AttemptId,

    /// 1-based attempt number within the run.
    pub attempt_number: u32,

    pub merge_outcome: MergeStatus,
    pub build_success: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Tail of the combined build (or merge) output, bounded in size.
    #[serde(default)]
    pub output_excerpt: String,

    pub duration_sec: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_cause: Option<String>,
}

impl ResultRecord {
    /// Clean merge and a successful build.
    pub fn is_clean_success(&self) -> bool {
        self.merge_outcome == MergeStatus::Clean && self.build_success == Some(true)
    }

    /// A verdict rather than a fault: the build ran, or the fetch failed for
    /// a reason retrying cannot fix.
    pub fn is_definitive(&self) -> bool {
        self.build_success.is_some() || self.failure_class == Some(FailureClass::Fetch)
    }

    /// Chronological ordering key (finish time, then time-ordered attempt id).
    pub fn order_key(&self) -> (DateTime<Utc>, AttemptId) {
        (self.finished_at, self.attempt_id)
    }
}

/// Sorts records oldest first.
pub fn sort_chronologically(records: &mut [ResultRecord]) {
    records.sort_by_key(ResultRecord::order_key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn record(finished_offset_sec: i64, merge: MergeStatus, build: Option<bool>) -> ResultRecord {
        let started = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        ResultRecord {
            task_key: TaskKey::new("o_r_1"),
            run_id: RunId::from_ulid(Ulid::new()),
            attempt_id: AttemptId::from_ulid(Ulid::new()),
            attempt_number: 1,
            merge_outcome: merge,
            build_success: build,
            exit_code: None,
            output_excerpt: String::new(),
            duration_sec: 1.0,
            started_at: started,
            finished_at: started + Duration::seconds(finished_offset_sec),
            failure_class: None,
            failure_cause: None,
        }
    }

    #[test]
    fn clean_success_requires_both_signals() {
        assert!(record(0, MergeStatus::Clean, Some(true)).is_clean_success());
        assert!(!record(0, MergeStatus::Conflicted, Some(true)).is_clean_success());
        assert!(!record(0, MergeStatus::Clean, Some(false)).is_clean_success());
        assert!(!record(0, MergeStatus::FetchFailed, None).is_clean_success());
    }

    #[test]
    fn records_sort_by_finish_time() {
        let mut records = vec![
            record(30, MergeStatus::Clean, Some(true)),
            record(10, MergeStatus::Clean, Some(false)),
            record(20, MergeStatus::Conflicted, Some(true)),
        ];
        sort_chronologically(&mut records);

        let offsets: Vec<_> = records
            .iter()
            .map(|r| (r.finished_at - r.started_at).num_seconds())
            .collect();
        assert_eq!(offsets, vec![10, 20, 30]);
    }

    #[test]
    fn null_build_success_is_serialized() {
        let json = serde_json::to_value(record(0, MergeStatus::FetchFailed, None)).unwrap();
        assert_eq!(json["merge_outcome"], "FetchFailed");
        assert!(json["build_success"].is_null());
    }
}
