//! Domain model (ids, task definitions, outcomes, result records, locks).

pub mod change;
pub mod errors;
pub mod ids;
pub mod lock;
pub mod outcome;
pub mod result;
pub mod state;
pub mod task;

pub use self::change::{ChangeRequest, ChangeRequestRef};
pub use self::errors::{
    ConfigError, EnvironmentError, ErrorKind, GenerateError, MergeError, OrchestratorError,
    StoreError,
};
pub use self::ids::{AttemptId, RunId, TaskKey};
pub use self::lock::{Claim, ClaimRequest, LockState, LockStatus};
pub use self::outcome::{FailureClass, MergeOutcome, MergeStatus};
pub use self::result::ResultRecord;
pub use self::state::MergeState;
pub use self::task::{GitRef, ImageSpec, NetworkPolicy, PhaseBudgets, ResourceLimits, Task};
