//! Ports: the seams between the core and the outside world.
//!
//! Each trait hides one external system (filesystem, container runtime, wall
//! clock). The orchestrator is written against these traits only.

pub mod change_source;
pub mod clock;
pub mod environment;
pub mod id_generator;
pub mod lock_store;
pub mod result_store;
pub mod task_store;

pub use self::change_source::ChangeRequestSource;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::environment::{
    Environment, EnvironmentBackend, EnvironmentRequest, EnvironmentState, ExecResult, ExecStatus,
};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::lock_store::LockStore;
pub use self::result_store::ResultStore;
pub use self::task_store::{TaskFilter, TaskStore};
