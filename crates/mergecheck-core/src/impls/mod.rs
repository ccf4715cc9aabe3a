//! Implementations of the ports.
//!
//! - stores: `InMemoryStore`, `FsStore`
//! - environment backends: `DockerBackend`, `LocalBackend`, `ScriptedBackend`
//! - metadata: `JsonFileSource`

pub mod docker;
pub mod fs;
pub mod json_source;
pub mod local;
pub mod memory;
mod process;
pub mod scripted;

pub use self::docker::{DockerBackend, DockerConfig};
pub use self::fs::FsStore;
pub use self::json_source::JsonFileSource;
pub use self::local::LocalBackend;
pub use self::memory::InMemoryStore;
pub use self::scripted::{Reply, ScriptedBackend, StartFault};
