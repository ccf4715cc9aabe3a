//! mergecheck-core
//!
//! Verifies that a change request merges cleanly into its target branch and
//! that the merged tree builds, inside a disposable isolated environment.
//!
//! # Modules
//! - **domain**: task definitions, outcomes, result records, locks, errors
//! - **ports**: stores, environment backend, clock, id generator, metadata source
//! - **app**: environment manager, merge simulator, build verifier, orchestrator,
//!   task generator
//! - **impls**: in-memory and filesystem stores; docker, local and scripted backends
//! - **config**: settings file and environment overrides

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
