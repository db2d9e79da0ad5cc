//! stint-core
//!
//! Coordination engine for distributed batch jobs: concurrency tokens,
//! FIFO-fair critical sections, liveness-based death detection, and
//! partitioned work blocks with per-item tracking.
//!
//! # Module layout
//! - **domain**: the data model (ids, tasks, executions, tokens, critical
//!   sections, blocks, list items, events)
//! - **ports**: interfaces to the host (TaskStore, BlockStore, ConfigSource,
//!   Clock)
//! - **engine**: the coordination logic; `engine::context` is the front door
//! - **impls**: in-memory implementations for development and tests
//!
//! # Getting started
//! Build a [`TaskCoordinator`] over a store and a config source, create a
//! context for a task key, and drive it: `try_start`, `request_blocks`,
//! process, `complete`.

pub mod domain;
pub mod engine;
pub mod error;
pub mod impls;
pub mod ports;

pub use domain::{CriticalSectionType, TaskKey};
pub use engine::{
    BlockScope, CommitPolicy, ReprocessMode, ReprocessSettings, SectionGrant, TaskCoordinator,
    TaskExecutionContext, TokenGrant,
};
pub use error::StintError;
