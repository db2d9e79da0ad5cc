//! Engine: the coordination logic built on the domain model and the ports.
//!
//! `context` is the front door; the other modules are its parts (token pool,
//! critical sections, death detection, block allocation, item tracking) and
//! are usable on their own.

pub mod blocks;
pub mod cache;
pub mod context;
pub mod critical_section;
pub mod death;
pub mod list_tracker;
pub mod partitioner;
pub mod retry;
pub mod tokens;

pub use blocks::{BlockAllocator, BlockHandle, BlockScope, ReprocessMode, ReprocessSettings};
pub use cache::DefinitionCache;
pub use context::{TaskCoordinator, TaskExecutionContext};
pub use critical_section::{CriticalSectionArbiter, SectionGrant};
pub use death::has_expired;
pub use list_tracker::{CommitPolicy, ListBlockTracker, TrackedItem};
pub use retry::{AcquisitionRetry, StorageRetryPolicy, retry_transient};
pub use tokens::{ExecutionTokenManager, TokenGrant};
