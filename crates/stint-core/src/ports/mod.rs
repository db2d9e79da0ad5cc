//! Ports: interfaces to external collaborators (persistence, configuration,
//! time). One trait per file; implementations live in `impls` or in the host
//! application.

pub mod block_store;
pub mod clock;
pub mod config;
pub mod task_store;

pub use self::block_store::BlockStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::config::{ConfigSource, StaticConfigSource, TaskConfig};
pub use self::task_store::{DefinitionLock, TaskStore};
