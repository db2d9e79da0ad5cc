//! Implementations of the ports for development and tests.

mod memory;

pub use memory::InMemoryStore;
