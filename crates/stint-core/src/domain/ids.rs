//! Strongly-typed identifiers.
//!
//! All ids are ULID-backed: lexicographically sortable by creation time and
//! generatable on any node without coordination. A phantom marker type keeps
//! the id families apart at compile time (a `BlockId` cannot be passed where
//! a `TaskExecutionId` is expected).

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Marker trait for id families. Provides the `Display` prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id. `T` is a zero-sized marker.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Generate a fresh id with the given millisecond timestamp and random
    /// entropy. Ids generated this way sort by `timestamp_ms`.
    pub fn generate(timestamp_ms: u64) -> Self {
        Self::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

macro_rules! id_marker {
    ($marker:ident, $alias:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $marker {}

        impl IdMarker for $marker {
            fn prefix() -> &'static str {
                $prefix
            }
        }

        #[doc = $doc]
        pub type $alias = Id<$marker>;
    };
}

id_marker!(Definition, TaskDefinitionId, "def-", "Identifier of a TaskDefinition.");
id_marker!(Execution, TaskExecutionId, "exec-", "Identifier of a TaskExecution (one run attempt).");
id_marker!(Token, TokenId, "token-", "Identifier of an ExecutionToken (concurrency slot).");
id_marker!(BlockMarker, BlockId, "block-", "Identifier of a Block (immutable work partition).");
id_marker!(BlockExecutionMarker, BlockExecutionId, "run-", "Identifier of a BlockExecution (one processing attempt).");
id_marker!(ListItem, ListItemId, "item-", "Identifier of a ListBlockItem.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types_with_prefixes() {
        let def = TaskDefinitionId::from_ulid(Ulid::new());
        let exec = TaskExecutionId::from_ulid(Ulid::new());
        let block = BlockId::from_ulid(Ulid::new());

        assert!(def.to_string().starts_with("def-"));
        assert!(exec.to_string().starts_with("exec-"));
        assert!(block.to_string().starts_with("block-"));

        // Mixing families is a compile error:
        // let _: TaskDefinitionId = exec;
    }

    #[test]
    fn generated_ids_sort_by_timestamp() {
        let a = BlockId::generate(1_000);
        let b = BlockId::generate(2_000);
        let c = BlockId::generate(3_000);

        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn serde_roundtrip() {
        let id = TaskExecutionId::from_ulid(Ulid::new());
        let s = serde_json::to_string(&id).unwrap();
        let back: TaskExecutionId = serde_json::from_str(&s).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn phantom_marker_is_zero_sized() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskDefinitionId>(), size_of::<Ulid>());
        assert_eq!(size_of::<BlockExecutionId>(), 16);
    }
}
