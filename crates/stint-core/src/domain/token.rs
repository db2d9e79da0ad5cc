//! Execution tokens: concurrency slots owned by a task definition.
//!
//! The pool is persisted as one opaque value on the task definition and only
//! ever mutated under the definition lock. The encoding is versioned so it is
//! reproducible across implementations.

use serde::{Deserialize, Serialize};

use super::ids::{TaskExecutionId, TokenId};

/// Status of a single concurrency slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Free to grant.
    Available,

    /// Granted to a (presumed live) execution.
    Unavailable,

    /// Administratively withheld; never granted, never reclaimed.
    Disabled,

    /// Single token representing "no concurrency limit": granted to anyone
    /// who asks, never flipped to Unavailable.
    Unlimited,
}

/// One concurrency slot.
///
/// `granted_to` is left in place when a token is released: once the status
/// flips back to Available the grant is audit trail, not authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionToken {
    pub token_id: TokenId,
    pub status: TokenStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_to: Option<TaskExecutionId>,
}

impl ExecutionToken {
    pub fn available(token_id: TokenId) -> Self {
        Self {
            token_id,
            status: TokenStatus::Available,
            granted_to: None,
        }
    }

    pub fn unlimited(token_id: TokenId) -> Self {
        Self {
            token_id,
            status: TokenStatus::Unlimited,
            granted_to: None,
        }
    }

    pub fn is_assignable(&self) -> bool {
        matches!(self.status, TokenStatus::Available | TokenStatus::Unlimited)
    }
}

/// Versioned wire form of the token pool.
///
/// Order matters: index 0 is the oldest token, and shrinking removes from the
/// front once no Available token is left to remove instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPool {
    pub version: u32,
    pub tokens: Vec<ExecutionToken>,
}

impl TokenPool {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(tokens: Vec<ExecutionToken>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            tokens,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Default for TokenPool {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn available_and_unlimited_are_assignable() {
        let a = ExecutionToken::available(TokenId::from_ulid(Ulid::new()));
        let u = ExecutionToken::unlimited(TokenId::from_ulid(Ulid::new()));
        assert!(a.is_assignable());
        assert!(u.is_assignable());

        let mut granted = a.clone();
        granted.status = TokenStatus::Unavailable;
        assert!(!granted.is_assignable());
    }

    #[test]
    fn pool_encoding_is_versioned() {
        let pool = TokenPool::new(vec![ExecutionToken::available(TokenId::from_ulid(
            Ulid::new(),
        ))]);
        let v: serde_json::Value = serde_json::to_value(&pool).unwrap();
        assert_eq!(v["version"], 1);
        assert_eq!(v["tokens"][0]["status"], "available");

        let back: TokenPool = serde_json::from_value(v).unwrap();
        assert_eq!(back, pool);
    }

    #[test]
    fn released_token_keeps_grant_for_audit() {
        let exec = TaskExecutionId::from_ulid(Ulid::new());
        let mut t = ExecutionToken::available(TokenId::from_ulid(Ulid::new()));
        t.status = TokenStatus::Unavailable;
        t.granted_to = Some(exec);

        t.status = TokenStatus::Available;
        assert_eq!(t.granted_to, Some(exec));
        assert!(t.is_assignable());
    }
}
