//! Items of a List block, with their own status lifecycle.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use super::ids::{BlockId, ListItemId};
use crate::error::StintError;

/// Item status. Terminal except `Failed`, which may be re-selected on a
/// later attempt via `get_items(&[Pending, Failed])`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Completed,
    Failed,
    Discarded,
}

/// Stored form of an item value. Values above the configured byte threshold
/// are gzip-compressed before persistence and transparently decompressed on
/// read; the choice is made by the list tracker, not the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum ItemValue {
    Plain(String),
    Compressed(Vec<u8>),
}

impl ItemValue {
    /// Encode a value, compressing it when it exceeds `threshold` bytes.
    pub fn encode(value: String, threshold: usize) -> Result<Self, StintError> {
        if value.len() <= threshold {
            return Ok(Self::Plain(value));
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(value.as_bytes())
            .and_then(|_| encoder.finish())
            .map(Self::Compressed)
            .map_err(|e| StintError::Execution(format!("compressing item value: {e}")))
    }

    /// Decode back to the original string.
    pub fn decode(&self) -> Result<String, StintError> {
        match self {
            Self::Plain(s) => Ok(s.clone()),
            Self::Compressed(bytes) => {
                let mut out = String::new();
                GzDecoder::new(bytes.as_slice())
                    .read_to_string(&mut out)
                    .map_err(|e| StintError::Execution(format!("decompressing item value: {e}")))?;
                Ok(out)
            }
        }
    }
}

/// One element of a List block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListBlockItem {
    pub id: ListItemId,
    pub block_id: BlockId,
    pub value: ItemValue,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
}

impl ListBlockItem {
    pub fn pending(id: ListItemId, block_id: BlockId, value: ItemValue) -> Self {
        Self {
            id,
            block_id,
            value,
            status: ItemStatus::Pending,
            status_reason: None,
            step: None,
        }
    }
}
