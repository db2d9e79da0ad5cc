//! Workload partitioning: splitting ranges and lists into ordered,
//! non-overlapping, bounded-size pieces.
//!
//! Pure policy, no storage. The generation cap stops a first run (or a run
//! after a long gap) from producing an unbounded number of blocks; callers
//! get what fits and pick up the remainder on the next run.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Split the half-open interval `[from, to)` into contiguous pieces no wider
/// than `max_block_range`, at most `max_blocks` of them.
pub fn split_date_range(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    max_block_range: Duration,
    max_blocks: u32,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut blocks = Vec::new();
    if from >= to || max_blocks == 0 {
        return blocks;
    }
    let step = chrono::Duration::from_std(max_block_range)
        .unwrap_or_else(|_| chrono::Duration::MAX)
        .max(chrono::Duration::milliseconds(1));

    let mut cursor = from;
    while cursor < to && blocks.len() < max_blocks as usize {
        // Overflowing timestamp arithmetic saturates to the interval end.
        let end = cursor.checked_add_signed(step).map_or(to, |end| end.min(to));
        blocks.push((cursor, end));
        cursor = end;
    }
    blocks
}

/// Split the inclusive interval `[from, to]` into contiguous pieces of at
/// most `max_block_size` values, at most `max_blocks` of them.
pub fn split_numeric_range(
    from: i64,
    to: i64,
    max_block_size: u64,
    max_blocks: u32,
) -> Vec<(i64, i64)> {
    let mut blocks = Vec::new();
    if from > to || max_blocks == 0 {
        return blocks;
    }
    let step = max_block_size.clamp(1, i64::MAX as u64) as i64;

    let mut cursor = from;
    while cursor <= to && blocks.len() < max_blocks as usize {
        let end = cursor.saturating_add(step - 1).min(to);
        blocks.push((cursor, end));
        if end == i64::MAX {
            break;
        }
        cursor = end + 1;
    }
    blocks
}

/// Batch a list into groups of at most `max_batch_size` items, at most
/// `max_blocks` groups. Leftover items beyond the cap are dropped from this
/// generation round.
pub fn split_list<T>(items: Vec<T>, max_batch_size: usize, max_blocks: u32) -> Vec<Vec<T>> {
    let mut batches = Vec::new();
    if max_blocks == 0 {
        return batches;
    }
    let size = max_batch_size.max(1);

    let mut batch = Vec::with_capacity(size);
    for item in items {
        batch.push(item);
        if batch.len() == size {
            batches.push(std::mem::replace(&mut batch, Vec::with_capacity(size)));
            if batches.len() == max_blocks as usize {
                return batches;
            }
        }
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}
