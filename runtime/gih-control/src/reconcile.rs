//! Merging the three log channels into one view
//!
//! # Caveat on `BySequenceCount`
//! Every channel keeps its own counter. The interrupt channel counts every
//! caught interrupt while the workqueue channels only count the deferred
//! writes that actually ran, so as soon as an interrupt is missed the
//! counters drift apart. Ordering by count is therefore only meaningful
//! within one channel and does NOT reconstruct the global event order.
//! Use [`SortKey::ByTimestamp`] for that.

use core::fmt;
use core::str::FromStr;

use crate::logs::LogRecord;
use crate::{GihError, Result};

/// Ordering applied by [`merge_channels`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    /// Interrupt, then workqueue-entry, then workqueue-exit records
    #[default]
    ByChannel,
    /// Chronological, ties kept in channel order
    ByTimestamp,
    /// By per-channel counter. See the module level caveat.
    BySequenceCount,
}

impl FromStr for SortKey {
    type Err = GihError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "type" | "channel" => Ok(SortKey::ByChannel),
            "time" | "timestamp" => Ok(SortKey::ByTimestamp),
            "count" | "sequence" => Ok(SortKey::BySequenceCount),
            other => Err(GihError::UnsupportedSortKey(other.to_string())),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SortKey::ByChannel => "channel",
            SortKey::ByTimestamp => "time",
            SortKey::BySequenceCount => "count",
        };
        f.write_str(name)
    }
}

/// Merge the records of the three channels.
///
/// Each argument holds one channel's records in read order. Sorting is
/// stable, so records with equal keys keep their channel-concatenation
/// order.
///
/// # Errors
/// `MalformedRecord` if a record lacks the key the ordering needs.
pub fn merge_channels(
    interrupts: Vec<LogRecord>,
    entered: Vec<LogRecord>,
    exited: Vec<LogRecord>,
    order: SortKey,
) -> Result<Vec<LogRecord>> {
    let mut merged = interrupts;
    merged.reserve(entered.len() + exited.len());
    merged.extend(entered);
    merged.extend(exited);

    match order {
        SortKey::ByChannel => {}
        SortKey::ByTimestamp => {
            ensure_all(&merged, "timestamp", |r| r.timestamp_token.is_some())?;
            merged.sort_by(|a, b| a.timestamp_token.cmp(&b.timestamp_token));
        }
        SortKey::BySequenceCount => {
            ensure_all(&merged, "sequence count", |r| r.sequence_count.is_some())?;
            merged.sort_by_key(|r| r.sequence_count);
        }
    }
    Ok(merged)
}

fn ensure_all(records: &[LogRecord], key: &'static str, has_key: impl Fn(&LogRecord) -> bool) -> Result<()> {
    match records.iter().find(|r| !has_key(r)) {
        Some(record) => Err(GihError::MalformedRecord {
            key,
            line: record.raw_line.clone(),
        }),
        None => Ok(()),
    }
}
