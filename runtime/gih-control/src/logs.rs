//! Log channel reading and record decoding
//!
//! The driver keeps three independent logs, each exposed as its own device
//! node. Reading a node drains it and returns one text line per event:
//!
//! ```text
//! [0000001234.567890] interrupt count: 42 | write size: 16
//! ```
//!
//! The bracketed part is a fixed-width timestamp (lexical order is
//! chronological order) and the fourth whitespace-separated token is the
//! channel's own event counter.

use core::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::debug;

use crate::reconcile::{merge_channels, SortKey};
use crate::settings::Settings;
use crate::{GihError, Result};

/// Default read cap for one channel (256 byte lines x 8192 fifo entries)
pub const DEFAULT_MAX_LOG_BYTES: usize = 256 * 8192;

/// One of the three event logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    /// `gihlog0`: an interrupt was caught
    InterruptFired,
    /// `gihlog1`: the deferred write started
    WorkqueueEntered,
    /// `gihlog2`: the deferred write finished
    WorkqueueExited,
}

impl Channel {
    /// Channels in merge order
    pub const ALL: [Channel; 3] = [
        Channel::InterruptFired,
        Channel::WorkqueueEntered,
        Channel::WorkqueueExited,
    ];

    /// Minor number of the channel's log node
    pub fn minor(self) -> usize {
        match self {
            Channel::InterruptFired => 0,
            Channel::WorkqueueEntered => 1,
            Channel::WorkqueueExited => 2,
        }
    }

    pub fn from_minor(minor: usize) -> Option<Self> {
        Channel::ALL.get(minor).copied()
    }

    /// Suffix appended when a record is shown to a person
    pub fn describe(self) -> &'static str {
        match self {
            Channel::InterruptFired => "at interrupt happening",
            Channel::WorkqueueEntered => "at entering workqueue",
            Channel::WorkqueueExited => "at exiting workqueue",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::InterruptFired => "interrupt",
            Channel::WorkqueueEntered => "workqueue-entry",
            Channel::WorkqueueExited => "workqueue-exit",
        };
        f.write_str(name)
    }
}

/// One decoded log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub channel: Channel,
    pub raw_line: String,
    /// Per-channel event counter, if the line carries one
    pub sequence_count: Option<u64>,
    /// Fixed-width timestamp preceding the first `]`, without the `[`
    pub timestamp_token: Option<String>,
}

impl LogRecord {
    /// Decode `line` read from `channel`. Decoding never fails; missing
    /// parts are left as `None`.
    pub fn parse(channel: Channel, line: &str) -> Self {
        let timestamp_token = line
            .split_once(']')
            .map(|(head, _)| head.trim_start().trim_start_matches('[').to_string());

        let sequence_count = line
            .split_whitespace()
            .nth(3)
            .and_then(|token| token.parse::<u64>().ok());

        Self {
            channel,
            raw_line: line.to_string(),
            sequence_count,
            timestamp_token,
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.raw_line, self.channel.describe())
    }
}

/// Read at most `max_bytes` from the log node at `path` and decode it.
///
/// Empty lines, including the fragment after a trailing newline, produce no
/// record.
///
/// # Errors
/// `NotFound` or `PermissionDenied` for the node; nothing is retried.
pub fn read_channel(channel: Channel, path: impl AsRef<Path>, max_bytes: usize) -> Result<Vec<LogRecord>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| GihError::from_io(e, path))?;

    let mut raw = Vec::new();
    file.take(max_bytes as u64)
        .read_to_end(&mut raw)
        .map_err(|e| GihError::from_io(e, path))?;
    debug!("read {} bytes from {} log {}", raw.len(), channel, path.display());

    let text = String::from_utf8_lossy(&raw);
    Ok(text
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(|line| LogRecord::parse(channel, line))
        .collect())
}

/// The three log nodes of one driver instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChannels {
    paths: [PathBuf; 3],
    max_bytes: usize,
}

impl LogChannels {
    /// `paths` are indexed by channel minor number
    pub fn new(paths: [PathBuf; 3], max_bytes: usize) -> Self {
        Self { paths, max_bytes }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.log_nodes.clone(), settings.max_log_bytes)
    }

    pub fn path(&self, channel: Channel) -> &Path {
        &self.paths[channel.minor()]
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn read(&self, channel: Channel) -> Result<Vec<LogRecord>> {
        read_channel(channel, self.path(channel), self.max_bytes)
    }

    /// Drain one channel and order its records under `order`
    pub fn read_sorted(&self, channel: Channel, order: SortKey) -> Result<Vec<LogRecord>> {
        merge_channels(self.read(channel)?, Vec::new(), Vec::new(), order)
    }

    /// Drain all three channels and merge them under `order`
    pub fn read_all(&self, order: SortKey) -> Result<Vec<LogRecord>> {
        let interrupts = self.read(Channel::InterruptFired)?;
        let entered = self.read(Channel::WorkqueueEntered)?;
        let exited = self.read(Channel::WorkqueueExited)?;
        merge_channels(interrupts, entered, exited, order)
    }
}

impl Default for LogChannels {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_driver_line() {
        let record = LogRecord::parse(
            Channel::WorkqueueExited,
            "[0000001234.567890] interrupt count: 42 | write size: 16",
        );
        assert_eq!(record.timestamp_token.as_deref(), Some("0000001234.567890"));
        assert_eq!(record.sequence_count, Some(42));
        assert_eq!(record.channel, Channel::WorkqueueExited);
        assert_eq!(
            record.to_string(),
            "[0000001234.567890] interrupt count: 42 | write size: 16 at exiting workqueue"
        );
    }

    #[test]
    fn test_parse_malformed_line() {
        let record = LogRecord::parse(Channel::InterruptFired, "garbage");
        assert_eq!(record.timestamp_token, None);
        assert_eq!(record.sequence_count, None);
        assert_eq!(record.raw_line, "garbage");
    }

    #[test]
    fn test_read_channel_drops_trailing_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("gihlog0");
        std::fs::write(&node, "abc\ndef\n").unwrap();

        let records = read_channel(Channel::InterruptFired, &node, DEFAULT_MAX_LOG_BYTES).unwrap();
        let lines: Vec<_> = records.iter().map(|r| r.raw_line.as_str()).collect();
        assert_eq!(lines, ["abc", "def"]);
        assert!(records.iter().all(|r| r.channel == Channel::InterruptFired));
    }

    #[test]
    fn test_read_channel_respects_cap() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("gihlog1");
        std::fs::write(&node, "first\nsecond\n").unwrap();

        let records = read_channel(Channel::WorkqueueEntered, &node, 8).unwrap();
        let lines: Vec<_> = records.iter().map(|r| r.raw_line.as_str()).collect();
        assert_eq!(lines, ["first", "se"]);
    }

    #[test]
    fn test_read_channel_missing_node() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_channel(Channel::WorkqueueExited, dir.path().join("gihlog2"), 64);
        assert!(matches!(result, Err(GihError::NotFound { .. })));
    }

    #[test]
    fn test_read_sorted_single_channel() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ["gihlog0", "gihlog1", "gihlog2"].map(|name| dir.path().join(name));
        std::fs::write(
            &paths[1],
            "[0000000003.000000] interrupt count: 2 | write size: 0\n\
             [0000000001.000000] interrupt count: 0 | write size: 0\n\
             [0000000002.000000] interrupt count: 1 | write size: 0\n",
        )
        .unwrap();
        let logs = LogChannels::new(paths, DEFAULT_MAX_LOG_BYTES);

        let sorted = logs.read_sorted(Channel::WorkqueueEntered, SortKey::ByTimestamp).unwrap();
        let counts: Vec<_> = sorted.iter().map(|r| r.sequence_count).collect();
        assert_eq!(counts, [Some(0), Some(1), Some(2)]);
        assert!(sorted.iter().all(|r| r.channel == Channel::WorkqueueEntered));

        let unsorted = logs.read_sorted(Channel::WorkqueueEntered, SortKey::ByChannel).unwrap();
        assert_eq!(unsorted[0].sequence_count, Some(2));
    }

    #[test]
    fn test_channel_minors() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_minor(channel.minor()), Some(channel));
        }
        assert_eq!(Channel::from_minor(3), None);
    }
}
