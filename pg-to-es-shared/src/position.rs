//! Resume positions into the source change stream.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A totally ordered point in the source's change stream.
///
/// A fresh pipeline that backfills first reads every configured table as of a
/// change-log `watermark`, then streams change-log entries after it. The two
/// phases share one ordering so a single checkpoint can describe either:
///
/// ```text
/// Backfill{w, 0, None} < Backfill{w, 0, "a"} < Backfill{w, 1, None} < Stream{w} < Stream{w + 1}
/// ```
///
/// `Stream { sequence: w }` therefore reads as "backfill finished, nothing
/// after `w` applied yet".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ResumePosition {
    /// Inside the initial snapshot taken at change-log position `watermark`.
    Backfill {
        /// Change-log head captured before the first table was read.
        watermark: u64,
        /// Index of the table being copied, in configuration order.
        table: usize,
        /// Last key emitted for `table`, `None` if nothing emitted yet.
        last_key: Option<String>,
    },
    /// Everything up to and including change-log entry `sequence` was read.
    Stream {
        /// Change-log sequence number.
        sequence: u64,
    },
}

impl ResumePosition {
    /// Position of a streamed change-log entry.
    pub fn stream(sequence: u64) -> Self {
        Self::Stream { sequence }
    }

    /// Position inside the snapshot of table number `table`.
    pub fn backfill(watermark: u64, table: usize, last_key: Option<String>) -> Self {
        Self::Backfill {
            watermark,
            table,
            last_key,
        }
    }

    /// The change-log sequence this position is anchored to.
    pub fn sequence(&self) -> u64 {
        match self {
            Self::Backfill { watermark, .. } => *watermark,
            Self::Stream { sequence } => *sequence,
        }
    }

    /// Whether the position lies inside the initial snapshot.
    pub fn is_backfill(&self) -> bool {
        matches!(self, Self::Backfill { .. })
    }

    /// Distance between the source head and this position, in change-log entries.
    pub fn lag_behind(&self, head: u64) -> u64 {
        head.saturating_sub(self.sequence())
    }

    fn sort_key(&self) -> (u64, u8, usize, Option<&str>) {
        match self {
            Self::Backfill {
                watermark,
                table,
                last_key,
            } => (*watermark, 0, *table, last_key.as_deref()),
            Self::Stream { sequence } => (*sequence, 1, 0, None),
        }
    }
}

impl Ord for ResumePosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for ResumePosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResumePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backfill {
                watermark,
                table,
                last_key,
            } => write!(
                f,
                "backfill@{}:{}:{}",
                watermark,
                table,
                last_key.as_deref().unwrap_or("-")
            ),
            Self::Stream { sequence } => write!(f, "{}", sequence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backfill_orders_before_stream_at_watermark() {
        let start = ResumePosition::backfill(10, 0, None);
        let mid = ResumePosition::backfill(10, 0, Some("a".to_string()));
        let next_table = ResumePosition::backfill(10, 1, None);
        let done = ResumePosition::stream(10);
        let later = ResumePosition::stream(11);

        assert!(start < mid);
        assert!(mid < next_table);
        assert!(next_table < done);
        assert!(done < later);
    }

    #[test]
    fn test_stream_before_later_watermark() {
        // A backfill at a later watermark still comes after older stream entries.
        assert!(ResumePosition::stream(5) < ResumePosition::backfill(6, 0, None));
    }

    #[test]
    fn test_lag() {
        assert_eq!(ResumePosition::stream(90).lag_behind(100), 10);
        assert_eq!(ResumePosition::stream(100).lag_behind(90), 0);
        assert_eq!(ResumePosition::backfill(40, 2, None).lag_behind(50), 10);
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_value(ResumePosition::stream(42)).unwrap();
        assert_eq!(json, serde_json::json!({"phase": "stream", "sequence": 42}));

        let back: ResumePosition = serde_json::from_value(serde_json::json!({
            "phase": "backfill",
            "watermark": 7,
            "table": 1,
            "last_key": "abc"
        }))
        .unwrap();
        assert_eq!(back, ResumePosition::backfill(7, 1, Some("abc".to_string())));
    }

    #[test]
    fn test_display() {
        assert_eq!(ResumePosition::stream(3).to_string(), "3");
        assert_eq!(
            ResumePosition::backfill(3, 0, None).to_string(),
            "backfill@3:0:-"
        );
    }
}
