//! Outcome of one asset execution.

use std::time::Duration;

use assetflow_types::state::{RunStats, RunStatus};

use crate::errors::TransferItemError;
use crate::transfer::SkipReason;

/// An item deliberately left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    pub item: String,
    pub reason: SkipReason,
}

/// Result of a transfer run, in either execution mode.
#[derive(Debug, Clone, Default)]
pub struct TransferResult {
    pub asset: String,
    /// Identities of the items written to the target.
    pub succeeded: Vec<String>,
    pub failed: Vec<TransferItemError>,
    pub skipped: Vec<SkippedItem>,
    pub bytes: u64,
    pub duration: Duration,
    /// The run stopped early; items not started are in none of the lists.
    pub cancelled: bool,
}

impl TransferResult {
    #[must_use]
    pub fn new(asset: impl Into<String>) -> Self {
        Self {
            asset: asset.into(),
            ..Self::default()
        }
    }

    /// Terminal status: any failure next to a success is `Partial`.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        if self.cancelled {
            RunStatus::Cancelled
        } else if self.failed.is_empty() {
            RunStatus::Succeeded
        } else if self.succeeded.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }

    /// Identities of the failed items.
    #[must_use]
    pub fn failed_items(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.item.as_str()).collect()
    }

    /// Bytes per second over the whole run.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }

    /// Counts for run history. The error message names the first failure
    /// and how many followed it.
    #[must_use]
    pub fn to_run_stats(&self) -> RunStats {
        let error_message = self.failed.first().map(|first| match self.failed.len() {
            1 => first.to_string(),
            n => format!("{first} (and {} more)", n - 1),
        });
        RunStats {
            items_succeeded: self.succeeded.len() as u64,
            items_failed: self.failed.len() as u64,
            items_skipped: self.skipped.len() as u64,
            bytes_moved: self.bytes,
            error_message,
        }
    }
}

/// Human-readable byte count (`1.50 MB`).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.2} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetflow_types::error::ConnectorError;

    fn failure(item: &str) -> TransferItemError {
        TransferItemError::new(item, ConnectorError::data("TRUNCATED", "short read"))
    }

    #[test]
    fn status_reflects_outcomes() {
        let mut result = TransferResult::new("a");
        assert_eq!(result.status(), RunStatus::Succeeded);

        result.failed.push(failure("/in/x"));
        assert_eq!(result.status(), RunStatus::Failed);

        result.succeeded.push("/in/y".into());
        assert_eq!(result.status(), RunStatus::Partial);

        result.cancelled = true;
        assert_eq!(result.status(), RunStatus::Cancelled);
    }

    #[test]
    fn skips_alone_are_success() {
        let mut result = TransferResult::new("a");
        result.skipped.push(SkippedItem {
            item: "/in/x".into(),
            reason: SkipReason::Filtered,
        });
        assert_eq!(result.status(), RunStatus::Succeeded);
        assert_eq!(result.to_run_stats().items_skipped, 1);
    }

    #[test]
    fn run_stats_summarise_failures() {
        let mut result = TransferResult::new("a");
        result.succeeded.push("/in/ok".into());
        result.failed.push(failure("/in/x"));
        result.failed.push(failure("/in/y"));
        result.bytes = 42;
        let stats = result.to_run_stats();
        assert_eq!(stats.items_succeeded, 1);
        assert_eq!(stats.items_failed, 2);
        assert_eq!(stats.bytes_moved, 42);
        let message = stats.error_message.unwrap();
        assert!(message.contains("/in/x"));
        assert!(message.contains("and 1 more"));
        assert_eq!(result.failed_items(), vec!["/in/x", "/in/y"]);
    }

    #[test]
    fn throughput_and_sizes() {
        let result = TransferResult {
            bytes: 2048,
            duration: Duration::from_secs(2),
            ..TransferResult::new("a")
        };
        assert!((result.throughput() - 1024.0).abs() < f64::EPSILON);
        assert_eq!(TransferResult::new("a").throughput(), 0.0);

        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(3 * 1_048_576), "3.00 MB");
        assert_eq!(format_size(1_073_741_824), "1.00 GB");
    }
}
