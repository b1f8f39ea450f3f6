//! Progress milestones for one asset execution.
//!
//! Milestones are observability events only: they are logged, optionally
//! forwarded to an observer, and never influence control flow.

use std::sync::Arc;

/// What the percentage is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressBasis {
    /// Number of items expected in discovery-and-stream mode.
    Items(u64),
    /// Bytes expected for a single item.
    Bytes(u64),
}

/// Snapshot emitted at each milestone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub asset: String,
    pub percent: u8,
    pub items_done: u64,
    pub items_total: u64,
    pub bytes: u64,
}

/// Receives milestones in addition to the log event.
pub trait ProgressObserver: Send + Sync {
    fn on_milestone(&self, progress: &TransferProgress);
}

/// Counts finished items and moved bytes, emitting an event every
/// `step_percent` of the basis.
pub struct ProgressTracker {
    asset: String,
    basis: ProgressBasis,
    step: u8,
    /// Highest milestone already emitted.
    reported: u8,
    items_done: u64,
    items_total: u64,
    bytes: u64,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("asset", &self.asset)
            .field("basis", &self.basis)
            .field("reported", &self.reported)
            .field("items_done", &self.items_done)
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    #[must_use]
    pub fn new(
        asset: impl Into<String>,
        basis: ProgressBasis,
        items_total: u64,
        step_percent: u8,
    ) -> Self {
        Self {
            asset: asset.into(),
            basis,
            step: step_percent.clamp(1, 100),
            reported: 0,
            items_done: 0,
            items_total,
            bytes: 0,
            observer: None,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Option<Arc<dyn ProgressObserver>>) -> Self {
        self.observer = observer;
        self
    }

    /// Bytes moved so far.
    pub fn record_bytes(&mut self, bytes: u64) -> Option<TransferProgress> {
        self.bytes += bytes;
        self.check()
    }

    /// One item finished (moved, skipped or failed).
    pub fn record_item(&mut self) -> Option<TransferProgress> {
        self.items_done += 1;
        self.check()
    }

    #[must_use]
    pub fn percent(&self) -> u8 {
        let (done, total) = match self.basis {
            ProgressBasis::Items(total) => (self.items_done, total),
            ProgressBasis::Bytes(total) => (self.bytes, total),
        };
        if total == 0 {
            return 100;
        }
        let pct = done.saturating_mul(100) / total;
        u8::try_from(pct.min(100)).unwrap_or(100)
    }

    fn check(&mut self) -> Option<TransferProgress> {
        let milestone = self.percent() / self.step * self.step;
        if milestone == 0 || milestone <= self.reported {
            return None;
        }
        self.reported = milestone;
        let progress = TransferProgress {
            asset: self.asset.clone(),
            percent: milestone,
            items_done: self.items_done,
            items_total: self.items_total,
            bytes: self.bytes,
        };
        tracing::info!(
            asset = %progress.asset,
            percent = progress.percent,
            items_done = progress.items_done,
            items_total = progress.items_total,
            bytes = progress.bytes,
            "Transfer progress"
        );
        if let Some(observer) = &self.observer {
            observer.on_milestone(&progress);
        }
        Some(progress)
    }
}
