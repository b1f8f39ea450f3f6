//! Transfer engine: moves items from a source connection to a target under
//! a shared concurrency budget, with progress milestones and partial-failure
//! accounting.

mod engine;
mod guard;
mod pools;
mod progress;
mod stream;
mod target;

use std::time::Duration;

pub use engine::{TransferEngine, TransferMode, TransferPlan};
pub use guard::{check_is_modifying, SkipReason};
pub use pools::ConcurrencyPools;
pub use progress::{ProgressBasis, ProgressObserver, ProgressTracker, TransferProgress};
pub use target::resolve_location;

const DEFAULT_STREAM_THRESHOLD: u64 = 8 * 1024 * 1024;
const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
const DEFAULT_PROGRESS_STEP: u8 = 10;
const DEFAULT_MODIFYING_GRACE: Duration = Duration::from_secs(60);

/// Byte-level tuning for item transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    /// Items larger than this are copied chunk by chunk instead of being
    /// read into memory whole.
    pub stream_threshold: u64,
    pub chunk_size: usize,
    /// Progress is logged every time this share of the work completes.
    pub progress_step_percent: u8,
    /// Items modified more recently than this are considered in flight.
    pub modifying_grace: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            stream_threshold: DEFAULT_STREAM_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_step_percent: DEFAULT_PROGRESS_STEP,
            modifying_grace: DEFAULT_MODIFYING_GRACE,
        }
    }
}
