//! Deliberate skips: items that look like they are still being written, or
//! that an asset's own predicate rejects.

use std::fmt;
use std::time::Duration;

use assetflow_types::item::SourceItem;
use chrono::{DateTime, Utc};

/// Why an item was left alone. A skip is not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    SizeChanged { listed: u64, current: u64 },
    MtimeChanged { listed: i64, current: i64 },
    /// Modified within the grace window.
    RecentlyModified { age_secs: i64, grace_secs: u64 },
    /// The asset's own pattern or predicate rejected the item.
    Filtered,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeChanged { listed, current } => {
                write!(f, "size changed since listing ({listed} -> {current} bytes)")
            }
            Self::MtimeChanged { listed, current } => {
                write!(f, "modified since listing ({listed} -> {current})")
            }
            Self::RecentlyModified { age_secs, grace_secs } => {
                write!(f, "modified {age_secs}s ago, within the {grace_secs}s grace window")
            }
            Self::Filtered => f.write_str("rejected by the asset filter"),
        }
    }
}

/// Compare the listed metadata with a fresh stat taken just before the
/// transfer. Returns the reason to skip, if any.
#[must_use]
pub fn check_is_modifying(
    listed: &SourceItem,
    current: &SourceItem,
    now: DateTime<Utc>,
    grace: Duration,
) -> Option<SkipReason> {
    if listed.size() != current.size() {
        return Some(SkipReason::SizeChanged {
            listed: listed.size(),
            current: current.size(),
        });
    }
    if listed.modified_ts() != current.modified_ts() {
        return Some(SkipReason::MtimeChanged {
            listed: listed.modified_ts(),
            current: current.modified_ts(),
        });
    }
    let age_secs = now.timestamp() - current.modified_ts();
    let grace_secs = grace.as_secs();
    if age_secs < i64::try_from(grace_secs).unwrap_or(i64::MAX) {
        return Some(SkipReason::RecentlyModified { age_secs, grace_secs });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetflow_types::item::FileMeta;
    use chrono::TimeZone;

    fn file(size: u64, mtime: i64) -> SourceItem {
        FileMeta::new("a.csv", "/in/a.csv", size, mtime).into()
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(10_000, 0).unwrap()
    }

    const GRACE: Duration = Duration::from_secs(60);

    #[test]
    fn settled_item_passes() {
        assert_eq!(check_is_modifying(&file(10, 9_000), &file(10, 9_000), now(), GRACE), None);
    }

    #[test]
    fn growing_file_is_skipped() {
        let reason = check_is_modifying(&file(10, 9_000), &file(20, 9_000), now(), GRACE).unwrap();
        assert_eq!(reason, SkipReason::SizeChanged { listed: 10, current: 20 });
    }

    #[test]
    fn touched_file_is_skipped() {
        let reason = check_is_modifying(&file(10, 9_000), &file(10, 9_001), now(), GRACE).unwrap();
        assert!(matches!(reason, SkipReason::MtimeChanged { .. }));
    }

    #[test]
    fn fresh_file_within_grace_is_skipped() {
        let reason = check_is_modifying(&file(10, 9_990), &file(10, 9_990), now(), GRACE).unwrap();
        assert_eq!(
            reason,
            SkipReason::RecentlyModified {
                age_secs: 10,
                grace_secs: 60
            }
        );
        assert!(reason.to_string().contains("grace"));
    }

    #[test]
    fn zero_grace_only_checks_changes() {
        assert_eq!(
            check_is_modifying(&file(10, 10_000), &file(10, 10_000), now(), Duration::ZERO),
            None
        );
    }
}
