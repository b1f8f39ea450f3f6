//! Partition definitions and their frozen time windows.

use assetflow_types::state::PartitionKey;
use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use cron::Schedule;

use crate::config::types::PartitionsConfig;
use crate::context::PartitionWindow;
use crate::template::helpers::{parse_cron, parse_instant_str};

const HOURLY_FMT: &str = "%Y-%m-%d-%H:%M";
const DAILY_FMT: &str = "%Y-%m-%d";

#[derive(Debug, Clone)]
enum Cadence {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Cron(Box<Schedule>),
}

/// Time-window partitions: consecutive windows from `start`.
#[derive(Debug, Clone)]
pub struct TimeWindows {
    cadence: Cadence,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    fmt: String,
}

/// Compiled partitioning of an asset.
#[derive(Debug, Clone)]
pub enum PartitionsDef {
    Time(TimeWindows),
    Static(Vec<PartitionKey>),
}

impl PartitionsDef {
    /// Compile a partitions block.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem for unparseable dates or cron
    /// expressions, or an empty static list.
    pub fn from_config(config: &PartitionsConfig) -> Result<Self, String> {
        let (cadence, start_date, end_date, fmt, default_fmt) = match config {
            PartitionsConfig::Static { values } => {
                if values.is_empty() {
                    return Err("static partitions need at least one value".to_string());
                }
                return Ok(Self::Static(values.iter().map(PartitionKey::new).collect()));
            }
            PartitionsConfig::Hourly { start_date, end_date, fmt } => {
                (Cadence::Hourly, start_date, end_date, fmt, HOURLY_FMT)
            }
            PartitionsConfig::Daily { start_date, end_date, fmt } => {
                (Cadence::Daily, start_date, end_date, fmt, DAILY_FMT)
            }
            PartitionsConfig::Weekly { start_date, end_date, fmt } => {
                (Cadence::Weekly, start_date, end_date, fmt, DAILY_FMT)
            }
            PartitionsConfig::Monthly { start_date, end_date, fmt } => {
                (Cadence::Monthly, start_date, end_date, fmt, DAILY_FMT)
            }
            PartitionsConfig::Cron {
                cron_schedule,
                start_date,
                end_date,
                fmt,
            } => (
                Cadence::Cron(Box::new(parse_cron(cron_schedule)?)),
                start_date,
                end_date,
                fmt,
                HOURLY_FMT,
            ),
        };

        let start = parse_instant_str(start_date)
            .ok_or_else(|| format!("invalid start_date '{start_date}'"))?;
        let end = end_date
            .as_deref()
            .map(|raw| parse_instant_str(raw).ok_or_else(|| format!("invalid end_date '{raw}'")))
            .transpose()?;
        if let Some(end) = end {
            if end <= start {
                return Err(format!(
                    "end_date '{}' is not after start_date",
                    end_date.as_deref().unwrap_or_default()
                ));
            }
        }

        let windows = TimeWindows {
            cadence,
            start,
            end,
            fmt: fmt.clone().unwrap_or_else(|| default_fmt.to_string()),
        };
        if windows.first_start().is_none() {
            return Err("partition schedule never fires after start_date".to_string());
        }
        Ok(Self::Time(windows))
    }

    /// The frozen `(key, start, end)` triple for `key`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when `key` is not a partition
    /// of this definition.
    pub fn window_for_key(&self, key: &PartitionKey) -> Result<PartitionWindow, String> {
        match self {
            Self::Static(values) => {
                if values.contains(key) {
                    Ok(PartitionWindow::key_only(key.clone()))
                } else {
                    Err(format!("unknown partition key '{key}'"))
                }
            }
            Self::Time(windows) => windows.window_for_key(key),
        }
    }

    /// The window that most recently closed at or before `now`.
    #[must_use]
    pub fn last_complete_window(&self, now: DateTime<Utc>) -> Option<PartitionWindow> {
        match self {
            Self::Static(_) => None,
            Self::Time(windows) => windows.last_complete_window(now),
        }
    }

    #[must_use]
    pub fn is_time_based(&self) -> bool {
        matches!(self, Self::Time(_))
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map_or(DateTime::<Utc>::MIN_UTC, |n| n.and_utc())
}

fn is_midnight(t: DateTime<Utc>) -> bool {
    t.num_seconds_from_midnight() == 0 && t.nanosecond() == 0
}

impl TimeWindows {
    /// First window start at or after `start`.
    fn first_start(&self) -> Option<DateTime<Utc>> {
        let s = self.start;
        match &self.cadence {
            Cadence::Hourly => {
                let floor = Utc
                    .with_ymd_and_hms(s.year(), s.month(), s.day(), s.hour(), 0, 0)
                    .single()?;
                Some(if floor == s { s } else { floor + Duration::hours(1) })
            }
            Cadence::Daily => {
                let floor = midnight(s.date_naive());
                Some(if floor == s { s } else { floor + Duration::days(1) })
            }
            Cadence::Weekly => Some(s),
            Cadence::Monthly => {
                let floor = midnight(s.date_naive().with_day(1)?);
                if floor == s {
                    Some(s)
                } else {
                    floor.checked_add_months(Months::new(1))
                }
            }
            Cadence::Cron(schedule) => schedule.after(&(s - Duration::seconds(1))).next(),
        }
    }

    fn next_start(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.cadence {
            Cadence::Hourly => t.checked_add_signed(Duration::hours(1)),
            Cadence::Daily => t.checked_add_signed(Duration::days(1)),
            Cadence::Weekly => t.checked_add_signed(Duration::weeks(1)),
            Cadence::Monthly => t.checked_add_months(Months::new(1)),
            Cadence::Cron(schedule) => schedule.after(&t).next(),
        }
    }

    fn prev_start(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.cadence {
            Cadence::Hourly => t.checked_sub_signed(Duration::hours(1)),
            Cadence::Daily => t.checked_sub_signed(Duration::days(1)),
            Cadence::Weekly => t.checked_sub_signed(Duration::weeks(1)),
            Cadence::Monthly => t.checked_sub_months(Months::new(1)),
            Cadence::Cron(schedule) => schedule.after(&t).next_back(),
        }
    }

    fn is_boundary(&self, t: DateTime<Utc>, first: DateTime<Utc>) -> bool {
        match &self.cadence {
            Cadence::Hourly => t.minute() == 0 && t.second() == 0 && t.nanosecond() == 0,
            Cadence::Daily => is_midnight(t),
            Cadence::Weekly => (t - first).num_seconds() % Duration::weeks(1).num_seconds() == 0,
            Cadence::Monthly => is_midnight(t) && t.day() == 1,
            Cadence::Cron(schedule) => {
                schedule.after(&(t - Duration::seconds(1))).next() == Some(t)
            }
        }
    }

    /// Largest window boundary at or before `now`.
    fn boundary_at_or_before(
        &self,
        now: DateTime<Utc>,
        first: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if now < first {
            return None;
        }
        match &self.cadence {
            Cadence::Hourly => Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), 0, 0)
                .single(),
            Cadence::Daily => Some(midnight(now.date_naive())),
            Cadence::Weekly => {
                let week = Duration::weeks(1).num_seconds();
                let elapsed = (now - first).num_seconds();
                Some(first + Duration::seconds(elapsed - elapsed % week))
            }
            Cadence::Monthly => Some(midnight(now.date_naive().with_day(1)?)),
            Cadence::Cron(schedule) => schedule.after(&(now + Duration::seconds(1))).next_back(),
        }
    }

    fn parse_key(&self, key: &str) -> Option<DateTime<Utc>> {
        if let Ok(naive) = NaiveDateTime::parse_from_str(key, &self.fmt) {
            return Some(naive.and_utc());
        }
        NaiveDate::parse_from_str(key, &self.fmt).ok().map(midnight)
    }

    fn key_for(&self, start: DateTime<Utc>) -> PartitionKey {
        PartitionKey::new(start.format(&self.fmt).to_string())
    }

    fn window_for_key(&self, key: &PartitionKey) -> Result<PartitionWindow, String> {
        let invalid = || format!("'{key}' is not a partition key (expected format '{}')", self.fmt);
        let start = self.parse_key(key.as_str()).ok_or_else(invalid)?;
        let first = self.first_start().ok_or_else(invalid)?;
        if start < first || !self.is_boundary(start, first) {
            return Err(invalid());
        }
        let end = self.next_start(start).ok_or_else(invalid)?;
        if self.end.is_some_and(|limit| end > limit) {
            return Err(format!("partition '{key}' is after end_date"));
        }
        Ok(PartitionWindow {
            key: key.clone(),
            start: Some(start),
            end: Some(end),
        })
    }

    fn last_complete_window(&self, now: DateTime<Utc>) -> Option<PartitionWindow> {
        let first = self.first_start()?;
        let horizon = self.end.map_or(now, |limit| limit.min(now));
        let end = self.boundary_at_or_before(horizon, first)?;
        let start = self.prev_start(end)?;
        if start < first {
            return None;
        }
        Some(PartitionWindow {
            key: self.key_for(start),
            start: Some(start),
            end: Some(end),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn daily() -> PartitionsDef {
        PartitionsDef::from_config(&PartitionsConfig::Daily {
            start_date: "2024-01-01".into(),
            end_date: None,
            fmt: None,
        })
        .unwrap()
    }

    #[test]
    fn daily_window_for_key() {
        let window = daily().window_for_key(&PartitionKey::new("2024-01-14")).unwrap();
        assert_eq!(window.start, Some(at(2024, 1, 14, 0)));
        assert_eq!(window.end, Some(at(2024, 1, 15, 0)));
    }

    #[test]
    fn keys_before_start_or_malformed_are_rejected() {
        assert!(daily().window_for_key(&PartitionKey::new("2023-12-31")).is_err());
        assert!(daily().window_for_key(&PartitionKey::new("yesterday")).is_err());
    }

    #[test]
    fn daily_last_complete_window() {
        let window = daily().last_complete_window(at(2024, 1, 15, 6)).unwrap();
        assert_eq!(window.key, PartitionKey::new("2024-01-14"));
        assert!(daily().last_complete_window(at(2024, 1, 1, 6)).is_none());
    }

    #[test]
    fn hourly_uses_minute_format() {
        let def = PartitionsDef::from_config(&PartitionsConfig::Hourly {
            start_date: "2024-01-01".into(),
            end_date: None,
            fmt: None,
        })
        .unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 5, 30, 0).unwrap();
        let window = def.last_complete_window(now).unwrap();
        assert_eq!(window.key, PartitionKey::new("2024-01-02-04:00"));
        let again = def.window_for_key(&window.key).unwrap();
        assert_eq!(again, window);
    }

    #[test]
    fn monthly_windows_follow_calendar() {
        let def = PartitionsDef::from_config(&PartitionsConfig::Monthly {
            start_date: "2024-01-01".into(),
            end_date: None,
            fmt: None,
        })
        .unwrap();
        let window = def.window_for_key(&PartitionKey::new("2024-02-01")).unwrap();
        assert_eq!(window.end, Some(at(2024, 3, 1, 0)));
        assert!(def.window_for_key(&PartitionKey::new("2024-02-02")).is_err());
    }

    #[test]
    fn weekly_windows_anchor_on_start() {
        let def = PartitionsDef::from_config(&PartitionsConfig::Weekly {
            start_date: "2024-01-03".into(),
            end_date: None,
            fmt: None,
        })
        .unwrap();
        assert!(def.window_for_key(&PartitionKey::new("2024-01-10")).is_ok());
        assert!(def.window_for_key(&PartitionKey::new("2024-01-11")).is_err());
        let window = def.last_complete_window(at(2024, 1, 20, 0)).unwrap();
        assert_eq!(window.key, PartitionKey::new("2024-01-10"));
    }

    #[test]
    fn cron_partitions() {
        let def = PartitionsDef::from_config(&PartitionsConfig::Cron {
            cron_schedule: "0 6 * * *".into(),
            start_date: "2024-01-01".into(),
            end_date: None,
            fmt: None,
        })
        .unwrap();
        let window = def.last_complete_window(at(2024, 1, 3, 7)).unwrap();
        assert_eq!(window.start, Some(at(2024, 1, 2, 6)));
        assert_eq!(window.end, Some(at(2024, 1, 3, 6)));
        assert_eq!(def.window_for_key(&window.key).unwrap(), window);
    }

    #[test]
    fn end_date_bounds_windows() {
        let def = PartitionsDef::from_config(&PartitionsConfig::Daily {
            start_date: "2024-01-01".into(),
            end_date: Some("2024-01-05".into()),
            fmt: None,
        })
        .unwrap();
        assert!(def.window_for_key(&PartitionKey::new("2024-01-05")).is_err());
        let window = def.last_complete_window(at(2024, 6, 1, 0)).unwrap();
        assert_eq!(window.key, PartitionKey::new("2024-01-04"));
    }

    #[test]
    fn static_partitions_have_no_bounds() {
        let def = PartitionsDef::from_config(&PartitionsConfig::Static {
            values: vec!["emea".into(), "apac".into()],
        })
        .unwrap();
        let window = def.window_for_key(&PartitionKey::new("apac")).unwrap();
        assert_eq!(window, PartitionWindow::key_only(PartitionKey::new("apac")));
        assert!(def.window_for_key(&PartitionKey::new("latam")).is_err());
        assert!(def.last_complete_window(Utc::now()).is_none());
        assert!(!def.is_time_based());
    }

    #[test]
    fn invalid_definitions() {
        assert!(PartitionsDef::from_config(&PartitionsConfig::Static { values: vec![] }).is_err());
        assert!(PartitionsDef::from_config(&PartitionsConfig::Daily {
            start_date: "soon".into(),
            end_date: None,
            fmt: None,
        })
        .is_err());
        assert!(PartitionsDef::from_config(&PartitionsConfig::Cron {
            cron_schedule: "every day".into(),
            start_date: "2024-01-01".into(),
            end_date: None,
            fmt: None,
        })
        .is_err());
    }
}
