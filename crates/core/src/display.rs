//! Timestamp rendering for operator-facing lists and exports.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Timelike, Utc};

/// Buddhist Era offset from the Gregorian year.
pub const BUDDHIST_ERA_OFFSET: i32 = 543;
/// Default display offset: UTC+07:00, in minutes.
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 7 * 60;

/// How timestamps are shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampStyle {
    offset: FixedOffset,
    buddhist_era: bool,
}

impl Default for TimestampStyle {
    fn default() -> Self {
        Self::new(DEFAULT_UTC_OFFSET_MINUTES, true).unwrap_or_else(Self::utc)
    }
}

impl TimestampStyle {
    /// `None` when the offset is outside ±24h.
    pub fn new(offset_minutes: i32, buddhist_era: bool) -> Option<Self> {
        let offset = FixedOffset::east_opt(offset_minutes.checked_mul(60)?)?;
        Some(Self {
            offset,
            buddhist_era,
        })
    }

    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
            buddhist_era: false,
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn buddhist_era(&self) -> bool {
        self.buddhist_era
    }

    /// `dd/mm/yyyy, HH:MM:SS`
    pub fn format(&self, at: DateTime<Utc>) -> String {
        let local = at.with_timezone(&self.offset);
        format!(
            "{:02}/{:02}/{}, {:02}:{:02}:{:02}",
            local.day(),
            local.month(),
            self.year(local.year()),
            local.hour(),
            local.minute(),
            local.second()
        )
    }

    /// `dd/mm/yyyy HH:MM`, used by dashboard lists.
    pub fn format_short(&self, at: DateTime<Utc>) -> String {
        let local = at.with_timezone(&self.offset);
        format!(
            "{:02}/{:02}/{} {:02}:{:02}",
            local.day(),
            local.month(),
            self.year(local.year()),
            local.hour(),
            local.minute()
        )
    }

    /// Calendar date of `at` in the display offset.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    fn year(&self, gregorian: i32) -> i32 {
        if self.buddhist_era {
            gregorian + BUDDHIST_ERA_OFFSET
        } else {
            gregorian
        }
    }
}
