//! Dashboard aggregates over the confirmed count set.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::count::CountEvent;
use crate::display::TimestampStyle;
use crate::id::OperatorId;

pub const DEFAULT_LEADERBOARD_SIZE: usize = 5;
pub const DEFAULT_RECENT_SIZE: usize = 10;

/// Per-operator scan count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorTally {
    pub operator: OperatorId,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub total_stock: usize,
    pub total_scanned: usize,
    pub remaining: usize,
    /// Rounded to the nearest whole percent; 0 when there is no stock.
    pub progress_percent: u32,
    pub scans_today: usize,
    pub active_operators: usize,
    /// Sorted by count desc, then operator id asc.
    pub leaderboard: Vec<OperatorTally>,
    /// Newest first.
    pub recent: Vec<CountEvent>,
}

impl DashboardSummary {
    pub fn compute<'a>(
        total_stock: usize,
        events: impl IntoIterator<Item = &'a CountEvent>,
        style: &TimestampStyle,
        now: DateTime<Utc>,
    ) -> Self {
        Self::compute_with(
            total_stock,
            events,
            style,
            now,
            DEFAULT_LEADERBOARD_SIZE,
            DEFAULT_RECENT_SIZE,
        )
    }

    pub fn compute_with<'a>(
        total_stock: usize,
        events: impl IntoIterator<Item = &'a CountEvent>,
        style: &TimestampStyle,
        now: DateTime<Utc>,
        leaderboard_size: usize,
        recent_size: usize,
    ) -> Self {
        let events: Vec<&CountEvent> = events.into_iter().collect();
        let today = style.local_date(now);

        let mut per_operator: HashMap<&OperatorId, usize> = HashMap::new();
        for event in &events {
            *per_operator.entry(&event.operator).or_default() += 1;
        }
        let active_operators = per_operator.len();

        let mut leaderboard: Vec<OperatorTally> = per_operator
            .into_iter()
            .map(|(operator, count)| OperatorTally {
                operator: operator.clone(),
                count,
            })
            .collect();
        leaderboard.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.operator.cmp(&b.operator)));
        leaderboard.truncate(leaderboard_size);

        let scans_today = events
            .iter()
            .filter(|e| style.local_date(e.created_at) == today)
            .count();

        let mut recent: Vec<CountEvent> = events.iter().map(|e| (*e).clone()).collect();
        recent.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.correlation_id.cmp(&a.correlation_id))
        });
        recent.truncate(recent_size);

        let total_scanned = events.len();
        Self {
            total_stock,
            total_scanned,
            remaining: total_stock.saturating_sub(total_scanned),
            progress_percent: progress_percent(total_scanned, total_stock),
            scans_today,
            active_operators,
            leaderboard,
            recent,
        }
    }
}

fn progress_percent(scanned: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((scanned as f64 / total as f64) * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Serial;
    use chrono::{Duration, TimeZone};

    fn event(serial: &str, operator: &str, at: DateTime<Utc>) -> CountEvent {
        CountEvent::pending(
            Serial::parse(serial).unwrap(),
            "Item",
            OperatorId::parse(operator).unwrap(),
            at,
        )
        .confirm()
    }

    #[test]
    fn summary_counts_progress_and_leaderboard() {
        // 10:00 local on 1 May (UTC+7)
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
        let yesterday = now - Duration::days(1);
        let events = vec![
            event("a", "E2", now - Duration::minutes(3)),
            event("b", "E1", now - Duration::minutes(2)),
            event("c", "E2", now - Duration::minutes(1)),
            event("d", "E3", yesterday),
        ];

        let summary = DashboardSummary::compute_with(
            7,
            &events,
            &TimestampStyle::default(),
            now,
            2,
            2,
        );

        assert_eq!(summary.total_scanned, 4);
        assert_eq!(summary.remaining, 3);
        assert_eq!(summary.progress_percent, 57);
        assert_eq!(summary.scans_today, 3);
        assert_eq!(summary.active_operators, 3);
        let board: Vec<(&str, usize)> = summary
            .leaderboard
            .iter()
            .map(|t| (t.operator.as_str(), t.count))
            .collect();
        assert_eq!(board, vec![("E2", 2), ("E1", 1)]);
        let recent: Vec<&str> = summary.recent.iter().map(|e| e.serial.as_str()).collect();
        assert_eq!(recent, vec!["c", "b"]);
    }

    #[test]
    fn empty_stock_reports_zero_progress() {
        let summary = DashboardSummary::compute(0, std::iter::empty(), &TimestampStyle::utc(), Utc::now());
        assert_eq!(summary.progress_percent, 0);
        assert_eq!(summary.remaining, 0);
        assert!(summary.leaderboard.is_empty());
    }
}
