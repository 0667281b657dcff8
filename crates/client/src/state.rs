//! In-memory counting state shared by the scan path, the sync engine and
//! the change listener.
//!
//! All mutation goes through [`CountState`]; the lock is a plain
//! `std::sync::RwLock` because no critical section awaits.
//!
//! Backend listings are fetched outside the lock, so a listing can be older
//! than confirmations applied while it was in flight. Every confirmation is
//! journaled under a generation number; a listing taken at generation `g`
//! is applied together with the journal entries newer than `g`.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use stockcount_core::{
    Admission, ConfirmedCounts, CountEvent, DisplayCounts, Reconciliation, ReconciliationView,
    ScanGate, ScanSource, Serial, StockIndex, StockItem,
};
use stockcount_infra::{ChangeEvent, ChangeKind, ChangeRecord, Table};

pub type SharedState = Arc<RwLock<CountState>>;

/// What applying a remote change did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEffect {
    /// Applied in place.
    Applied,
    /// Not expressible incrementally; reload the table.
    NeedsReload(Table),
}

#[derive(Debug)]
pub struct CountState {
    stock: StockIndex,
    confirmed: ConfirmedCounts,
    view: ReconciliationView,
    gate: ScanGate,
    generation: u64,
    journal: BTreeMap<u64, CountEvent>,
}

impl CountState {
    pub fn new(stock: StockIndex, gate: ScanGate) -> Self {
        let confirmed = ConfirmedCounts::new();
        let view = ReconciliationView::new(&stock, &confirmed);
        Self {
            stock,
            confirmed,
            view,
            gate,
            generation: 0,
            journal: BTreeMap::new(),
        }
    }

    pub fn shared(stock: StockIndex, gate: ScanGate) -> SharedState {
        Arc::new(RwLock::new(Self::new(stock, gate)))
    }

    pub fn stock(&self) -> &StockIndex {
        &self.stock
    }

    pub fn confirmed(&self) -> &ConfirmedCounts {
        &self.confirmed
    }

    pub fn view(&self) -> &ReconciliationView {
        &self.view
    }

    pub fn replace_stock(&mut self, items: impl IntoIterator<Item = StockItem>) {
        self.stock.replace_all(items);
        self.view.rebuild(&self.stock, &self.confirmed);
    }

    /// Generation of the latest confirmation. Read it before fetching a
    /// listing and pass it to [`CountState::replace_counts`].
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the confirmed set from a backend listing fetched at
    /// generation `fetched_at`. Confirmations made after that are kept.
    pub fn replace_counts(
        &mut self,
        events: impl IntoIterator<Item = CountEvent>,
        fetched_at: u64,
    ) {
        let (mut confirmed, shadowed) = ConfirmedCounts::from_events(events);
        for event in &shadowed {
            tracing::warn!(
                serial = %event.serial,
                correlation_id = %event.correlation_id,
                "backend listing holds a second count for one identifier; keeping the earliest"
            );
        }

        let mut kept = 0usize;
        for (_, event) in self.journal.range(fetched_at.saturating_add(1)..) {
            if confirmed.insert(event.clone()).is_ok() {
                kept += 1;
            }
        }
        if kept > 0 {
            tracing::debug!(kept, "listing predates local confirmations; kept them");
        }

        self.confirmed = confirmed;
        self.view.rebuild(&self.stock, &self.confirmed);
    }

    /// Apply one acknowledged event. Returns false when the identifier was
    /// already confirmed under another correlation id.
    pub fn confirm(&mut self, event: CountEvent) -> bool {
        let serial = event.serial.clone();
        match self.confirmed.insert(event.clone()) {
            Ok(()) => {
                self.view.mark_counted(&serial);
                self.generation += 1;
                self.journal.insert(self.generation, event);
                true
            }
            Err(err) => {
                tracing::debug!(error = %err, "confirmation ignored");
                false
            }
        }
    }

    pub fn clear_counts(&mut self) {
        self.confirmed.clear();
        self.journal.clear();
        self.view.rebuild(&self.stock, &self.confirmed);
    }

    /// Patch state from a change notification.
    pub fn apply_change(&mut self, change: ChangeEvent) -> ChangeEffect {
        match (change.kind, change.record) {
            (ChangeKind::Insert | ChangeKind::Update, Some(ChangeRecord::Stock(item))) => {
                self.stock.upsert(item);
                self.view.rebuild(&self.stock, &self.confirmed);
                ChangeEffect::Applied
            }
            (ChangeKind::Delete, Some(ChangeRecord::Stock(item))) => {
                self.stock.remove(&item.serial);
                self.view.rebuild(&self.stock, &self.confirmed);
                ChangeEffect::Applied
            }
            (ChangeKind::Insert, Some(ChangeRecord::CountRecords(event))) => {
                self.confirm(event);
                ChangeEffect::Applied
            }
            _ => ChangeEffect::NeedsReload(change.table),
        }
    }

    /// Run the gate with the confirmed set plus `pending` as the counted lookup.
    pub fn admit(
        &mut self,
        raw: &str,
        source: ScanSource<'_>,
        now: DateTime<Utc>,
        pending: &HashSet<Serial>,
    ) -> Admission {
        let Self {
            stock,
            confirmed,
            gate,
            ..
        } = self;
        let counted = |serial: &Serial| confirmed.contains(serial) || pending.contains(serial);
        gate.admit(raw, source, now, stock, &counted)
    }

    pub fn display_counts<'a>(&self, pending: impl IntoIterator<Item = &'a Serial>) -> DisplayCounts {
        DisplayCounts::compute(&self.stock, &self.confirmed, pending)
    }

    pub fn reconciliation(&self) -> Reconciliation {
        self.view.snapshot()
    }
}

/// Read lock, recovering from poisoning.
pub fn read(state: &SharedState) -> RwLockReadGuard<'_, CountState> {
    state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write lock, recovering from poisoning.
pub fn write(state: &SharedState) -> RwLockWriteGuard<'_, CountState> {
    state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use stockcount_core::{FormatWhitelist, OperatorId, RejectReason};

    fn item(serial: &str) -> StockItem {
        StockItem::new(Serial::parse(serial).unwrap(), format!("Item {serial}"))
    }

    fn state() -> CountState {
        let stock = StockIndex::from_items(["a", "b", "c"].map(item));
        CountState::new(stock, ScanGate::new(Duration::seconds(3), FormatWhitelist::strict()))
    }

    fn confirmed(serial: &str) -> CountEvent {
        CountEvent::pending(
            Serial::parse(serial).unwrap(),
            "x",
            OperatorId::parse("E1").unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        )
        .confirm()
    }

    #[test]
    fn confirm_updates_reconciliation_incrementally() {
        let mut s = state();
        assert!(s.confirm(confirmed("a")));
        assert_eq!(s.view().counted_total(), 1);
        assert_eq!(s.view().remaining_total(), 2);

        // A second event for the same identifier is refused.
        assert!(!s.confirm(confirmed("a")));
        assert_eq!(s.confirmed().len(), 1);
    }

    #[test]
    fn pending_identifiers_count_as_counted_at_the_gate() {
        let mut s = state();
        let pending: HashSet<Serial> = [Serial::parse("b").unwrap()].into();
        let now = Utc::now();

        let admission = s.admit("B", ScanSource::Manual, now, &pending);
        assert!(matches!(
            admission,
            Admission::Rejected {
                reason: RejectReason::AlreadyCounted,
                ..
            }
        ));
        assert!(s.admit("c", ScanSource::Manual, now, &pending).is_accepted());
    }

    #[test]
    fn count_deletions_require_a_reload() {
        let mut s = state();
        s.confirm(confirmed("a"));
        let effect = s.apply_change(ChangeEvent::cleared(Table::CountRecords));
        assert_eq!(effect, ChangeEffect::NeedsReload(Table::CountRecords));
    }

    #[test]
    fn stale_listing_keeps_later_confirmations() {
        let mut s = state();
        s.confirm(confirmed("a"));
        let fetched_at = s.generation();

        // Confirmed while the listing was in flight.
        s.confirm(confirmed("b"));

        s.replace_counts(vec![confirmed("a")], fetched_at);
        assert!(s.confirmed().contains(&Serial::parse("b").unwrap()));
        assert_eq!(s.view().counted_total(), 2);
        assert_eq!(s.view().remaining_total(), 1);
    }

    #[test]
    fn fresh_listing_drops_remotely_deleted_counts() {
        let mut s = state();
        s.confirm(confirmed("a"));
        let fetched_at = s.generation();

        s.replace_counts(Vec::new(), fetched_at);
        assert!(s.confirmed().is_empty());
        assert_eq!(s.view().remaining_total(), 3);
    }

    #[test]
    fn stock_changes_apply_in_place() {
        let mut s = state();
        let effect = s.apply_change(ChangeEvent::stock(ChangeKind::Insert, item("d")));
        assert_eq!(effect, ChangeEffect::Applied);
        assert_eq!(s.stock().len(), 4);
        assert_eq!(s.view().remaining_total(), 4);
    }
}
