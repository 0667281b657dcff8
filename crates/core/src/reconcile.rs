//! Reconciliation View: counted vs remaining.
//!
//! `remaining = stock − confirmed`, `counted = |confirmed|`. The view is a
//! disposable read model; [`reconcile`] is the reference computation and
//! [`ReconciliationView`] keeps an incrementally patched copy that must
//! always equal a fresh recomputation.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::count::ConfirmedCounts;
use crate::id::Serial;
use crate::stock::{StockIndex, StockItem};

/// Width of a masked serial.
pub const MASK_WIDTH: usize = 14;
const MASK_CHAR: char = '*';
const VISIBLE_TAIL: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub counted_total: usize,
    pub remaining: Vec<StockItem>,
}

impl Reconciliation {
    pub fn remaining_total(&self) -> usize {
        self.remaining.len()
    }

    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Full recomputation from both inputs.
pub fn reconcile<'a>(
    stock: &StockIndex,
    confirmed: impl IntoIterator<Item = &'a Serial>,
) -> Reconciliation {
    let counted: HashSet<&Serial> = confirmed.into_iter().collect();
    let remaining = stock
        .iter()
        .filter(|item| !counted.contains(&item.serial))
        .cloned()
        .collect();

    Reconciliation {
        counted_total: counted.len(),
        remaining,
    }
}

/// Incrementally maintained reconciliation.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationView {
    counted: HashSet<Serial>,
    remaining: BTreeMap<Serial, StockItem>,
}

impl ReconciliationView {
    pub fn new(stock: &StockIndex, confirmed: &ConfirmedCounts) -> Self {
        let mut view = Self::default();
        view.rebuild(stock, confirmed);
        view
    }

    /// Recompute from scratch (stock refresh, history reload).
    pub fn rebuild(&mut self, stock: &StockIndex, confirmed: &ConfirmedCounts) {
        self.counted = confirmed.serials().cloned().collect();
        self.remaining = stock
            .iter()
            .filter(|item| !self.counted.contains(&item.serial))
            .map(|item| (item.serial.clone(), item.clone()))
            .collect();
    }

    /// Apply one newly confirmed identifier.
    ///
    /// Equivalent to a rebuild because the confirmed set is deduplicated by
    /// identifier: a serial already counted changes nothing.
    pub fn mark_counted(&mut self, serial: &Serial) {
        if self.counted.insert(serial.clone()) {
            self.remaining.remove(serial);
        }
    }

    pub fn counted_total(&self) -> usize {
        self.counted.len()
    }

    pub fn remaining_total(&self) -> usize {
        self.remaining.len()
    }

    pub fn remaining(&self) -> impl Iterator<Item = &StockItem> {
        self.remaining.values()
    }

    pub fn snapshot(&self) -> Reconciliation {
        Reconciliation {
            counted_total: self.counted.len(),
            remaining: self.remaining.values().cloned().collect(),
        }
    }
}

/// Counts as shown to the operator, including optimistic pending events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplayCounts {
    pub confirmed: usize,
    /// Pending events whose identifier is not yet confirmed.
    pub pending: usize,
    pub counted: usize,
    pub remaining: usize,
}

impl DisplayCounts {
    pub fn compute<'a>(
        stock: &StockIndex,
        confirmed: &ConfirmedCounts,
        pending: impl IntoIterator<Item = &'a Serial>,
    ) -> Self {
        let pending: HashSet<&Serial> = pending
            .into_iter()
            .filter(|s| !confirmed.contains(s))
            .collect();
        let remaining = stock
            .iter()
            .filter(|item| !confirmed.contains(&item.serial) && !pending.contains(&item.serial))
            .count();

        Self {
            confirmed: confirmed.len(),
            pending: pending.len(),
            counted: confirmed.len() + pending.len(),
            remaining,
        }
    }
}

/// Mask a serial for ambient displays: last four characters visible,
/// left-padded with `*` to a fixed width.
pub fn mask_serial(serial: &str) -> String {
    let chars: Vec<char> = serial.chars().collect();
    if chars.len() > VISIBLE_TAIL {
        let tail: String = chars[chars.len() - VISIBLE_TAIL..].iter().collect();
        let mut masked: String = std::iter::repeat(MASK_CHAR)
            .take(MASK_WIDTH - VISIBLE_TAIL)
            .collect();
        masked.push_str(&tail);
        masked
    } else {
        let pad = MASK_WIDTH - chars.len();
        std::iter::repeat(MASK_CHAR).take(pad).chain(chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::count::CountEvent;
    use crate::id::OperatorId;
    use chrono::Utc;
    use proptest::prelude::*;

    fn serial(s: &str) -> Serial {
        Serial::parse(s).unwrap()
    }

    fn stock(serials: &[&str]) -> StockIndex {
        StockIndex::from_items(serials.iter().map(|s| StockItem::new(serial(s), format!("Item {s}"))))
    }

    fn confirmed(serials: &[&str]) -> ConfirmedCounts {
        let (set, _) = ConfirmedCounts::from_events(serials.iter().map(|s| {
            CountEvent::pending(serial(s), "x", OperatorId::parse("E1").unwrap(), Utc::now())
        }));
        set
    }

    fn remaining_serials(r: &Reconciliation) -> Vec<&str> {
        r.remaining.iter().map(|i| i.serial.as_str()).collect()
    }

    #[test]
    fn remaining_is_stock_minus_confirmed() {
        let stock = stock(&["A", "B", "C", "D"]);
        let counted = confirmed(&["A", "C"]);
        let r = reconcile(&stock, counted.serials());
        assert_eq!(r.counted_total, 2);
        assert_eq!(remaining_serials(&r), vec!["b", "d"]);
    }

    #[test]
    fn incremental_update_matches_recomputation() {
        let stock = stock(&["A", "B", "C", "D"]);
        let mut counted = confirmed(&["A", "C"]);
        let mut view = ReconciliationView::new(&stock, &counted);

        counted
            .insert(CountEvent::pending(serial("b"), "x", OperatorId::parse("E2").unwrap(), Utc::now()))
            .unwrap();
        view.mark_counted(&serial("B"));

        let expected = reconcile(&stock, counted.serials());
        assert_eq!(view.snapshot(), expected);
        assert_eq!(remaining_serials(&expected), vec!["d"]);
        assert_eq!(view.counted_total(), 3);
    }

    #[test]
    fn counted_events_outside_stock_do_not_make_remaining_negative() {
        let stock = stock(&["A"]);
        let counted = confirmed(&["A", "Z"]);
        let r = reconcile(&stock, counted.serials());
        assert_eq!(r.counted_total, 2);
        assert!(r.is_complete());
    }

    #[test]
    fn display_counts_include_pending_once() {
        let stock = stock(&["A", "B", "C"]);
        let counted = confirmed(&["A"]);
        let pending = [serial("a"), serial("b"), serial("b")];
        let counts = DisplayCounts::compute(&stock, &counted, pending.iter());
        assert_eq!(
            counts,
            DisplayCounts {
                confirmed: 1,
                pending: 1,
                counted: 2,
                remaining: 1,
            }
        );
    }

    #[test]
    fn masking_keeps_last_four() {
        assert_eq!(mask_serial("SN1234567890"), "**********7890");
        assert_eq!(mask_serial("AB1"), "***********AB1");
        assert_eq!(mask_serial("ABCD"), "**********ABCD");
        assert_eq!(mask_serial("").len(), MASK_WIDTH);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: applying confirmations one by one never drifts from a
        /// full recomputation.
        #[test]
        fn incremental_view_never_drifts(
            stock_ids in prop::collection::btree_set(0u16..50, 0..30),
            counts in prop::collection::vec(0u16..60, 0..40)
        ) {
            let names: Vec<String> = stock_ids.iter().map(|n| format!("s{n}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let stock = stock(&refs);
            let mut set = ConfirmedCounts::new();
            let mut view = ReconciliationView::new(&stock, &set);

            for n in counts {
                let s = serial(&format!("S{n}"));
                let event = CountEvent::pending(s.clone(), "x", OperatorId::parse("E").unwrap(), Utc::now());
                if set.insert(event).is_ok() {
                    view.mark_counted(&s);
                }
                prop_assert_eq!(view.snapshot(), reconcile(&stock, set.serials()));
            }
        }
    }
}
