//! Count events and the confirmed count set.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{CorrelationId, OperatorId, Serial};

/// Confirmation state of a count event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationState {
    /// Recorded locally, not yet acknowledged by the backend.
    Pending,
    /// Acknowledged by the backend as durably stored.
    Confirmed,
}

impl ConfirmationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationState::Pending => "pending",
            ConfirmationState::Confirmed => "confirmed",
        }
    }
}

/// One counted stock unit.
///
/// The display name is a denormalized copy taken at scan time, so later stock
/// re-imports do not rewrite history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountEvent {
    pub correlation_id: CorrelationId,
    pub serial: Serial,
    pub name: String,
    pub operator: OperatorId,
    pub created_at: DateTime<Utc>,
    pub state: ConfirmationState,
}

impl CountEvent {
    /// Create a new pending event.
    pub fn pending(
        serial: Serial,
        name: impl Into<String>,
        operator: OperatorId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            serial,
            name: name.into(),
            operator,
            created_at,
            state: ConfirmationState::Pending,
        }
    }

    /// The only permitted mutation: pending → confirmed.
    pub fn confirm(mut self) -> Self {
        self.state = ConfirmationState::Confirmed;
        self
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == ConfirmationState::Confirmed
    }
}

/// The confirmed count set: at most one event per normalized identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmedCounts {
    by_serial: HashMap<Serial, CountEvent>,
}

impl ConfirmedCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a backend listing.
    ///
    /// Should the listing ever contain two events for one identifier, the
    /// earliest wins and the later ones are returned so the caller can log
    /// them.
    pub fn from_events(events: impl IntoIterator<Item = CountEvent>) -> (Self, Vec<CountEvent>) {
        let mut sorted: Vec<CountEvent> = events.into_iter().collect();
        sorted.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.correlation_id.cmp(&b.correlation_id))
        });

        let mut set = Self::new();
        let mut shadowed = Vec::new();
        for event in sorted {
            if let Err(rejected) = set.try_insert(event) {
                shadowed.push(rejected);
            }
        }
        (set, shadowed)
    }

    /// Insert a confirmed event, refusing a second event for the same identifier.
    ///
    /// Re-inserting the same correlation id is a no-op.
    pub fn insert(&mut self, event: CountEvent) -> DomainResult<()> {
        self.try_insert(event)
            .map_err(|rejected| DomainError::already_counted(rejected.serial.as_str()))
    }

    fn try_insert(&mut self, event: CountEvent) -> Result<(), CountEvent> {
        match self.by_serial.get(&event.serial) {
            Some(existing) if existing.correlation_id == event.correlation_id => Ok(()),
            Some(_) => Err(event),
            None => {
                self.by_serial.insert(event.serial.clone(), event.confirm());
                Ok(())
            }
        }
    }

    pub fn get(&self, serial: &Serial) -> Option<&CountEvent> {
        self.by_serial.get(serial)
    }

    pub fn contains(&self, serial: &Serial) -> bool {
        self.by_serial.contains_key(serial)
    }

    pub fn len(&self) -> usize {
        self.by_serial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_serial.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_serial.clear();
    }

    pub fn serials(&self) -> impl Iterator<Item = &Serial> {
        self.by_serial.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CountEvent> {
        self.by_serial.values()
    }

    /// History view: newest first.
    pub fn newest_first(&self) -> Vec<&CountEvent> {
        let mut events: Vec<&CountEvent> = self.by_serial.values().collect();
        events.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.correlation_id.cmp(&a.correlation_id))
        });
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn event(serial: &str, operator: &str, offset_secs: i64) -> CountEvent {
        CountEvent::pending(
            Serial::parse(serial).unwrap(),
            "Item",
            OperatorId::parse(operator).unwrap(),
            t0() + Duration::seconds(offset_secs),
        )
    }

    #[test]
    fn insert_confirms_and_refuses_second_event_for_same_serial() {
        let mut set = ConfirmedCounts::new();
        set.insert(event("SN1", "E1", 0)).unwrap();
        assert!(set.get(&Serial::parse("sn1").unwrap()).unwrap().is_confirmed());

        let err = set.insert(event("sn1", "E2", 5)).unwrap_err();
        assert_eq!(err, DomainError::AlreadyCounted("sn1".to_string()));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn reinserting_same_correlation_id_is_idempotent() {
        let mut set = ConfirmedCounts::new();
        let e = event("SN1", "E1", 0);
        set.insert(e.clone()).unwrap();
        set.insert(e).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn from_events_keeps_earliest_and_reports_shadowed() {
        let later = event("SN1", "E2", 60);
        let earlier = event("SN1", "E1", 0);
        let (set, shadowed) = ConfirmedCounts::from_events([later.clone(), earlier]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&later.serial).unwrap().operator.as_str(), "E1");
        assert_eq!(shadowed, vec![later]);
    }

    #[test]
    fn newest_first_orders_by_timestamp_desc() {
        let (set, _) = ConfirmedCounts::from_events([
            event("a", "E1", 0),
            event("b", "E1", 20),
            event("c", "E1", 10),
        ]);
        let order: Vec<&str> = set.newest_first().iter().map(|e| e.serial.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    proptest! {
        /// Property: whatever sequence of inserts two racing writers produce,
        /// the confirmed set never holds two events for one identifier.
        #[test]
        fn confirmed_set_never_duplicates_identifiers(
            scans in prop::collection::vec((0u8..8, any::<bool>()), 1..64)
        ) {
            let mut set = ConfirmedCounts::new();
            let mut seen = std::collections::HashSet::new();
            for (i, (n, upper)) in scans.into_iter().enumerate() {
                let raw = if upper { format!("SN{n}") } else { format!("sn{n}") };
                let operator = if i % 2 == 0 { "device-a" } else { "device-b" };
                let result = set.insert(event(&raw, operator, i as i64));
                let fresh = seen.insert(n);
                prop_assert_eq!(result.is_ok(), fresh);
            }
            prop_assert_eq!(set.len(), seen.len());
        }
    }
}
