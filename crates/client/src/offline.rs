//! Connectivity state as observed from backend calls.
//!
//! There is no separate connectivity check: every sync attempt doubles as one. Scanning
//! never consults this; it only drives the status line and log output.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct OfflineMode {
    state: ConnectivityState,
    since: Option<DateTime<Utc>>,
}

impl Default for OfflineMode {
    fn default() -> Self {
        Self {
            state: ConnectivityState::Online,
            since: None,
        }
    }
}

impl OfflineMode {
    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// When the current state was entered, if it ever changed.
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    pub fn is_offline(&self) -> bool {
        self.state == ConnectivityState::Offline
    }

    /// Mark the backend unreachable. Returns true on a transition.
    pub fn set_offline(&mut self, now: DateTime<Utc>) -> bool {
        self.transition(ConnectivityState::Offline, now)
    }

    /// Mark the backend reachable. Returns true on a transition.
    pub fn set_online(&mut self, now: DateTime<Utc>) -> bool {
        self.transition(ConnectivityState::Online, now)
    }

    fn transition(&mut self, to: ConnectivityState, now: DateTime<Utc>) -> bool {
        if self.state == to {
            return false;
        }
        self.state = to;
        self.since = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_reported_once() {
        let mut mode = OfflineMode::default();
        let now = Utc::now();
        assert!(!mode.set_online(now));
        assert!(mode.set_offline(now));
        assert!(!mode.set_offline(now));
        assert!(mode.is_offline());
        assert_eq!(mode.since(), Some(now));
        assert!(mode.set_online(now));
        assert_eq!(mode.state(), ConnectivityState::Online);
    }
}
