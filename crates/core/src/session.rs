//! Operator Session state machine.
//!
//! `Unset → Active(id, since)`. An active session goes stale once more than
//! the timeout has elapsed since it was set; the stored id is kept (for
//! display) but every write path must treat a stale session like an unset
//! one and re-prompt. Nothing else invalidates a session.

use chrono::{DateTime, Duration, Utc};

use crate::error::DomainResult;
use crate::id::OperatorId;

/// Default operator timeout: 30 minutes.
pub const DEFAULT_OPERATOR_TIMEOUT_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unset,
    Active {
        operator: OperatorId,
        since: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct OperatorSession {
    state: SessionState,
    timeout: Duration,
}

impl Default for OperatorSession {
    fn default() -> Self {
        Self::new(Duration::minutes(DEFAULT_OPERATOR_TIMEOUT_MINUTES))
    }
}

impl OperatorSession {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: SessionState::Unset,
            timeout,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The operator usable for a write at `now`, if the session is fresh.
    pub fn current(&self, now: DateTime<Utc>) -> Option<&OperatorId> {
        match &self.state {
            SessionState::Active { operator, since } if now - *since <= self.timeout => {
                Some(operator)
            }
            _ => None,
        }
    }

    /// True when a prompt is required before the next write.
    pub fn needs_prompt(&self, now: DateTime<Utc>) -> bool {
        self.current(now).is_none()
    }

    /// Last operator entered, fresh or not.
    pub fn last_known(&self) -> Option<&OperatorId> {
        match &self.state {
            SessionState::Active { operator, .. } => Some(operator),
            SessionState::Unset => None,
        }
    }

    /// Apply a prompt response. Blank responses are refused and leave the
    /// session untouched.
    pub fn sign_in(&mut self, response: &str, now: DateTime<Utc>) -> DomainResult<OperatorId> {
        let operator = OperatorId::parse(response)?;
        self.state = SessionState::Active {
            operator: operator.clone(),
            since: now,
        };
        Ok(operator)
    }
}
