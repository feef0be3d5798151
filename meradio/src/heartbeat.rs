//! Scheduling state for the location heartbeat and the one-shot history bootstrap.
//!
//! Neither type owns a timer. They decide *when* the connection manager must (re)arm or drop its interval, and
//! whether the history request is due, as a function of the current session identity and position.
use crate::api::ClientId;

/// What the connection manager must do with its heartbeat interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatChange {
    /// Cancel any running interval and start a fresh one whose first tick fires immediately.
    Start,
    /// Cancel the running interval.
    Stop,
}

/// Tracks which identity the running heartbeat belongs to.
#[derive(Debug, Default)]
pub struct Heartbeat {
    running_for: Option<ClientId>,
}

impl Heartbeat {
    /// Brings the heartbeat in line with its inputs.
    ///
    /// The heartbeat runs while a session identity is held and the position is resolved. A change of identity
    /// restarts it so no tick ever carries a stale identity.
    pub fn reconcile(&mut self, identity: Option<&ClientId>, position_resolved: bool) -> Option<HeartbeatChange> {
        match identity.filter(|_| position_resolved) {
            Some(id) if self.running_for.as_ref() == Some(id) => None,
            Some(id) => {
                self.running_for = Some(id.clone());
                Some(HeartbeatChange::Start)
            }
            None => self.stop(),
        }
    }

    pub fn stop(&mut self) -> Option<HeartbeatChange> {
        self.running_for.take().map(|_| HeartbeatChange::Stop)
    }

    pub fn is_running(&self) -> bool {
        self.running_for.is_some()
    }
}

/// Latch guarding the history request: it fires once per identity.
#[derive(Debug, Default)]
pub struct HistoryLatch {
    fired_for: Option<ClientId>,
}

impl HistoryLatch {
    /// Returns true exactly once for each identity, the first time an identity is held while the position is
    /// resolved.
    pub fn try_fire(&mut self, identity: Option<&ClientId>, position_resolved: bool) -> bool {
        match identity {
            Some(id) if position_resolved && self.fired_for.as_ref() != Some(id) => {
                self.fired_for = Some(id.clone());
                true
            }
            _ => false,
        }
    }
}
