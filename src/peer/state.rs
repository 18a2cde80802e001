use crate::error::CallError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Connectivity status of a call.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Waiting,
    WaitingForOffer,
    CreatingOffer,
    CreatingAnswer,
    Connected,
    Error,
    /// Signaling transport lost
    Disconnected,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Error | CallStatus::Disconnected)
    }

    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::*;
        match (self, next) {
            (Error, _) | (Disconnected, _) => false,
            (_, Error) | (_, Disconnected) => true,
            (Waiting, WaitingForOffer) | (Waiting, CreatingOffer) => true,
            (WaitingForOffer, CreatingAnswer) => true,
            (CreatingOffer, Connected) | (CreatingAnswer, Connected) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Waiting => "waiting",
            CallStatus::WaitingForOffer => "waiting-for-offer",
            CallStatus::CreatingOffer => "creating-offer",
            CallStatus::CreatingAnswer => "creating-answer",
            CallStatus::Connected => "connected",
            CallStatus::Error => "error",
            CallStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, watchable status of one call. Every change goes through
/// [`StatusTracker::transition`], which enforces the allowed edges.
#[derive(Clone)]
pub struct StatusTracker {
    tx: Arc<watch::Sender<CallStatus>>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CallStatus::Waiting);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> CallStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.tx.subscribe()
    }

    /// Moves to `next`; re-entering the current status is a no-op.
    pub fn transition(&self, next: CallStatus) -> Result<CallStatus, CallError> {
        let current = self.current();
        if current == next {
            return Ok(current);
        }
        if !current.can_transition_to(next) {
            return Err(CallError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        self.tx.send_replace(next);
        tracing::info!(from = %current, to = %next, "Call status changed");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CallStatus::*;

    const ALL: [CallStatus; 7] = [
        Waiting,
        WaitingForOffer,
        CreatingOffer,
        CreatingAnswer,
        Connected,
        Error,
        Disconnected,
    ];

    #[test]
    fn offerer_path() {
        let s = StatusTracker::new();
        s.transition(CreatingOffer).unwrap();
        s.transition(Connected).unwrap();
        assert_eq!(s.current(), Connected);
    }

    #[test]
    fn answerer_path() {
        let s = StatusTracker::new();
        s.transition(WaitingForOffer).unwrap();
        s.transition(CreatingAnswer).unwrap();
        s.transition(Connected).unwrap();
        assert_eq!(s.current(), Connected);
    }

    #[test]
    fn connected_requires_negotiation_first() {
        let s = StatusTracker::new();
        assert!(matches!(
            s.transition(Connected),
            Err(CallError::InvalidTransition { from: Waiting, to: Connected })
        ));
        s.transition(WaitingForOffer).unwrap();
        assert!(s.transition(Connected).is_err());
        assert_eq!(s.current(), WaitingForOffer);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [Error, Disconnected] {
            for next in ALL {
                if next != terminal {
                    assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
                }
            }
        }
    }

    #[test]
    fn every_live_state_can_fail() {
        for from in [Waiting, WaitingForOffer, CreatingOffer, CreatingAnswer, Connected] {
            assert!(from.can_transition_to(Error));
            assert!(from.can_transition_to(Disconnected));
        }
    }

    #[test]
    fn no_backwards_edges() {
        assert!(!Connected.can_transition_to(Waiting));
        assert!(!CreatingAnswer.can_transition_to(WaitingForOffer));
        assert!(!CreatingOffer.can_transition_to(CreatingAnswer));
        assert!(!WaitingForOffer.can_transition_to(CreatingOffer));
    }

    #[test]
    fn same_status_is_noop() {
        let s = StatusTracker::new();
        s.transition(Error).unwrap();
        assert_eq!(s.transition(Error).unwrap(), Error);
    }

    #[test]
    fn watchers_see_changes() {
        let s = StatusTracker::new();
        let rx = s.subscribe();
        s.transition(CreatingOffer).unwrap();
        assert_eq!(*rx.borrow(), CreatingOffer);
    }

    #[test]
    fn serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&WaitingForOffer).unwrap(),
            "\"waiting-for-offer\""
        );
        assert_eq!(WaitingForOffer.to_string(), "waiting-for-offer");
    }
}
