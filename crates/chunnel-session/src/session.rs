//! Session identity and state machine

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Session identifier, used only for logging/correlation.
pub type SessionId = u64;

/// Monotonic session ID generator shared by a listener.
#[derive(Clone)]
pub struct SessionIdGenerator {
    next: Arc<AtomicU64>,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> SessionId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Session lifecycle states.
///
/// `Connecting -> Handshaking -> Relaying -> Closed`, with `Errored`
/// absorbing from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Relaying,
    Closed,
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }

    fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Connecting, Handshaking) => true,
            (Handshaking, Relaying) => true,
            (Connecting | Handshaking | Relaying, Closed) => true,
            (Connecting | Handshaking | Relaying, Errored) => true,
            _ => false,
        }
    }
}

/// Per-connection session state.
pub struct Session {
    id: SessionId,
    state: SessionState,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Connecting,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Advance the state machine. Illegal transitions indicate a bug
    /// in the driving role; they are logged and ignored rather than
    /// panicking mid-relay.
    pub fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            debug_assert!(
                self.state.is_terminal(),
                "illegal session transition {:?} -> {:?}",
                self.state,
                next
            );
            warn!(
                "Ignoring illegal session transition {:?} -> {:?} (session {})",
                self.state, next, self.id
            );
            return;
        }
        debug!(
            "Session {} {:?} -> {:?}",
            self.id, self.state, next
        );
        self.state = next;
    }

    /// Enter the absorbing error state (no-op once terminal).
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.transition(SessionState::Errored);
        }
    }

    /// Enter the closed state (no-op once terminal).
    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.transition(SessionState::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generator_monotonic() {
        let ids = SessionIdGenerator::new();
        assert_eq!(ids.generate(), 1);
        assert_eq!(ids.generate(), 2);

        let clone = ids.clone();
        assert_eq!(clone.generate(), 3);
    }

    #[test]
    fn test_happy_path() {
        let mut session = Session::new(7);
        assert_eq!(session.state(), SessionState::Connecting);

        session.transition(SessionState::Handshaking);
        session.transition(SessionState::Relaying);
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_errored_is_absorbing() {
        let mut session = Session::new(1);
        session.transition(SessionState::Handshaking);
        session.fail();
        assert_eq!(session.state(), SessionState::Errored);

        session.close();
        assert_eq!(session.state(), SessionState::Errored);

        session.fail();
        assert_eq!(session.state(), SessionState::Errored);
    }

    #[test]
    fn test_error_reachable_from_every_live_state() {
        for setup in 0..3usize {
            let mut session = Session::new(1);
            if setup >= 1 {
                session.transition(SessionState::Handshaking);
            }
            if setup >= 2 {
                session.transition(SessionState::Relaying);
            }
            session.fail();
            assert_eq!(session.state(), SessionState::Errored);
        }
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut session = Session::new(1);
        session.transition(SessionState::Handshaking);
        session.transition(SessionState::Relaying);
        session.close();
        session.fail();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
