//! Session state machine

use serde::{Deserialize, Serialize};
use std::fmt;

use dg_core::{MachineStatus, SessionError};

/// Lifecycle state of a session
///
/// ```text
/// pending -> authenticating -> tunneling -> connected -> disconnecting -> closed
///     \____________\_______________\____________\______________\--> failed
/// ```
///
/// Any non-terminal state may also jump to `disconnecting` when the
/// session is closed before it finished connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Authenticating,
    Tunneling,
    Connected,
    Disconnecting,
    Closed,
    Failed,
}

impl SessionState {
    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Pending, Authenticating)
            | (Authenticating, Tunneling)
            | (Tunneling, Connected)
            | (Disconnecting, Closed) => true,
            (Pending | Authenticating | Tunneling | Connected, Disconnecting) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Machine status advertised while a session sits in this state.
    ///
    /// `None` for `disconnecting` (status is left as is) and for terminal
    /// states, whose status depends on the termination cause.
    pub fn live_status(&self) -> Option<MachineStatus> {
        match self {
            SessionState::Pending | SessionState::Authenticating | SessionState::Tunneling => {
                Some(MachineStatus::Connecting)
            }
            SessionState::Connected => Some(MachineStatus::Active),
            SessionState::Disconnecting | SessionState::Closed | SessionState::Failed => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Pending => "pending",
            SessionState::Authenticating => "authenticating",
            SessionState::Tunneling => "tunneling",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a session left (or is leaving) the live states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    /// Close requested by the user
    UserClose,
    /// Broker shutting down
    Shutdown,
    /// Gateway ended the session with `disconnect`
    GatewayClosed,
    /// Gateway reported a fatal error on the established session
    ProtocolFault(String),
    /// Tunnel transport dropped
    TransportLost(String),
    /// Authentication retries exhausted or credentials rejected
    AuthFailure(String),
    /// Tunnel could not be established
    TunnelFailure(String),
    /// Session did not reach a terminal state within the close timeout
    CloseTimeout,
    /// Session actor exited without running its teardown
    ActorLost,
}

impl TerminationCause {
    /// Machine status once the session is terminal
    pub fn terminal_status(&self) -> MachineStatus {
        match self {
            TerminationCause::UserClose
            | TerminationCause::Shutdown
            | TerminationCause::GatewayClosed
            | TerminationCause::ActorLost => MachineStatus::Inactive,
            TerminationCause::ProtocolFault(_)
            | TerminationCause::TransportLost(_)
            | TerminationCause::AuthFailure(_)
            | TerminationCause::TunnelFailure(_)
            | TerminationCause::CloseTimeout => MachineStatus::Error,
        }
    }

    /// Structured error for causes that are failures
    pub fn as_error(&self) -> Option<SessionError> {
        match self {
            TerminationCause::AuthFailure(msg) => Some(SessionError::AuthFailure(msg.clone())),
            TerminationCause::TunnelFailure(msg) => Some(SessionError::TunnelFailure(msg.clone())),
            TerminationCause::ProtocolFault(msg) | TerminationCause::TransportLost(msg) => {
                Some(SessionError::ProtocolFault(msg.clone()))
            }
            TerminationCause::CloseTimeout => Some(SessionError::ProtocolFault(
                "session did not close within the timeout".to_string(),
            )),
            TerminationCause::ActorLost => Some(SessionError::ProtocolFault(
                "session actor exited without teardown".to_string(),
            )),
            TerminationCause::UserClose
            | TerminationCause::Shutdown
            | TerminationCause::GatewayClosed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 7] = [
        Pending,
        Authenticating,
        Tunneling,
        Connected,
        Disconnecting,
        Closed,
        Failed,
    ];

    #[test]
    fn test_happy_path_is_valid() {
        let path = [Pending, Authenticating, Tunneling, Connected, Disconnecting, Closed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [Closed, Failed] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_no_skipping_forward() {
        assert!(!Pending.can_transition_to(Connected));
        assert!(!Authenticating.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Closed));
        assert!(!Tunneling.can_transition_to(Authenticating));
    }

    #[test]
    fn test_failed_reachable_from_every_live_state() {
        for from in [Pending, Authenticating, Tunneling, Connected, Disconnecting] {
            assert!(from.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_live_status_mapping() {
        assert_eq!(Pending.live_status(), Some(MachineStatus::Connecting));
        assert_eq!(Tunneling.live_status(), Some(MachineStatus::Connecting));
        assert_eq!(Connected.live_status(), Some(MachineStatus::Active));
        assert_eq!(Disconnecting.live_status(), None);
        assert_eq!(Closed.live_status(), None);
    }

    #[test]
    fn test_cause_status_and_error() {
        assert_eq!(TerminationCause::UserClose.terminal_status(), MachineStatus::Inactive);
        assert_eq!(
            TerminationCause::ProtocolFault("boom".into()).terminal_status(),
            MachineStatus::Error
        );
        assert_eq!(TerminationCause::ActorLost.terminal_status(), MachineStatus::Inactive);
        assert_eq!(
            TerminationCause::AuthFailure("denied".into()).as_error(),
            Some(SessionError::AuthFailure("denied".into()))
        );
        assert!(TerminationCause::UserClose.as_error().is_none());
    }
}
