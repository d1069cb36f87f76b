use serde::Serialize;

/// Controller-side view of the link and of pending state transitions.
/// Derived from transport link events and received service states only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    #[default]
    Initial,
    Connected,
    Disconnected,
    /// A command that changes the service state was sent and not yet confirmed
    WaitingForStateChange,
}

impl ControllerState {
    /// Whether operator commands are accepted
    pub fn accepts_commands(self) -> bool {
        self == ControllerState::Connected
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Initial => write!(f, "initial"),
            ControllerState::Connected => write!(f, "connected"),
            ControllerState::Disconnected => write!(f, "disconnected"),
            ControllerState::WaitingForStateChange => write!(f, "waiting for state change"),
        }
    }
}
