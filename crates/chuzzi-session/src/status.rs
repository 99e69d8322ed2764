use std::fmt;

/// Connection lifecycle of the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Waiting for the retry timer.
    Reconnecting,
    /// Retries exhausted or credentials refused. Only `start()` leaves it.
    Failed,
    Closed,
}

impl ConnectionState {
    /// Whether a connection is open or being opened.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

/// Snapshot of the connection as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Connecting if self.attempt == 0 => write!(f, "connecting"),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                write!(f, "reconnecting ({}/{})", self.attempt, self.max_attempts)
            }
            ConnectionState::Open => write!(f, "listening"),
            ConnectionState::Failed => write!(f, "failed — check network"),
        }
    }
}
