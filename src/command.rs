use crate::error::EclaError;

/// Commands delivered from session handles to the drive loop
#[derive(Debug)]
pub enum SessionCommand {
    /// Write an already encoded frame, best effort
    Write(String),
    /// Start the close handshake and stop the drive loop
    Close,
}

/// Connection state of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, no transport has been opened yet
    BeforeOpen,
    /// Transport open, `RegisterPacket` sent, waiting for the daemon's answer
    AwaitingRegistration,
    /// Registered, steady-state dispatch
    Connected,
    /// Transport lost, re-opening at the same address
    Reconnecting,
    /// Terminal, carries the daemon's reason
    Failed(String),
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::BeforeOpen => "BeforeOpen",
            ConnectionState::AwaitingRegistration => "AwaitingRegistration",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Failed(_) => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Failed(reason) => write!(f, "Failed({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Snapshot of everything a session publishes
///
/// Published as one value so readers never see a new state next to a stale
/// transport flag or error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Whether a transport is currently open
    pub transport_open: bool,
    pub last_error: Option<EclaError>,
    /// Set once the drive loop has returned
    pub terminated: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::BeforeOpen,
            transport_open: false,
            last_error: None,
            terminated: false,
        }
    }
}
