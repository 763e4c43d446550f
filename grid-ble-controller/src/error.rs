use crate::session::SessionState;

/// Failure of the underlying BLE transport. Always recoverable by dropping
/// the session and letting the scanner try again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("link is not connected")]
    Disconnected,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Backend(String),
}

#[cfg(feature = "native")]
impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => TransportError::Disconnected,
            btleplug::Error::DeviceNotFound => TransportError::NotFound("device".to_string()),
            btleplug::Error::TimedOut(d) => TransportError::Timeout(d),
            other => TransportError::Backend(other.to_string()),
        }
    }
}

/// Session step that was running when a transport error hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Discover,
    Write,
    Read,
    Subscribe,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phase::Connect => "connect",
            Phase::Discover => "service discovery",
            Phase::Write => "write",
            Phase::Read => "read",
            Phase::Subscribe => "subscribe",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport failure during {phase}: {source}")]
    Transport {
        phase: Phase,
        #[source]
        source: TransportError,
    },
    #[error("config service not found, not one of our devices")]
    MissingService,
    #[error("{0} characteristic not found, not one of our devices")]
    MissingCharacteristic(&'static str),
    /// A command other than authenticate was issued before authentication.
    #[error("{command} requires an authenticated session (session is {state})")]
    NotAuthenticated {
        command: &'static str,
        state: SessionState,
    },
    #[error("session is {state}, expected {expected}")]
    InvalidState {
        state: SessionState,
        expected: SessionState,
    },
    #[error("invalid command: {0}")]
    InvalidCommand(#[from] grid_proto::CommandError),
    #[error("node does not expose the sensor data characteristic")]
    TelemetryUnavailable,
}

impl SessionError {
    pub(crate) fn transport(phase: Phase, source: TransportError) -> Self {
        SessionError::Transport { phase, source }
    }

    /// Precondition failures are caller bugs, not device or radio problems.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SessionError::NotAuthenticated { .. } | SessionError::InvalidState { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine home directory, set GRID_HOME")]
    NoHome,
    #[error("failed to access {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config in {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}
