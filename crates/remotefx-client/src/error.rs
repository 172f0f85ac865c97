//! Error types for the remote client

use thiserror::Error;

/// Coarse error category, used by host integrations to decide whether to
/// call `reconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Negotiation,
    TransportStall,
    RealtimeContention,
    State,
    Remote,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Negotiation => write!(f, "negotiation"),
            ErrorKind::TransportStall => write!(f, "transport stall"),
            ErrorKind::RealtimeContention => write!(f, "realtime contention"),
            ErrorKind::State => write!(f, "session state"),
            ErrorKind::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Timeout after {duration_ms}ms: {operation}")]
    TransportStall { operation: String, duration_ms: u64 },

    /// Returned by `AudioAccess::try_acquire`; `Session::process` reports it
    /// as `StreamStatus::Contended`.
    #[error("Audio lock not acquired after {attempts} attempts")]
    RealtimeContention { attempts: u32 },

    #[error("Session is not ready")]
    NotReady,

    #[error("Session is closed")]
    Closed,

    #[error("Server error: {0}")]
    Remote(String),

    #[error("No plugin in slot {0}")]
    InvalidSlot(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Payload error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::ConnectionFailed(_) | ClientError::Io(_) => ErrorKind::Connection,
            ClientError::Protocol(_) | ClientError::Bincode(_) | ClientError::Json(_) => {
                ErrorKind::Protocol
            }
            ClientError::Negotiation(_) => ErrorKind::Negotiation,
            ClientError::TransportStall { .. } => ErrorKind::TransportStall,
            ClientError::RealtimeContention { .. } => ErrorKind::RealtimeContention,
            ClientError::NotReady | ClientError::Closed | ClientError::InvalidSlot(_) => {
                ErrorKind::State
            }
            ClientError::Remote(_) => ErrorKind::Remote,
        }
    }

    /// Fatal errors move the whole session to `Error`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Protocol | ErrorKind::Negotiation
        )
    }

    pub(crate) fn stall(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        ClientError::TransportStall {
            operation: operation.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
