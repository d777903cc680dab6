//! Error type shared by the log, the transaction state machine, the replication
//! link and the recovery machine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,

    /// Expected outcome of lookups and prunes, not a failure of the callee.
    #[error("not found")]
    NotFound,

    /// Malformed or inconsistent descriptor, or a violated prune precondition.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("not connected to {0}")]
    NotConnected(String),

    #[error("timed out")]
    Timeout,

    #[error("malformed message")]
    Malformed,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("component is shut down")]
    Shutdown,
}

impl Error {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    /// Transport failures are surfaced to the caller and never retried by the
    /// replication link itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::NotConnected(_) | Self::Timeout)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Error carried back in a reply. `rusqlite::Error` does not cross the wire, so
/// a remote failure is flattened into its category and message.
#[derive(Debug, Clone, PartialEq, Eq, serde_derive::Serialize, serde_derive::Deserialize)]
pub enum RemoteError {
    NotFound,
    Protocol(String),
    Other(String),
}

impl From<&Error> for RemoteError {
    fn from(error: &Error) -> Self {
        match error {
            Error::NotFound => Self::NotFound,
            Error::Protocol(reason) => Self::Protocol(reason.clone()),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::NotFound => Self::NotFound,
            RemoteError::Protocol(reason) => Self::Protocol(reason),
            RemoteError::Other(reason) => Self::Protocol(format!("remote: {}", reason)),
        }
    }
}
