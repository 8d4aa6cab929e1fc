use std::sync::Arc;
use thiserror::Error;

/// Main error type for management session operations
///
/// Errors are `Clone` so that a single link failure can be delivered to
/// every request that is waiting on the link.
#[derive(Error, Debug, Clone)]
pub enum MgmtError {
    #[error("Connection error: {0}")]
    Connection(Arc<std::io::Error>),

    #[error("Session not open: {0}")]
    NotOpen(String),

    #[error("Session already open")]
    AlreadyOpen,

    #[error("Multiple listeners waiting for session to close")]
    MultipleWaiters,

    #[error("Timeout while waiting for session to close")]
    CloseTimeout,

    #[error("Timeout")]
    Timeout,

    #[error("Duplicate correlation key: {0}")]
    DuplicateKey(String),

    #[error("No listener for correlation key: {0}")]
    UnknownKey(String),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Decoding error: {0}")]
    Decode(String),

    #[error("Unexpected response status: {0}")]
    UnexpectedStatus(String),

    #[error("Rx aborted")]
    RxAborted,

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl MgmtError {
    /// Whether this error is a transmit timeout
    ///
    /// The command layer uses this to decide whether another attempt is
    /// worthwhile. A close timeout is not a transmit timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MgmtError::Timeout)
    }

    /// Whether this error reports loss of the underlying link
    pub fn is_disconnect(&self) -> bool {
        matches!(self, MgmtError::Disconnected(_))
    }
}

impl From<std::io::Error> for MgmtError {
    fn from(e: std::io::Error) -> Self {
        MgmtError::Connection(Arc::new(e))
    }
}

/// Result type alias for management session operations
pub type MgmtResult<T> = Result<T, MgmtError>;
