//! Messaging substrate error types.

use coral_types::CommError;
use thiserror::Error;

/// Result type for substrate operations.
pub type NetResult<T> = Result<T, NetError>;

/// Errors that can occur in the messaging substrate.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame or message on the wire.
    #[error("malformed frame: {0}")]
    Frame(String),

    /// An endpoint string that could not be parsed or resolved.
    #[error("invalid endpoint \"{0}\": {1}")]
    InvalidEndpoint(String, String),

    /// An operation that requires a connection was attempted without one.
    #[error("socket is not connected")]
    NotConnected,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A reply was requested but there is no pending request to reply to.
    #[error("no pending request to reply to")]
    NoPendingRequest,

    /// The background communication thread is dead.
    #[error("communication thread is dead: {0}")]
    ThreadDead(String),
}

impl From<NetError> for CommError {
    /// Classifies a substrate error into the cross-component taxonomy.
    fn from(e: NetError) -> Self {
        match e {
            NetError::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
                CommError::ConnectionRefused(io.to_string())
            }
            NetError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => CommError::TimedOut,
            NetError::Frame(m) => CommError::BadMessage(m),
            NetError::ConnectionClosed => CommError::BadMessage("connection closed".to_string()),
            NetError::ThreadDead(cause) => CommError::ThreadDead(cause),
            other => CommError::OperationFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_refused_maps_to_connection_refused() {
        let e = NetError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "nope"));
        assert!(matches!(CommError::from(e), CommError::ConnectionRefused(_)));
    }

    #[test]
    fn frame_error_maps_to_bad_message() {
        let e = NetError::Frame("short header".into());
        assert!(matches!(CommError::from(e), CommError::BadMessage(_)));
    }

    #[test]
    fn thread_death_carries_cause() {
        let e = NetError::ThreadDead("panicked".into());
        assert_eq!(
            CommError::from(e),
            CommError::ThreadDead("panicked".into())
        );
    }
}
