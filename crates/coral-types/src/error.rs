//! The communication error taxonomy.

use thiserror::Error;

/// Errors that can occur in communication between the distributed parts of
/// the system.
///
/// This is the closed set of failure kinds that cross component boundaries:
/// every asynchronous completion callback in the master, and every
/// operation on the RPC substrate, reports one of these. Local, richer
/// error types (I/O, codec) are classified into this taxonomy at the point
/// where they become another component's problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommError {
    /// No reply arrived within the deadline.
    #[error("operation timed out")]
    TimedOut,

    /// Malformed framing, or a message that is not valid in the current
    /// protocol state.
    #[error("invalid or malformed message: {0}")]
    BadMessage(String),

    /// The remote denied the connection handshake.
    #[error("connection denied by remote")]
    PermissionDenied,

    /// The remote explicitly refused the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The remote does not support the requested protocol or version.
    #[error("protocol not supported")]
    ProtocolNotSupported,

    /// The remote received and understood the request, but could not
    /// perform it.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// The operation was cancelled locally.
    #[error("operation aborted")]
    Aborted,

    /// The remote reported an unrecoverable error; the connection is gone.
    #[error("fatal error reported by remote: {0}")]
    Fatal(String),

    /// Not all subscribed variable values arrived within the data timeout.
    /// Non-fatal; the caller may retry.
    #[error("timed out waiting for variable data")]
    DataTimeout,

    /// The slave could not carry out the requested time step.
    #[error("slave failed to perform the time step")]
    CannotPerformTimestep,

    /// A background communication thread has died; the original cause is
    /// carried along.
    #[error("communication thread is dead: {0}")]
    ThreadDead(String),
}

impl CommError {
    /// Returns true if this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CommError::Fatal(_) | CommError::BadMessage(_) | CommError::ThreadDead(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_classification() {
        assert!(CommError::Fatal("x".into()).is_fatal());
        assert!(CommError::BadMessage("y".into()).is_fatal());
        assert!(!CommError::TimedOut.is_fatal());
        assert!(!CommError::DataTimeout.is_fatal());
        assert!(!CommError::OperationFailed("z".into()).is_fatal());
    }

    #[test]
    fn display_is_descriptive() {
        assert_eq!(CommError::TimedOut.to_string(), "operation timed out");
        assert_eq!(
            CommError::ThreadDead("boom".into()).to_string(),
            "communication thread is dead: boom"
        );
    }
}
