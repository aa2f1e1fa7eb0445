//! Protocol codec errors.

use coral_types::CommError;
use thiserror::Error;

/// Result type for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors arising while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A header frame that does not parse.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A message type value not known to this protocol version.
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    /// The message does not belong to the expected protocol.
    #[error("wrong protocol identifier")]
    WrongProtocol,

    /// Body serialization failure.
    #[error("body codec error: {0}")]
    Codec(#[from] postcard::Error),
}

impl From<ProtocolError> for CommError {
    fn from(e: ProtocolError) -> Self {
        CommError::BadMessage(e.to_string())
    }
}
