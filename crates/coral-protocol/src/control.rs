//! The master↔slave control protocol.
//!
//! The control protocol is an instance of the generic request/reply wire
//! layout: frame 1 is the protocol identifier `"DSE"` followed by the
//! protocol version (`u16` little-endian); frame 2 is the message header,
//! here just the message type (`u16` little-endian); messages with
//! structured payloads carry a third, postcard-encoded body frame. The
//! body schemas here are the compatibility surface with deployed slaves
//! and must not change shape.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use coral_net::Message;
use coral_types::{SlaveId, SlaveTypeDescription, StepId, VariableSetting};

use crate::error::{ProtocolError, ProtocolResult};

/// Protocol identifier, first bytes of every control message.
pub const PROTOCOL_MAGIC: &[u8; 3] = b"DSE";

/// The highest control-protocol version this implementation speaks.
pub const MAX_PROTOCOL_VERSION: u16 = 0;

const ID_FRAME_SIZE: usize = 5;
const TYPE_FRAME_SIZE: usize = 2;

/// Control message types, as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Hello = 0,
    Denied = 1,
    Setup = 2,
    Ready = 3,
    Step = 4,
    StepOk = 5,
    StepFailed = 6,
    AcceptStep = 7,
    SetVars = 8,
    SetPeers = 9,
    Describe = 10,
    ResendVars = 11,
    Terminate = 12,
    Error = 13,
    FatalError = 14,
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, ProtocolError> {
        use MessageType::{
            AcceptStep, Denied, Describe, Error, FatalError, Hello, Ready, ResendVars, SetPeers,
            SetVars, Setup, Step, StepFailed, StepOk, Terminate,
        };
        Ok(match value {
            0 => Hello,
            1 => Denied,
            2 => Setup,
            3 => Ready,
            4 => Step,
            5 => StepOk,
            6 => StepFailed,
            7 => AcceptStep,
            8 => SetVars,
            9 => SetPeers,
            10 => Describe,
            11 => ResendVars,
            12 => Terminate,
            13 => Error,
            14 => FatalError,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

// ============================================================================
// Body structs: wire compatibility surface
// ============================================================================

/// Payload of SETUP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupData {
    pub slave_id: SlaveId,
    pub start_time: f64,
    /// Absent means "no stop time" (+∞).
    pub stop_time: Option<f64>,
    /// Endpoint the slave should publish variable data on, as a URL.
    /// Empty means "bind where you like and I'll ask".
    pub variable_pub_endpoint: String,
    /// Endpoint the slave should subscribe on, as a URL. Usually empty;
    /// peers arrive later via SET_PEERS.
    pub variable_sub_endpoint: String,
    pub execution_name: String,
    pub slave_name: String,
    /// Budget for the per-step input barrier.
    pub variable_recv_timeout_ms: i32,
}

/// Payload of STEP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    pub step_id: StepId,
    pub timepoint: f64,
    pub stepsize: f64,
}

/// Payload of SET_VARS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetVarsData {
    pub variables: Vec<VariableSetting>,
}

/// Payload of SET_PEERS: the full replacement set of publisher endpoints,
/// as URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPeersData {
    pub peers: Vec<String>,
}

/// Error codes carried in ERROR and FATAL_ERROR payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unspecified,
    /// One or more variable values could not be set; non-fatal.
    CannotSetVariable,
    /// The input barrier timed out; non-fatal, may be retried.
    TimedOut,
}

/// Payload of ERROR and FATAL_ERROR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub detail: String,
}

// ============================================================================
// Messages
// ============================================================================

/// A decoded control message.
///
/// `Description` is the READY message type with a body; a DESCRIBE request
/// is answered with it.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMsg {
    /// Connection handshake. In a request, `version` is the highest
    /// protocol version the client supports; in the reply, the version
    /// the server grants (the highest it supports that is not above the
    /// request's).
    Hello { version: u16 },
    Denied,
    Setup(SetupData),
    Ready,
    Description(SlaveTypeDescription),
    Step(StepData),
    StepOk,
    StepFailed,
    AcceptStep,
    SetVars(SetVarsData),
    SetPeers(SetPeersData),
    Describe,
    ResendVars,
    Terminate,
    Error(ErrorInfo),
    FatalError(ErrorInfo),
}

impl ControlMsg {
    /// The wire message type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            ControlMsg::Hello { .. } => MessageType::Hello,
            ControlMsg::Denied => MessageType::Denied,
            ControlMsg::Setup(_) => MessageType::Setup,
            ControlMsg::Ready | ControlMsg::Description(_) => MessageType::Ready,
            ControlMsg::Step(_) => MessageType::Step,
            ControlMsg::StepOk => MessageType::StepOk,
            ControlMsg::StepFailed => MessageType::StepFailed,
            ControlMsg::AcceptStep => MessageType::AcceptStep,
            ControlMsg::SetVars(_) => MessageType::SetVars,
            ControlMsg::SetPeers(_) => MessageType::SetPeers,
            ControlMsg::Describe => MessageType::Describe,
            ControlMsg::ResendVars => MessageType::ResendVars,
            ControlMsg::Terminate => MessageType::Terminate,
            ControlMsg::Error(_) => MessageType::Error,
            ControlMsg::FatalError(_) => MessageType::FatalError,
        }
    }

    /// Encodes the message at a given protocol version.
    pub fn encode(&self, version: u16) -> ProtocolResult<Message> {
        let id_frame = encode_id_frame(version);
        let mut type_frame = BytesMut::with_capacity(TYPE_FRAME_SIZE);
        type_frame.put_u16_le(self.message_type() as u16);

        let body: Option<Vec<u8>> = match self {
            // The handshake body is raw little-endian, not postcard, so
            // that it can be negotiated before any version is agreed on.
            ControlMsg::Hello { version } => Some(version.to_le_bytes().to_vec()),
            ControlMsg::Setup(d) => Some(postcard::to_allocvec(d)?),
            ControlMsg::Description(d) => Some(postcard::to_allocvec(d)?),
            ControlMsg::Step(d) => Some(postcard::to_allocvec(d)?),
            ControlMsg::SetVars(d) => Some(postcard::to_allocvec(d)?),
            ControlMsg::SetPeers(d) => Some(postcard::to_allocvec(d)?),
            ControlMsg::Error(d) | ControlMsg::FatalError(d) => Some(postcard::to_allocvec(d)?),
            _ => None,
        };

        let mut message = vec![id_frame, type_frame.freeze()];
        if let Some(body) = body {
            message.push(Bytes::from(body));
        }
        Ok(message)
    }

    /// Decodes a message, returning the header's protocol version along
    /// with it.
    pub fn decode(message: &Message) -> ProtocolResult<(u16, ControlMsg)> {
        let (version, message_type) = parse_header(message)?;
        let body = message.get(2);
        let require_body = || {
            body.ok_or_else(|| {
                ProtocolError::Malformed(format!("{message_type:?} requires a body frame"))
            })
        };

        let msg = match message_type {
            MessageType::Hello => {
                let body = require_body()?;
                if body.len() != 2 {
                    return Err(ProtocolError::Malformed(
                        "HELLO body must be two bytes".to_string(),
                    ));
                }
                ControlMsg::Hello {
                    version: u16::from_le_bytes([body[0], body[1]]),
                }
            }
            MessageType::Denied => ControlMsg::Denied,
            MessageType::Setup => ControlMsg::Setup(postcard::from_bytes(require_body()?)?),
            MessageType::Ready => match body {
                Some(b) => ControlMsg::Description(postcard::from_bytes(b)?),
                None => ControlMsg::Ready,
            },
            MessageType::Step => ControlMsg::Step(postcard::from_bytes(require_body()?)?),
            MessageType::StepOk => ControlMsg::StepOk,
            MessageType::StepFailed => ControlMsg::StepFailed,
            MessageType::AcceptStep => ControlMsg::AcceptStep,
            MessageType::SetVars => ControlMsg::SetVars(postcard::from_bytes(require_body()?)?),
            MessageType::SetPeers => ControlMsg::SetPeers(postcard::from_bytes(require_body()?)?),
            MessageType::Describe => ControlMsg::Describe,
            MessageType::ResendVars => ControlMsg::ResendVars,
            MessageType::Terminate => ControlMsg::Terminate,
            MessageType::Error => ControlMsg::Error(postcard::from_bytes(require_body()?)?),
            MessageType::FatalError => ControlMsg::FatalError(postcard::from_bytes(require_body()?)?),
        };
        Ok((version, msg))
    }
}

/// Packs a control identifier frame: the protocol magic plus a version.
pub fn encode_id_frame(version: u16) -> Bytes {
    let mut frame = BytesMut::with_capacity(ID_FRAME_SIZE);
    frame.put_slice(PROTOCOL_MAGIC);
    frame.put_u16_le(version);
    frame.freeze()
}

/// Parses the identifier and type frames of a control message.
pub fn parse_header(message: &Message) -> ProtocolResult<(u16, MessageType)> {
    let id_frame = message
        .first()
        .ok_or_else(|| ProtocolError::Malformed("empty message".to_string()))?;
    if id_frame.len() != ID_FRAME_SIZE {
        return Err(ProtocolError::Malformed(format!(
            "control identifier frame must be {ID_FRAME_SIZE} bytes, got {}",
            id_frame.len()
        )));
    }
    if &id_frame[..3] != PROTOCOL_MAGIC {
        return Err(ProtocolError::WrongProtocol);
    }
    let version = u16::from_le_bytes([id_frame[3], id_frame[4]]);

    let type_frame = message.get(1).ok_or_else(|| {
        ProtocolError::Malformed("control message is missing its type frame".to_string())
    })?;
    if type_frame.len() != TYPE_FRAME_SIZE {
        return Err(ProtocolError::Malformed(format!(
            "control type frame must be {TYPE_FRAME_SIZE} bytes, got {}",
            type_frame.len()
        )));
    }
    let message_type = MessageType::try_from(u16::from_le_bytes([type_frame[0], type_frame[1]]))?;
    Ok((version, message_type))
}

/// Splits a control message into the generic request/reply shape:
/// version, header bytes (the type frame), and optional body.
pub fn to_rpc_parts(message: &Message) -> ProtocolResult<(u16, Bytes, Option<Bytes>)> {
    let (version, _) = parse_header(message)?;
    Ok((version, message[1].clone(), message.get(2).cloned()))
}
