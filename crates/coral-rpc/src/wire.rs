//! Frame packing for the request/reply layout.

use bytes::{BufMut, Bytes, BytesMut};

use coral_net::Message;
use coral_types::CommError;

/// Identifier of the meta protocol every server answers.
pub const META_PROTOCOL_ID: &str = "MP";

/// The meta protocol's only request header.
pub const META_MAX_PROTOCOL_VERSION: &str = "MAX_PROTOCOL_VERSION";

/// Meta reply headers.
pub const META_OK: &str = "OK";
pub const META_ERROR: &str = "ERROR";

/// Meta error body for an unknown protocol.
pub const META_PROTOCOL_NOT_SUPPORTED: &str = "PROTOCOL_NOT_SUPPORTED";

/// Packs the identifier frame: protocol id bytes plus version.
pub fn pack_id_frame(protocol_id: &str, version: u16) -> Bytes {
    let mut frame = BytesMut::with_capacity(protocol_id.len() + 2);
    frame.put_slice(protocol_id.as_bytes());
    frame.put_u16_le(version);
    frame.freeze()
}

/// Splits an identifier frame into protocol id and version.
pub fn unpack_id_frame(frame: &[u8]) -> Result<(&str, u16), CommError> {
    if frame.len() < 3 {
        return Err(CommError::BadMessage(
            "identifier frame too short".to_string(),
        ));
    }
    let (id, version) = frame.split_at(frame.len() - 2);
    let id = std::str::from_utf8(id)
        .map_err(|_| CommError::BadMessage("protocol identifier is not UTF-8".to_string()))?;
    Ok((id, u16::from_le_bytes([version[0], version[1]])))
}

/// Builds a complete request or reply message.
pub fn pack_message(
    protocol_id: &str,
    version: u16,
    header: &[u8],
    body: Option<&[u8]>,
) -> Message {
    let mut message = vec![
        pack_id_frame(protocol_id, version),
        Bytes::copy_from_slice(header),
    ];
    if let Some(body) = body {
        message.push(Bytes::copy_from_slice(body));
    }
    message
}

/// Splits a message into (protocol id, version, header, body).
pub fn unpack_message(message: &Message) -> Result<(&str, u16, &[u8], Option<&[u8]>), CommError> {
    if message.len() < 2 || message.len() > 3 {
        return Err(CommError::BadMessage(format!(
            "request/reply messages have 2 or 3 frames, got {}",
            message.len()
        )));
    }
    let (id, version) = unpack_id_frame(&message[0])?;
    let header = &message[1][..];
    let body = message.get(2).map(|b| &b[..]);
    Ok((id, version, header, body))
}
