//! Multipart message framing over byte streams.
//!
//! A message is an ordered sequence of opaque byte frames. On the wire each
//! frame is a 5-byte header (payload length as `u32` little-endian, then a
//! "more frames follow" flag byte) followed by the payload. A message ends
//! at the first frame whose flag byte is zero.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NetError, NetResult};

/// Size of the per-frame header: length (4) + more flag (1).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Upper bound on a single frame's payload.
///
/// Anything larger is treated as a framing error rather than an allocation
/// request.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// A multipart message: one or more opaque byte frames.
pub type Message = Vec<Bytes>;

/// Encodes a message into a write buffer.
///
/// # Panics
///
/// Panics if `message` is empty; a message has at least one frame.
pub fn encode_message(message: &Message, out: &mut BytesMut) {
    assert!(!message.is_empty(), "a message has at least one frame");
    for (i, frame) in message.iter().enumerate() {
        let more = u8::from(i + 1 < message.len());
        out.put_u32_le(frame.len() as u32);
        out.put_u8(more);
        out.put_slice(frame);
    }
}

/// Attempts to decode one complete message from the front of `buf`.
///
/// Returns `Ok(None)` if the buffer does not yet hold a full message; in
/// that case nothing is consumed. On success the message's bytes are
/// consumed from the buffer.
pub fn try_decode_message(buf: &mut BytesMut) -> NetResult<Option<Message>> {
    // First pass: walk the frame headers without consuming anything, so a
    // partially received message stays in the buffer untouched.
    let mut offset = 0;
    let mut frames = 0;
    loop {
        if buf.len() < offset + FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let len =
            u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
                as usize;
        if len > MAX_FRAME_SIZE {
            return Err(NetError::Frame(format!(
                "frame of {len} bytes exceeds the maximum of {MAX_FRAME_SIZE}"
            )));
        }
        let more = buf[offset + 4];
        if more > 1 {
            return Err(NetError::Frame(format!("invalid frame flag byte {more}")));
        }
        if buf.len() < offset + FRAME_HEADER_SIZE + len {
            return Ok(None);
        }
        offset += FRAME_HEADER_SIZE + len;
        frames += 1;
        if more == 0 {
            break;
        }
    }

    // Second pass: consume.
    let mut message = Vec::with_capacity(frames);
    for _ in 0..frames {
        let len = buf.get_u32_le() as usize;
        let _more = buf.get_u8();
        message.push(buf.split_to(len).freeze());
    }
    Ok(Some(message))
}

/// Prepends a routing envelope (identity frame plus empty delimiter) to a
/// message, so a broker can route it onwards.
pub fn push_envelope(message: &mut Message, identity: Bytes) {
    message.insert(0, Bytes::new());
    message.insert(0, identity);
}

/// Removes and returns the routing envelope from the front of a message.
///
/// The envelope is the leading identity frame and the empty delimiter that
/// follows it. Returns an error if the message does not start with an
/// envelope.
pub fn pop_envelope(message: &mut Message) -> NetResult<Bytes> {
    if message.len() < 2 || !message[1].is_empty() || message[0].is_empty() {
        return Err(NetError::Frame(
            "message does not carry a routing envelope".to_string(),
        ));
    }
    let identity = message.remove(0);
    message.remove(0); // delimiter
    Ok(identity)
}

/// Replaces the routing envelope of a message, returning the old identity.
///
/// This is the broker primitive: pop the sender's identity, push the
/// destination's.
pub fn swap_envelope(message: &mut Message, identity: Bytes) -> NetResult<Bytes> {
    let old = pop_envelope(message)?;
    push_envelope(message, identity);
    Ok(old)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn msg(frames: &[&[u8]]) -> Message {
        frames.iter().map(|f| Bytes::copy_from_slice(f)).collect()
    }

    #[test]
    fn decode_of_partial_message_consumes_nothing() {
        let mut buf = BytesMut::new();
        encode_message(&msg(&[b"hello", b"world"]), &mut buf);
        let full = buf.clone();

        // Chop off the last byte: not decodable, buffer untouched.
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        let before = partial.len();
        assert!(try_decode_message(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), before);
    }

    #[test]
    fn decode_leaves_following_message_in_buffer() {
        let mut buf = BytesMut::new();
        encode_message(&msg(&[b"one"]), &mut buf);
        encode_message(&msg(&[b"two", b""]), &mut buf);

        assert_eq!(try_decode_message(&mut buf).unwrap().unwrap(), msg(&[b"one"]));
        assert_eq!(
            try_decode_message(&mut buf).unwrap().unwrap(),
            msg(&[b"two", b""])
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(u32::MAX);
        buf.put_u8(0);
        assert!(matches!(
            try_decode_message(&mut buf),
            Err(NetError::Frame(_))
        ));
    }

    #[test]
    fn invalid_flag_byte_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        buf.put_u8(7);
        assert!(matches!(
            try_decode_message(&mut buf),
            Err(NetError::Frame(_))
        ));
    }

    #[test]
    fn envelope_push_pop() {
        let mut m = msg(&[b"body"]);
        push_envelope(&mut m, Bytes::from_static(b"id-1"));
        assert_eq!(m.len(), 3);
        let id = pop_envelope(&mut m).unwrap();
        assert_eq!(id, Bytes::from_static(b"id-1"));
        assert_eq!(m, msg(&[b"body"]));
    }

    #[test]
    fn envelope_swap_returns_old_identity() {
        let mut m = msg(&[b"body"]);
        push_envelope(&mut m, Bytes::from_static(b"sender"));
        let old = swap_envelope(&mut m, Bytes::from_static(b"dest")).unwrap();
        assert_eq!(old, Bytes::from_static(b"sender"));
        assert_eq!(pop_envelope(&mut m).unwrap(), Bytes::from_static(b"dest"));
    }

    #[test]
    fn pop_envelope_without_delimiter_fails() {
        let mut m = msg(&[b"id", b"not-empty", b"body"]);
        assert!(pop_envelope(&mut m).is_err());
    }

    proptest! {
        #[test]
        fn encode_decode_round_trip(
            frames in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..512),
                1..6,
            )
        ) {
            let message: Message = frames.iter().map(|f| Bytes::from(f.clone())).collect();
            let mut buf = BytesMut::new();
            encode_message(&message, &mut buf);
            let decoded = try_decode_message(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, message);
            prop_assert!(buf.is_empty());
        }
    }
}
