//! Framed connection state shared by the socket roles.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::framing::{encode_message, try_decode_message, Message};
use crate::error::NetResult;

const READ_CHUNK: usize = 4096;
const INITIAL_BUFFER: usize = 8 * 1024;

/// One framed TCP connection: read/write buffers plus a queue of fully
/// decoded inbound messages.
pub(crate) struct Conn {
    pub(crate) token: Token,
    pub(crate) stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    inbox: VecDeque<Message>,
}

impl Conn {
    pub(crate) fn new(token: Token, stream: TcpStream) -> Self {
        Self {
            token,
            stream,
            read_buf: BytesMut::with_capacity(INITIAL_BUFFER),
            write_buf: BytesMut::with_capacity(INITIAL_BUFFER),
            inbox: VecDeque::new(),
        }
    }

    /// Reads all available data and decodes complete messages into the
    /// inbox.
    ///
    /// Returns `Ok(false)` if the peer has closed the connection.
    pub(crate) fn read_ready(&mut self) -> NetResult<bool> {
        let mut temp = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut temp) {
                Ok(0) => {
                    self.decode_all()?;
                    return Ok(false);
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&temp[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.decode_all()?;
        Ok(true)
    }

    fn decode_all(&mut self) -> NetResult<()> {
        while let Some(message) = try_decode_message(&mut self.read_buf)? {
            self.inbox.push_back(message);
        }
        Ok(())
    }

    /// Pops the next fully received message, if any.
    pub(crate) fn try_recv(&mut self) -> Option<Message> {
        self.inbox.pop_front()
    }

    /// Queues a message and attempts to flush it.
    pub(crate) fn send(&mut self, message: &Message) -> NetResult<()> {
        encode_message(message, &mut self.write_buf);
        self.flush()?;
        Ok(())
    }

    /// Writes as much of the write buffer as the socket will take.
    ///
    /// Returns `Ok(true)` when the buffer has been fully drained.
    pub(crate) fn flush(&mut self) -> NetResult<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    )
                    .into());
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Number of bytes queued but not yet written.
    pub(crate) fn pending_write(&self) -> usize {
        self.write_buf.len()
    }

    /// The poll interest appropriate for the connection's current state.
    pub(crate) fn interest(&self) -> Interest {
        if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }
}
