//! Per-connection protocol state.

use std::io;

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::frame::{self, Frame};
use crate::protocol::handshake::{HandshakeResponse, HeaderMap, HttpRequest, header_complete};

/// Bytes pulled off the socket per readiness event.
pub const READ_CHUNK: usize = 8192;

/// Largest header block accepted before the handshake is abandoned.
pub const MAX_HANDSHAKE_SIZE: usize = 8192;

/// Largest inbound frame, header included, a connection will buffer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// What one pass over the receive buffer produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Not enough bytes yet.
    Pending,
    /// A frame with an empty payload was consumed.
    Empty,
    /// The upgrade response was just sent.
    Upgraded,
    /// One decoded application payload.
    Message(Vec<u8>),
}

/// State kept for one accepted socket: the socket itself, whether the
/// upgrade has completed, and the bytes received but not yet consumed.
///
/// Each connection tracks its own handshake; nothing here is shared.
#[derive(Debug)]
pub struct ConnectionState {
    connection: Connection,
    handshake_done: bool,
    recv_buf: BytesMut,
}

impl ConnectionState {
    /// Start tracking a freshly accepted connection.
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            handshake_done: false,
            recv_buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Returns `true` once the upgrade response has been sent.
    #[must_use]
    pub const fn handshake_done(&self) -> bool {
        self.handshake_done
    }

    /// The wrapped connection.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Bytes received and not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.recv_buf
    }

    /// Append bytes to the receive buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.recv_buf.extend_from_slice(data);
    }

    /// Read what the socket has available into the receive buffer.
    ///
    /// Returns the number of bytes read; 0 means the peer closed.
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.connection.read(&mut chunk)?;
        self.recv_buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Answer the upgrade request held in the receive buffer.
    ///
    /// Returns `Ok(false)` without touching the socket if the handshake has
    /// already completed or the header block is not complete yet.
    ///
    /// # Errors
    ///
    /// - [`Error::Handshake`] if the request is unparsable, lacks
    ///   `Sec-WebSocket-Key`, or exceeds [`MAX_HANDSHAKE_SIZE`]
    /// - [`Error::Write`] if the response could not be sent
    pub fn handshake(&mut self, response_headers: &HeaderMap) -> Result<bool> {
        if self.handshake_done {
            return Ok(false);
        }
        if !header_complete(&self.recv_buf) {
            if self.recv_buf.len() > MAX_HANDSHAKE_SIZE {
                return Err(Error::Handshake(format!(
                    "Header block exceeds {MAX_HANDSHAKE_SIZE} bytes"
                )));
            }
            return Ok(false);
        }

        let head = header_len(&self.recv_buf);
        let request = HttpRequest::parse(&self.recv_buf[..head])?;
        let consumed = head.saturating_add(request.content_length);
        if self.recv_buf.len() < consumed {
            if consumed > MAX_HANDSHAKE_SIZE {
                return Err(Error::Handshake(format!(
                    "Declared body exceeds {MAX_HANDSHAKE_SIZE} bytes"
                )));
            }
            return Ok(false);
        }

        let response = HandshakeResponse::from_request(&request, response_headers)?;
        self.connection.send_raw(&response.to_bytes()?)?;
        self.handshake_done = true;

        debug!(
            conn = self.connection.id(),
            target = %request.target,
            "handshake complete"
        );

        self.recv_buf.advance(consumed);
        Ok(true)
    }

    /// Make one step of progress on the receive buffer.
    ///
    /// Before the upgrade this attempts the handshake. Afterwards it waits
    /// until the frame at the front of the buffer has fully arrived, decodes
    /// it and leaves whatever follows for the next call.
    ///
    /// # Errors
    ///
    /// - [`Error::FrameTooLarge`] if a frame declares more than
    ///   [`MAX_FRAME_SIZE`] bytes
    /// - see [`ConnectionState::handshake`] before the upgrade
    pub fn process(&mut self, response_headers: &HeaderMap) -> Result<Received> {
        if !self.handshake_done {
            return Ok(if self.handshake(response_headers)? {
                Received::Upgraded
            } else {
                Received::Pending
            });
        }

        let size = match frame::frame_size(&self.recv_buf) {
            Err(Error::IncompleteFrame { .. }) => return Ok(Received::Pending),
            Err(e) => return Err(e),
            Ok(size) => size,
        };
        if size > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                size: size as u64,
                max: MAX_FRAME_SIZE as u64,
            });
        }
        if self.recv_buf.len() < size {
            return Ok(Received::Pending);
        }

        let raw = self.recv_buf.split_to(size);
        let decoded = Frame::decode(&raw)?;

        debug!(
            conn = self.connection.id(),
            opcode = %decoded.opcode,
            len = decoded.payload().len(),
            "frame decoded"
        );

        let payload = decoded.into_payload();
        if payload.is_empty() {
            Ok(Received::Empty)
        } else {
            Ok(Received::Message(payload))
        }
    }

    /// Consume the state, returning the connection.
    #[must_use]
    pub fn into_connection(self) -> Connection {
        self.connection
    }
}

fn header_len(buf: &[u8]) -> usize {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map_or(buf.len(), |pos| pos + 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{FrameMode, encode_masked};
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    const REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    fn state_pair() -> (ConnectionState, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let conn = Connection::new(1, server, FrameMode::Chunked);
        (ConnectionState::new(conn), client)
    }

    fn read_response(client: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).unwrap();
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_handshake_once() {
        let (mut state, mut client) = state_pair();
        let headers = HeaderMap::new();
        state.extend(REQUEST);

        assert_eq!(state.process(&headers).unwrap(), Received::Upgraded);
        assert!(state.handshake_done());
        assert!(state.buffered().is_empty());

        let response = read_response(&mut client);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        // Repeated call is a no-op.
        assert!(!state.handshake(&headers).unwrap());
    }

    #[test]
    fn test_partial_request_waits() {
        let (mut state, _client) = state_pair();
        let headers = HeaderMap::new();
        state.extend(&REQUEST[..20]);
        assert_eq!(state.process(&headers).unwrap(), Received::Pending);
        assert!(!state.handshake_done());

        state.extend(&REQUEST[20..]);
        assert_eq!(state.process(&headers).unwrap(), Received::Upgraded);
    }

    #[test]
    fn test_missing_key_fails() {
        let (mut state, _client) = state_pair();
        state.extend(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let result = state.process(&HeaderMap::new());
        assert!(matches!(result, Err(Error::Handshake(_))));
        assert!(!state.handshake_done());
    }

    #[test]
    fn test_oversized_handshake_fails() {
        let (mut state, _client) = state_pair();
        state.extend(&vec![b'a'; MAX_HANDSHAKE_SIZE + 1]);
        let result = state.process(&HeaderMap::new());
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[test]
    fn test_frame_after_handshake_in_same_read() {
        let (mut state, _client) = state_pair();
        let headers = HeaderMap::new();
        state.extend(REQUEST);
        state.extend(&encode_masked(b"ping", [0x01, 0x02, 0x03, 0x04]));

        assert_eq!(state.process(&headers).unwrap(), Received::Upgraded);
        assert_eq!(
            state.process(&headers).unwrap(),
            Received::Message(b"ping".to_vec())
        );
        assert_eq!(state.process(&headers).unwrap(), Received::Pending);
    }

    #[test]
    fn test_partial_frame_header_waits() {
        let (mut state, _client) = state_pair();
        let headers = HeaderMap::new();
        state.extend(REQUEST);
        state.process(&headers).unwrap();

        let frame = encode_masked(b"hello", [5, 6, 7, 8]);
        state.extend(&frame[..3]);
        assert_eq!(state.process(&headers).unwrap(), Received::Pending);
        state.extend(&frame[3..]);
        assert_eq!(
            state.process(&headers).unwrap(),
            Received::Message(b"hello".to_vec())
        );
    }

    #[test]
    fn test_empty_payload_is_consumed() {
        let (mut state, _client) = state_pair();
        let headers = HeaderMap::new();
        state.extend(REQUEST);
        state.process(&headers).unwrap();
        state.extend(&encode_masked(b"", [1, 2, 3, 4]));
        state.extend(&encode_masked(b"after", [1, 2, 3, 4]));
        assert_eq!(state.process(&headers).unwrap(), Received::Empty);
        assert_eq!(
            state.process(&headers).unwrap(),
            Received::Message(b"after".to_vec())
        );
        assert!(state.buffered().is_empty());
    }

    #[test]
    fn test_frame_split_after_mask_is_delivered_whole() {
        let (mut state, _client) = state_pair();
        let headers = HeaderMap::new();
        state.extend(REQUEST);
        state.process(&headers).unwrap();

        let hello = encode_masked(b"hello", [1, 2, 3, 4]);
        state.extend(&hello[..8]);
        assert_eq!(state.process(&headers).unwrap(), Received::Pending);
        assert_eq!(state.buffered().len(), 8);

        state.extend(&hello[8..]);
        assert_eq!(
            state.process(&headers).unwrap(),
            Received::Message(b"hello".to_vec())
        );

        // The next frame still decodes cleanly.
        state.extend(&encode_masked(b"ping", [1, 2, 3, 4]));
        assert_eq!(
            state.process(&headers).unwrap(),
            Received::Message(b"ping".to_vec())
        );
        assert!(state.buffered().is_empty());
    }

    #[test]
    fn test_back_to_back_frames_in_one_read() {
        let (mut state, _client) = state_pair();
        let headers = HeaderMap::new();
        state.extend(REQUEST);
        state.process(&headers).unwrap();

        let mut batch = encode_masked(b"one", [9, 9, 9, 9]);
        batch.extend_from_slice(&encode_masked(&vec![b'x'; 300], [4, 3, 2, 1]));
        batch.extend_from_slice(&encode_masked(b"three", [7, 7, 7, 7])[..4]);
        state.extend(&batch);

        assert_eq!(
            state.process(&headers).unwrap(),
            Received::Message(b"one".to_vec())
        );
        assert_eq!(
            state.process(&headers).unwrap(),
            Received::Message(vec![b'x'; 300])
        );
        assert_eq!(state.process(&headers).unwrap(), Received::Pending);
        assert_eq!(state.buffered().len(), 4);
    }

    #[test]
    fn test_oversized_frame_fails() {
        let (mut state, _client) = state_pair();
        let headers = HeaderMap::new();
        state.extend(REQUEST);
        state.process(&headers).unwrap();

        let mut header = vec![0x81, 0x80 | 127];
        header.extend_from_slice(&(MAX_FRAME_SIZE as u64).to_be_bytes());
        header.extend_from_slice(&[1, 2, 3, 4]);
        state.extend(&header);
        assert!(matches!(
            state.process(&headers),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_handshake_waits_for_declared_body() {
        let (mut state, _client) = state_pair();
        let headers = HeaderMap::new();
        let head = b"GET /chat HTTP/1.1\r\n\
            Host: localhost\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Content-Length: 4\r\n\
            \r\n";
        state.extend(head);
        state.extend(b"bo");
        assert_eq!(state.process(&headers).unwrap(), Received::Pending);
        assert!(!state.handshake_done());

        state.extend(b"dy");
        state.extend(&encode_masked(b"ping", [1, 2, 3, 4]));
        assert_eq!(state.process(&headers).unwrap(), Received::Upgraded);
        assert_eq!(
            state.process(&headers).unwrap(),
            Received::Message(b"ping".to_vec())
        );
    }
}
