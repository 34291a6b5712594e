use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::frame::{FrameMode, encode_with};

/// Largest slice handed to a single `write(2)`.
pub const WRITE_CHUNK: usize = 8192;

/// One accepted client socket.
///
/// Callbacks receive a `&mut Connection` and may [`send`](Connection::send)
/// text back or ask for the connection to be [`close`](Connection::close)d.
/// The socket stays in blocking mode, so a send to a slow peer suspends the
/// whole worker until the kernel accepts the bytes.
///
/// ## Example
///
/// ```rust,ignore
/// let callbacks = Callbacks::new().on_message(|conn: &mut Connection, payload: &[u8]| {
///     if let Err(e) = conn.send(payload) {
///         tracing::warn!("echo to {:?} failed: {e}", conn.peer_addr());
///     }
/// });
/// ```
#[derive(Debug)]
pub struct Connection {
    id: usize,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    frame_mode: FrameMode,
    close_requested: bool,
}

impl Connection {
    /// Wrap an accepted stream.
    #[must_use]
    pub fn new(id: usize, stream: TcpStream, frame_mode: FrameMode) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            id,
            stream,
            peer,
            frame_mode,
            close_requested: false,
        }
    }

    /// Identifier of this connection within its worker.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Remote address, if the socket could report it at accept time.
    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Encode `text` as text frame(s) and write them to the peer.
    ///
    /// Returns the number of bytes written to the socket (frame headers
    /// included).
    ///
    /// ## Errors
    ///
    /// Returns [`Error::Write`] if the socket rejects a write (for example a
    /// broken pipe) or accepts zero bytes.
    pub fn send(&mut self, text: impl AsRef<[u8]>) -> Result<usize> {
        let encoded = encode_with(text.as_ref(), self.frame_mode);
        self.write_all_chunked(&encoded)
    }

    /// Write bytes that are already framed (used for the handshake response).
    pub(crate) fn send_raw(&mut self, bytes: &[u8]) -> Result<usize> {
        self.write_all_chunked(bytes)
    }

    fn write_all_chunked(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < bytes.len() {
            let end = (written + WRITE_CHUNK).min(bytes.len());
            match self.stream.write(&bytes[written..end]) {
                Ok(0) => {
                    return Err(Error::Write(format!(
                        "short write: {written} of {} bytes",
                        bytes.len()
                    )));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Write(e.to_string())),
            }
        }
        trace!(conn = self.id, bytes = written, "sent");
        Ok(written)
    }

    /// Ask the event loop to close this connection once the current
    /// callback returns.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    /// Returns `true` once [`close`](Connection::close) has been called.
    #[must_use]
    pub const fn is_close_requested(&self) -> bool {
        self.close_requested
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    pub(crate) fn shutdown(&self) {
        // The peer may already be gone; the fd is released on drop either way.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
