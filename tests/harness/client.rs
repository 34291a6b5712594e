//! Blocking WebSocket test client.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use wspool::protocol::frame::encode_masked;
use wspool::protocol::handshake::client_request;
use wspool::protocol::mask::random_mask;
use wspool::protocol::{HandshakeResponse, compute_accept_key, generate_key};

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// A connected, upgraded client.
pub struct TestClient {
    stream: TcpStream,
    response: HandshakeResponse,
}

impl TestClient {
    /// Connect and complete the upgrade handshake.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::upgrade(stream, &addr.to_string())
    }

    /// Complete the handshake on an already connected stream.
    pub fn upgrade(mut stream: TcpStream, host: &str) -> io::Result<Self> {
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.set_nodelay(true)?;

        let key = generate_key().map_err(|e| invalid(e.to_string()))?;
        stream.write_all(&client_request(host, "/", &key))?;

        let head = read_head(&mut stream)?;
        let response = HandshakeResponse::parse(&head).map_err(|e| invalid(e.to_string()))?;
        if response.accept != compute_accept_key(&key) {
            return Err(invalid(format!("bad accept value {}", response.accept)));
        }
        Ok(Self { stream, response })
    }

    /// The parsed upgrade response.
    pub fn response(&self) -> &HandshakeResponse {
        &self.response
    }

    /// Send `payload` as one masked text frame with a random mask.
    pub fn send_text(&mut self, payload: &[u8]) -> io::Result<()> {
        let mask = random_mask().map_err(|e| invalid(e.to_string()))?;
        self.send_masked(payload, mask)
    }

    /// Send `payload` as one masked text frame with `mask`.
    pub fn send_masked(&mut self, payload: &[u8], mask: [u8; 4]) -> io::Result<()> {
        self.stream.write_all(&encode_masked(payload, mask))
    }

    /// Write `bytes` as-is, e.g. part of a frame.
    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    /// Read one unmasked server frame, returning its payload.
    pub fn recv_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header)?;
        if header[0] != 0x81 {
            return Err(invalid(format!("unexpected first byte {:#04x}", header[0])));
        }
        if header[1] & 0x80 != 0 {
            return Err(invalid("server frame is masked"));
        }
        let len = match header[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext)?;
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext)?;
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Read frames until `len` payload bytes have arrived.
    ///
    /// Returns the concatenated payload and the number of frames read.
    pub fn recv_message(&mut self, len: usize) -> io::Result<(Vec<u8>, usize)> {
        let mut message = Vec::with_capacity(len);
        let mut frames = 0;
        while message.len() < len || frames == 0 {
            message.extend_from_slice(&self.recv_frame()?);
            frames += 1;
        }
        Ok((message, frames))
    }

    /// Returns `true` once the server has closed the connection.
    pub fn is_closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte), Ok(0))
    }

    /// Close the connection from the client side.
    pub fn shutdown(self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

fn read_head(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "closed during handshake",
            ));
        }
        head.push(byte[0]);
    }
    Ok(head)
}
