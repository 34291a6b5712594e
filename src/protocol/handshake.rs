//! WebSocket handshake implementation (RFC 6455).
//!
//! Only enough HTTP/1.1 is parsed to answer an upgrade request: the request
//! line, `Name: Value` header lines up to the first blank line, and a body
//! when one of exactly `Content-Length` bytes follows.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// The WebSocket GUID used in the Sec-WebSocket-Accept calculation (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Content type assumed when a request does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Validate that a header value does not contain CR or LF characters.
///
/// # Errors
/// Returns `Error::InvalidHeaderValue` if the value contains `\r` or `\n`.
fn validate_header_value(header_name: &str, value: &str) -> Result<()> {
    if value.contains('\r') || value.contains('\n') {
        return Err(Error::InvalidHeaderValue {
            header: header_name.to_string(),
            reason: "contains CR or LF characters".to_string(),
        });
    }
    Ok(())
}

/// Computes the Sec-WebSocket-Accept value from the client's Sec-WebSocket-Key.
///
/// The accept key is calculated as: Base64(SHA-1(key + GUID))
///
/// # Example
///
/// ```
/// use wspool::protocol::handshake::compute_accept_key;
///
/// let key = "dGhlIHNhbXBsZSBub25jZQ==";
/// let accept = compute_accept_key(key);
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    BASE64.encode(hash)
}

/// Generate a random Sec-WebSocket-Key (16 random bytes, Base64).
///
/// # Errors
///
/// Returns [`Error::Io`] if the OS random source fails.
pub fn generate_key() -> Result<String> {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce).map_err(|e| Error::Io(e.to_string()))?;
    Ok(BASE64.encode(nonce))
}

/// Returns `true` once `buf` holds a full header block.
#[must_use]
pub fn header_complete(buf: &[u8]) -> bool {
    find_header_end(buf).is_some()
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing the value of an existing header whose name
    /// matches case-insensitively. Insertion order is kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Look up a header value by name, ignoring ASCII case.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// A parsed HTTP request, as far as the upgrade needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method, e.g. `GET`. Empty if the request line was malformed.
    pub method: String,
    /// Request target, e.g. `/chat`.
    pub target: String,
    /// Protocol version, e.g. `HTTP/1.1`.
    pub version: String,
    /// Request headers in arrival order.
    pub headers: HeaderMap,
    /// Declared `Content-Type`, or [`DEFAULT_CONTENT_TYPE`].
    pub content_type: String,
    /// Declared `Content-Length`, or 0.
    pub content_length: usize,
    /// Body bytes, present only when exactly `content_length` bytes follow
    /// the header block.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Parse a request from the bytes read off a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if nothing was read, if the data has no
    /// CRLF-terminated lines, or if no header lines were found.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Handshake("Empty request".into()));
        }

        let (head, rest) = match find_header_end(data) {
            Some(end) => (&data[..end], &data[end..]),
            None => (data, &[][..]),
        };
        let text = String::from_utf8_lossy(head);
        if !text.contains("\r\n") {
            return Err(Error::Handshake("Request has no header lines".into()));
        }

        let mut lines = text.split("\r\n");

        // Request line: "GET /chat HTTP/1.1"
        let (method, target, version) = match lines
            .next()
            .map(|l| l.split(' ').collect::<Vec<_>>())
            .as_deref()
        {
            Some([m, t, v]) => (m.to_string(), t.to_string(), v.to_string()),
            _ => (String::new(), String::new(), String::new()),
        };

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(": ") {
                headers.insert(name, value);
            }
        }

        if headers.is_empty() {
            return Err(Error::Handshake("No request headers".into()));
        }

        let content_type = headers
            .get("Content-Type")
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let content_length = headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        let body = if content_length > 0 && rest.len() == content_length {
            rest.to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            method,
            target,
            version,
            headers,
            content_type,
            content_length,
            body,
        })
    }

    /// The client's `Sec-WebSocket-Key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the header is absent.
    pub fn websocket_key(&self) -> Result<&str> {
        self.headers
            .get("Sec-WebSocket-Key")
            .ok_or_else(|| Error::Handshake("Missing Sec-WebSocket-Key header".into()))
    }
}

/// Build the bytes of a client upgrade request.
#[must_use]
pub fn client_request(host: &str, path: &str, key: &str) -> Vec<u8> {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
    .into_bytes()
}

/// WebSocket handshake response from server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// The Sec-WebSocket-Accept value.
    pub accept: String,
    /// Extra headers appended after the standard ones.
    pub headers: HeaderMap,
}

impl HandshakeResponse {
    /// Create a handshake response for `req`, carrying `custom` headers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the request has no `Sec-WebSocket-Key`.
    pub fn from_request(req: &HttpRequest, custom: &HeaderMap) -> Result<Self> {
        Ok(Self {
            accept: compute_accept_key(req.websocket_key()?),
            headers: custom.clone(),
        })
    }

    /// Write the HTTP response to a buffer.
    ///
    /// # Errors
    /// Returns `Error::InvalidHeaderValue` if a custom header contains CR/LF.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        buf.extend_from_slice(b"Upgrade: websocket\r\n");
        buf.extend_from_slice(b"Connection: Upgrade\r\n");
        buf.extend_from_slice(format!("Sec-WebSocket-Accept: {}\r\n", self.accept).as_bytes());

        for (name, value) in self.headers.iter() {
            validate_header_value(name, name)?;
            validate_header_value(name, value)?;
            buf.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }

        buf.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Serialize the response into a fresh buffer.
    ///
    /// # Errors
    /// See [`HandshakeResponse::write`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);
        self.write(&mut buf)?;
        Ok(buf)
    }

    /// Parse a WebSocket handshake response from raw HTTP data (client side).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if:
    /// - The response is empty or the status line is missing.
    /// - The status code is not `101 Switching Protocols`.
    /// - The `Upgrade` header is not `websocket`.
    /// - `Sec-WebSocket-Accept` is missing.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::Handshake("Invalid UTF-8".into()))?;

        let mut lines = text.split("\r\n");

        let status_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::Handshake("Empty response".into()))?;
        if !status_line.starts_with("HTTP/1.1 101") {
            return Err(Error::Handshake(format!(
                "Expected 101 status, got: {status_line}"
            )));
        }

        let mut accept = None;
        let mut upgrade = None;
        let mut headers = HeaderMap::new();
        for line in lines.take_while(|l| !l.is_empty()) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());
            if name.eq_ignore_ascii_case("Sec-WebSocket-Accept") {
                accept = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("Upgrade") {
                upgrade = Some(value.to_string());
            } else if !name.eq_ignore_ascii_case("Connection") {
                headers.insert(name, value);
            }
        }

        match upgrade {
            Some(u) if u.eq_ignore_ascii_case("websocket") => {}
            Some(u) => return Err(Error::Handshake(format!("Invalid Upgrade header: {u}"))),
            None => return Err(Error::Handshake("Missing Upgrade header in response".into())),
        }

        let accept = accept
            .ok_or_else(|| Error::Handshake("Missing Sec-WebSocket-Accept header".into()))?;

        Ok(Self { accept, headers })
    }
}
