//! WebSocket frame decoding and encoding (RFC 6455 subset).
//!
//! Inbound frames are assumed to be single, masked client frames. The decoder
//! locates the masking key from the length class in the second header byte
//! and unmasks everything after it; the extended length field itself is not
//! read, so a buffer holding more (or less) than the declared payload is
//! decoded as-is. Callers that buffer a byte stream use [`frame_size`] to
//! cut exactly one frame off the front before decoding it.
//!
//! Outbound frames are never masked. In [`FrameMode::Chunked`] a payload is
//! split into independent text frames of at most 125 bytes, each with a
//! single length byte; receivers must join the chunks themselves. In
//! [`FrameMode::Extended`] the payload goes out as one frame carrying a
//! 16-bit or 64-bit extended length.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |                     Masking key (client frames)               |
//! +---------------------------------------------------------------+
//! |                     Payload data                              |
//! +---------------------------------------------------------------+
//! ```

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::protocol::OpCode;
use crate::protocol::mask::apply_mask;

/// Largest payload a single-length-byte frame can carry.
pub const MAX_CHUNK_PAYLOAD: usize = 125;

/// First header byte of every frame this server sends: FIN=1, opcode=text.
pub const TEXT_FRAME_HEADER: u8 = 0x80 | 0x1;

/// How outbound payloads are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameMode {
    /// Split into independent text frames of at most 125 bytes each.
    #[default]
    Chunked,
    /// One text frame, using the 16/64-bit extended length when needed.
    Extended,
}

/// Payload length class carried in the low 7 bits of the second header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthClass {
    /// Length fits in 7 bits (0..=125).
    Short(u8),
    /// 16-bit extended length at offsets 2..4.
    Extended16,
    /// 64-bit extended length at offsets 2..10.
    Extended64,
}

impl LengthClass {
    /// Classify from the second header byte (the mask bit is ignored).
    #[inline]
    #[must_use]
    pub const fn from_byte(byte1: u8) -> Self {
        match byte1 & 0x7F {
            126 => LengthClass::Extended16,
            127 => LengthClass::Extended64,
            n => LengthClass::Short(n),
        }
    }

    /// Offset of the 4-byte masking key.
    #[inline]
    #[must_use]
    pub const fn mask_offset(self) -> usize {
        match self {
            LengthClass::Short(_) => 2,
            LengthClass::Extended16 => 4,
            LengthClass::Extended64 => 10,
        }
    }

    /// Offset of the first payload byte.
    #[inline]
    #[must_use]
    pub const fn payload_offset(self) -> usize {
        self.mask_offset() + 4
    }
}

/// A decoded client-to-server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag, as sent. Not acted upon.
    pub fin: bool,
    /// Opcode, as sent. Not validated.
    pub opcode: OpCode,
    /// Length class from the second header byte.
    pub length_class: LengthClass,
    /// Masking key the payload was unmasked with.
    pub mask: [u8; 4],
    payload: Vec<u8>,
}

impl Frame {
    /// Decode a masked client frame from the start of `buf`.
    ///
    /// Every byte after the masking key is treated as payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompleteFrame`] if `buf` ends before the masking key
    /// does.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let payload_offset = payload_offset(buf)?;
        let length_class = LengthClass::from_byte(buf[1]);
        let mo = length_class.mask_offset();
        let mask = [buf[mo], buf[mo + 1], buf[mo + 2], buf[mo + 3]];

        let mut payload = buf[payload_offset..].to_vec();
        apply_mask(&mut payload, mask);

        Ok(Self {
            fin: buf[0] & 0x80 != 0,
            opcode: OpCode::from_u8(buf[0]),
            length_class,
            mask,
            payload,
        })
    }

    /// Get the unmasked payload bytes.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take ownership of the payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Number of bytes before the payload of the frame starting at `buf`.
///
/// # Errors
///
/// Returns [`Error::IncompleteFrame`] if fewer than two bytes are present, or
/// if `buf` ends before the masking key does.
pub fn payload_offset(buf: &[u8]) -> Result<usize> {
    if buf.len() < 2 {
        return Err(Error::IncompleteFrame {
            needed: 2 - buf.len(),
        });
    }
    let offset = LengthClass::from_byte(buf[1]).payload_offset();
    if buf.len() < offset {
        return Err(Error::IncompleteFrame {
            needed: offset - buf.len(),
        });
    }
    Ok(offset)
}

/// Total size on the wire of the frame starting at `buf`, as declared by its
/// header: header bytes, masking key and payload.
///
/// Only the header is needed; the payload may not have arrived yet.
///
/// # Errors
///
/// - [`Error::IncompleteFrame`] if `buf` ends before the masking key does
/// - [`Error::FrameTooLarge`] if the declared length does not fit in memory
pub fn frame_size(buf: &[u8]) -> Result<usize> {
    let offset = payload_offset(buf)?;
    let declared = match LengthClass::from_byte(buf[1]) {
        LengthClass::Short(n) => u64::from(n),
        LengthClass::Extended16 => u64::from(u16::from_be_bytes([buf[2], buf[3]])),
        LengthClass::Extended64 => {
            let mut be = [0u8; 8];
            be.copy_from_slice(&buf[2..10]);
            u64::from_be_bytes(be)
        }
    };
    usize::try_from(declared)
        .ok()
        .and_then(|len| len.checked_add(offset))
        .ok_or(Error::FrameTooLarge {
            size: declared,
            max: usize::MAX as u64,
        })
}

/// Decode a masked client frame and return its payload.
///
/// # Errors
///
/// See [`Frame::decode`].
pub fn decode(buf: &[u8]) -> Result<Vec<u8>> {
    Frame::decode(buf).map(Frame::into_payload)
}

/// Number of chunked frames [`encode`] produces for a payload of `len` bytes.
#[must_use]
pub const fn chunk_count(len: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(MAX_CHUNK_PAYLOAD)
    }
}

/// Encode `payload` as unmasked text frames of at most 125 bytes each.
///
/// An empty payload yields a single empty frame.
#[must_use]
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2 * chunk_count(payload.len()));
    if payload.is_empty() {
        out.extend_from_slice(&[TEXT_FRAME_HEADER, 0]);
        return out;
    }
    for chunk in payload.chunks(MAX_CHUNK_PAYLOAD) {
        out.push(TEXT_FRAME_HEADER);
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    out
}

/// Encode `payload` as one unmasked text frame with an extended length header.
#[must_use]
pub fn encode_extended(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(wire_size(payload.len(), false));
    write_frame(&mut out, TEXT_FRAME_HEADER, payload, None);
    out
}

/// Encode `payload` according to `mode`.
#[must_use]
pub fn encode_with(payload: &[u8], mode: FrameMode) -> Vec<u8> {
    match mode {
        FrameMode::Chunked => encode(payload),
        FrameMode::Extended => encode_extended(payload),
    }
}

/// Encode `payload` as a masked client-to-server text frame.
#[must_use]
pub fn encode_masked(payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(wire_size(payload.len(), true));
    write_frame(&mut out, TEXT_FRAME_HEADER, payload, Some(mask));
    out
}

/// Size on the wire of a single frame carrying `payload_len` bytes.
#[must_use]
pub const fn wire_size(payload_len: usize, masked: bool) -> usize {
    let extended = if payload_len <= MAX_CHUNK_PAYLOAD {
        0
    } else if payload_len <= u16::MAX as usize {
        2
    } else {
        8
    };
    let mask = if masked { 4 } else { 0 };
    2 + extended + mask + payload_len
}

fn write_frame(out: &mut Vec<u8>, byte0: u8, payload: &[u8], mask: Option<[u8; 4]>) {
    let len = payload.len();
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };

    out.push(byte0);
    if len <= MAX_CHUNK_PAYLOAD {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }
}
