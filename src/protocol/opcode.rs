//! WebSocket frame opcodes as defined in RFC 6455.
//!
//! The codec only produces text frames and never rejects an inbound opcode;
//! this type exists so the event loop can name what a peer sent.

/// WebSocket frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Continuation frame (0x0).
    Continuation,
    /// Text frame (0x1). The only opcode this server emits.
    Text,
    /// Binary frame (0x2).
    Binary,
    /// Close frame (0x8).
    Close,
    /// Ping frame (0x9).
    Ping,
    /// Pong frame (0xA).
    Pong,
    /// Any reserved value (0x3-0x7, 0xB-0xF).
    Reserved(u8),
}

impl OpCode {
    /// Classify the low nibble of a frame's first byte.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Self {
        match byte & 0x0F {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpCode::Continuation => write!(f, "Continuation"),
            OpCode::Text => write!(f, "Text"),
            OpCode::Binary => write!(f, "Binary"),
            OpCode::Close => write!(f, "Close"),
            OpCode::Ping => write!(f, "Ping"),
            OpCode::Pong => write!(f, "Pong"),
            OpCode::Reserved(b) => write!(f, "Reserved({b:#x})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_known() {
        assert_eq!(OpCode::from_u8(0x1), OpCode::Text);
        assert_eq!(OpCode::from_u8(0x8), OpCode::Close);
        assert_eq!(OpCode::from_u8(0xA), OpCode::Pong);
    }

    #[test]
    fn test_from_u8_ignores_flag_bits() {
        // FIN + text, as found in the first header byte.
        assert_eq!(OpCode::from_u8(0x81), OpCode::Text);
        assert_eq!(OpCode::from_u8(0x89), OpCode::Ping);
    }

    #[test]
    fn test_reserved_display() {
        let op = OpCode::from_u8(0x3);
        assert_eq!(op, OpCode::Reserved(0x3));
        assert_eq!(op.to_string(), "Reserved(0x3)");
    }
}
