//! WebSocket protocol engine: upgrade handshake and frame codec.

pub mod frame;
pub mod handshake;
pub mod mask;
pub mod opcode;

pub use frame::{
    Frame, FrameMode, LengthClass, MAX_CHUNK_PAYLOAD, decode, encode, encode_extended,
    encode_masked, encode_with, frame_size,
};
pub use handshake::{
    HandshakeResponse, HeaderMap, HttpRequest, WS_GUID, compute_accept_key, generate_key,
};
pub use mask::apply_mask;
pub use opcode::OpCode;
