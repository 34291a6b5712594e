//! Accepted connections and their per-connection protocol state.
//!
//! A [`Connection`] owns one socket and frames outgoing text. A
//! [`ConnectionState`] wraps it with the handshake flag and receive buffer
//! the event loop drives.

mod state;

pub use state::{ConnectionState, MAX_FRAME_SIZE, MAX_HANDSHAKE_SIZE, READ_CHUNK, Received};

#[allow(clippy::module_inception)]
mod connection;

pub use connection::{Connection, WRITE_CHUNK};
