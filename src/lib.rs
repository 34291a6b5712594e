//! # wspool - Pre-fork WebSocket Server
//!
//! `wspool` serves WebSocket connections from a fixed pool of worker
//! processes supervised by a master process.
//!
//! ## Features
//!
//! - **Pre-fork worker pool** with automatic re-fork of dead workers
//! - **Readiness-multiplexed workers**: one thread serves many connections
//! - **`SO_REUSEPORT` listeners** so the kernel spreads accepts across workers
//! - **RFC 6455 upgrade handshake** and text-frame codec
//! - **PID-file single-instance guard** with `start`, `stop` and `restart`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wspool::{Callbacks, Connection, ListenAddr, ServerConfig, Supervisor};
//!
//! let config = ServerConfig::new(ListenAddr::parse("tcp://0.0.0.0:8080")?).with_count(4);
//! let callbacks = Callbacks::new()
//!     .on_connection(|conn: &mut Connection| tracing::info!(peer = ?conn.peer_addr(), "hello"))
//!     .on_message(|conn: &mut Connection, payload: &[u8]| {
//!         let _ = conn.send(payload);
//!     });
//! Supervisor::new(config, callbacks)?.start()?;
//! # Ok::<(), wspool::Error>(())
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod process;
pub mod protocol;
pub mod reactor;

pub use config::{Environment, ListenAddr, ServerConfig, Transport};
pub use connection::{Connection, ConnectionState, Received};
pub use error::{Error, Result};
pub use process::{PidFile, ProcessRegistry, Supervisor, Termination};
pub use protocol::{
    FrameMode, HandshakeResponse, HeaderMap, HttpRequest, OpCode, WS_GUID, compute_accept_key,
};
pub use reactor::{Callbacks, EventLoop, bind_listener};
