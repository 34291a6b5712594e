//! Per-worker readiness loop and the listening socket it serves.

mod event_loop;
mod listener;

pub use event_loop::{
    ACCEPT_BACKOFF, AcceptBackoff, Callbacks, ConnectionCallback, EventLoop, Interest,
    LISTENER_KEY, MessageCallback, Role, Watched,
};
pub use listener::{bind_listener, configure_stream};
