//! Listening socket creation.
//!
//! With `SO_REUSEPORT` every worker binds its own listener to the same
//! address and the kernel spreads incoming connections across them, so no
//! worker is woken for a connection another worker will take.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::debug;

use crate::error::{Error, Result};

fn socket_error(what: &str) -> impl FnOnce(io::Error) -> Error + '_ {
    move |e| Error::Socket(format!("{what}: {e}"))
}

/// Create, bind and listen on a non-blocking TCP socket.
///
/// `SO_REUSEADDR` is always set; `SO_REUSEPORT` when `reuse_port` is true.
/// Keep-alive and no-delay are set on the listener so accepted sockets
/// inherit them where the platform allows.
///
/// # Errors
///
/// Returns [`Error::Socket`] if any step fails. Nothing is retried.
pub fn bind_listener(addr: SocketAddr, backlog: u32, reuse_port: bool) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    // Created with close-on-exec set.
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(socket_error("socket"))?;

    socket
        .set_reuse_address(true)
        .map_err(socket_error("SO_REUSEADDR"))?;
    if reuse_port {
        socket
            .set_reuse_port(true)
            .map_err(socket_error("SO_REUSEPORT"))?;
    }
    socket
        .set_keepalive(true)
        .map_err(socket_error("SO_KEEPALIVE"))?;
    socket
        .set_nodelay(true)
        .map_err(socket_error("TCP_NODELAY"))?;

    socket
        .bind(&addr.into())
        .map_err(socket_error(&format!("bind {addr}")))?;

    let backlog = i32::try_from(backlog)
        .map_err(|_| Error::Socket(format!("backlog too large: {backlog}")))?;
    socket.listen(backlog).map_err(socket_error("listen"))?;
    socket
        .set_nonblocking(true)
        .map_err(socket_error("Switch to non-blocking mode fail"))?;

    debug!(%addr, backlog, reuse_port, "listening");
    Ok(socket.into())
}

/// Apply keep-alive and no-delay to an accepted stream, where available.
pub fn configure_stream(stream: &TcpStream) {
    let socket = SockRef::from(stream);
    if let Err(e) = socket.set_nodelay(true) {
        debug!(error = %e, "TCP_NODELAY unavailable");
    }
    if let Err(e) = socket.set_keepalive(true) {
        debug!(error = %e, "SO_KEEPALIVE unavailable");
    }
}
