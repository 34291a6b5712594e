use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use polling::{Event, Events, Poller};
use tracing::{debug, trace, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionState, Received};
use crate::error::{Error, Result};
use crate::protocol::{FrameMode, HeaderMap};
use crate::reactor::listener::configure_stream;

/// Key the listening socket is registered under.
pub const LISTENER_KEY: usize = 0;

/// How long the listener stays unwatched after an accept error that is
/// not a lost race, such as running out of descriptors.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Invoked once per accepted connection, before the handshake.
pub type ConnectionCallback = Box<dyn FnMut(&mut Connection)>;

/// Invoked once per decoded, non-empty application payload.
pub type MessageCallback = Box<dyn FnMut(&mut Connection, &[u8])>;

/// User callbacks driven by the event loop.
///
/// Callbacks run on the loop's only thread: while one runs, the worker
/// neither accepts nor reads.
pub struct Callbacks {
    on_connection: ConnectionCallback,
    on_message: MessageCallback,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_connection: Box::new(|_| {}),
            on_message: Box::new(|_, _| {}),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

impl Callbacks {
    /// No-op callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection callback.
    #[must_use]
    pub fn on_connection(mut self, f: impl FnMut(&mut Connection) + 'static) -> Self {
        self.on_connection = Box::new(f);
        self
    }

    /// Set the message callback.
    #[must_use]
    pub fn on_message(mut self, f: impl FnMut(&mut Connection, &[u8]) + 'static) -> Self {
        self.on_message = Box::new(f);
        self
    }
}

/// What a watched descriptor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The listening socket.
    Listener,
    /// An accepted connection.
    Connection,
}

/// Readiness a descriptor is watched for.
///
/// Writability is tracked but never acted on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    /// Watched for readability.
    pub readable: bool,
    /// Watched for writability.
    pub writable: bool,
}

impl Interest {
    /// Readable only.
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    fn to_event(self, key: usize) -> Event {
        match (self.readable, self.writable) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
}

/// The watched set: descriptor key to role and interest.
#[derive(Debug, Default)]
pub struct Watched {
    entries: HashMap<usize, (Role, Interest)>,
}

impl Watched {
    /// Start watching `key`.
    pub fn insert(&mut self, key: usize, role: Role, interest: Interest) {
        self.entries.insert(key, (role, interest));
    }

    /// Stop watching `key`.
    pub fn remove(&mut self, key: usize) -> Option<(Role, Interest)> {
        self.entries.remove(&key)
    }

    /// Role of `key`, if watched.
    #[must_use]
    pub fn role(&self, key: usize) -> Option<Role> {
        self.entries.get(&key).map(|(role, _)| *role)
    }

    /// Interest registered for `key`, if watched.
    #[must_use]
    pub fn interest(&self, key: usize) -> Option<Interest> {
        self.entries.get(&key).map(|(_, interest)| *interest)
    }

    /// Number of watched descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptors watched for readability.
    #[must_use]
    pub fn readable_count(&self) -> usize {
        self.entries.values().filter(|(_, i)| i.readable).count()
    }

    /// Descriptors watched for writability.
    #[must_use]
    pub fn writable_count(&self) -> usize {
        self.entries.values().filter(|(_, i)| i.writable).count()
    }
}

enum Outcome {
    Keep,
    Close(&'static str),
}

/// Pause state for a listener whose `accept` keeps failing.
///
/// The first failure of a streak is reported at warn level, the rest at
/// debug, and the listener is not rewatched until the pause has elapsed.
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    failures: u32,
    resume_at: Option<Instant>,
}

impl AcceptBackoff {
    /// Record a failure at `now`. Returns `true` for the first of a streak.
    pub fn fail(&mut self, now: Instant) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.resume_at = Some(now + ACCEPT_BACKOFF);
        self.failures == 1
    }

    /// Record a successful accept. Returns the length of the streak it ends.
    pub fn succeed(&mut self) -> u32 {
        self.resume_at = None;
        std::mem::take(&mut self.failures)
    }

    /// Failures in the current streak.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns `true` while accepts are paused at `now`.
    #[must_use]
    pub fn is_paused(&self, now: Instant) -> bool {
        self.resume_at.is_some_and(|at| now < at)
    }

    /// Time left in the pause at `now`, if one is pending.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.resume_at.map(|at| at.saturating_duration_since(now))
    }

    /// Clear an elapsed pause. Returns `true` if the listener must be
    /// rewatched.
    pub fn resume(&mut self, now: Instant) -> bool {
        match self.resume_at {
            Some(at) if now >= at => {
                self.resume_at = None;
                true
            }
            _ => false,
        }
    }
}

/// Single-threaded readiness loop serving one listener and every
/// connection accepted from it.
///
/// Each [`turn`](EventLoop::turn) waits up to the select timeout, accepts on
/// a ready listener, and reads from ready connections, routing bytes to the
/// handshake until it completes and to the frame decoder afterwards.
pub struct EventLoop {
    poller: Poller,
    accept_waiter: Poller,
    listener: TcpListener,
    backoff: AcceptBackoff,
    watched: Watched,
    connections: HashMap<usize, ConnectionState>,
    next_key: usize,
    events: Events,
    select_timeout: Duration,
    accept_timeout: Duration,
    frame_mode: FrameMode,
    response_headers: HeaderMap,
    callbacks: Callbacks,
}

impl EventLoop {
    /// Build a loop around `listener`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] if the poller cannot be created or the
    /// listener cannot be registered or made non-blocking.
    pub fn new(listener: TcpListener, config: &ServerConfig, callbacks: Callbacks) -> Result<Self> {
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Socket(format!("Switch to non-blocking mode fail: {e}")))?;

        let poller = Poller::new().map_err(|e| Error::Socket(format!("poller: {e}")))?;
        // SAFETY: the listener is owned by this loop and lives as long as
        // the poller does.
        unsafe { poller.add(listener.as_raw_fd(), Interest::READABLE.to_event(LISTENER_KEY)) }
            .map_err(|e| Error::Socket(format!("watch listener: {e}")))?;

        // Second registration used only to wait out a lost accept race.
        let accept_waiter = Poller::new().map_err(|e| Error::Socket(format!("poller: {e}")))?;
        // SAFETY: as above.
        unsafe { accept_waiter.add(listener.as_raw_fd(), Event::none(LISTENER_KEY)) }
            .map_err(|e| Error::Socket(format!("watch listener: {e}")))?;

        let mut watched = Watched::default();
        watched.insert(LISTENER_KEY, Role::Listener, Interest::READABLE);

        Ok(Self {
            poller,
            accept_waiter,
            listener,
            backoff: AcceptBackoff::default(),
            watched,
            connections: HashMap::new(),
            next_key: LISTENER_KEY + 1,
            events: Events::new(),
            select_timeout: config.select_timeout,
            accept_timeout: config.accept_timeout,
            frame_mode: config.frame_mode,
            response_headers: config.response_headers.clone(),
            callbacks,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] if the OS cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::Socket(e.to_string()))
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The watched descriptor set.
    #[must_use]
    pub fn watched(&self) -> &Watched {
        &self.watched
    }

    /// Run until a fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] if the listener can no longer be watched.
    pub fn run(&mut self) -> Result<()> {
        self.run_until(|| false)
    }

    /// Run until `stop` returns `true`, checked after every turn.
    ///
    /// # Errors
    ///
    /// See [`EventLoop::run`].
    pub fn run_until(&mut self, mut stop: impl FnMut() -> bool) -> Result<()> {
        while !stop() {
            self.turn()?;
        }
        Ok(())
    }

    /// One iteration: wait for readiness, then handle every reported event.
    ///
    /// Returns the number of events handled. A timeout, an interrupted wait
    /// or a failed wait all count as zero events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] if the listener can no longer be watched.
    pub fn turn(&mut self) -> Result<usize> {
        let now = Instant::now();
        if self.backoff.resume(now) {
            debug!(failures = self.backoff.failures(), "resuming accepts");
            self.rewatch_listener()?;
        }
        let timeout = self
            .backoff
            .remaining(now)
            .map_or(self.select_timeout, |left| left.min(self.select_timeout));

        self.events.clear();
        match self.poller.wait(&mut self.events, Some(timeout)) {
            Ok(0) => return Ok(0),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => {
                warn!(error = %e, "readiness wait failed");
                return Ok(0);
            }
        }

        let ready: Vec<Event> = self.events.iter().collect();
        for event in &ready {
            self.dispatch(event)?;
        }
        Ok(ready.len())
    }

    fn dispatch(&mut self, event: &Event) -> Result<()> {
        trace!(
            key = event.key,
            readable = event.readable,
            writable = event.writable,
            "ready"
        );
        match self.watched.role(event.key) {
            Some(Role::Listener) => {
                if event.readable {
                    self.accept();
                }
                if self.backoff.is_paused(Instant::now()) {
                    return Ok(());
                }
                self.rewatch_listener()
            }
            Some(Role::Connection) => {
                if event.readable {
                    self.service(event.key);
                } else {
                    self.rearm(event.key);
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn rewatch_listener(&self) -> Result<()> {
        self.poller
            .modify(&self.listener, Interest::READABLE.to_event(LISTENER_KEY))
            .map_err(|e| Error::Socket(format!("rewatch listener: {e}")))
    }

    fn accept(&mut self) {
        let accepted = match self.listener.accept() {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.accept_within_timeout(),
            other => other.map(|(stream, _)| Some(stream)),
        };
        let stream = match accepted {
            Ok(Some(stream)) => stream,
            Ok(None) => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                if self.backoff.fail(Instant::now()) {
                    warn!(error = %e, pause = ?ACCEPT_BACKOFF, "accept failed, pausing accepts");
                } else {
                    debug!(error = %e, failures = self.backoff.failures(), "accept still failing");
                }
                return;
            }
        };
        let failures = self.backoff.succeed();
        if failures > 0 {
            debug!(failures, "accept recovered");
        }
        configure_stream(&stream);

        let key = self.next_key;
        self.next_key += 1;

        // SAFETY: the stream is owned by the connection stored under `key`
        // and is deleted from the poller in `teardown` before it is dropped.
        if let Err(e) = unsafe {
            self.poller
                .add(stream.as_raw_fd(), Interest::READABLE.to_event(key))
        } {
            warn!(error = %e, "cannot watch accepted connection");
            return;
        }
        self.watched
            .insert(key, Role::Connection, Interest::READABLE);

        let mut connection = Connection::new(key, stream, self.frame_mode);
        debug!(conn = key, peer = ?connection.peer_addr(), "accepted");
        (self.callbacks.on_connection)(&mut connection);

        let close = connection.is_close_requested();
        self.connections
            .insert(key, ConnectionState::new(connection));
        if close {
            self.teardown(key, "closed by callback");
        }
    }

    // The listener was reported ready but another worker won the race.
    // Wait up to the accept timeout for the next connection.
    fn accept_within_timeout(&mut self) -> io::Result<Option<TcpStream>> {
        if self.accept_timeout.is_zero() {
            return Ok(None);
        }
        let deadline = Instant::now() + self.accept_timeout;
        let mut events = Events::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            self.accept_waiter
                .modify(&self.listener, Event::readable(LISTENER_KEY))?;
            events.clear();
            match self.accept_waiter.wait(&mut events, Some(left)) {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            match self.listener.accept() {
                Ok((stream, _)) => return Ok(Some(stream)),
                // Lost again; keep waiting within the same bound.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn service(&mut self, key: usize) {
        let outcome = match self.connections.get_mut(&key) {
            Some(state) => Self::drive(
                state,
                &self.response_headers,
                &mut self.callbacks.on_message,
            ),
            None => return,
        };
        match outcome {
            Outcome::Keep => self.rearm(key),
            Outcome::Close(reason) => self.teardown(key, reason),
        }
    }

    fn drive(
        state: &mut ConnectionState,
        response_headers: &HeaderMap,
        on_message: &mut MessageCallback,
    ) -> Outcome {
        match state.fill() {
            Ok(0) => return Outcome::Close("peer closed"),
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Outcome::Keep;
            }
            Err(e) => {
                debug!(conn = state.connection().id(), error = %e, "read failed");
                return Outcome::Close("read error");
            }
        }

        loop {
            match state.process(response_headers) {
                Ok(Received::Pending) => break,
                Ok(Received::Upgraded | Received::Empty) => {}
                Ok(Received::Message(payload)) => on_message(state.connection(), &payload),
                Err(e) => {
                    warn!(conn = state.connection().id(), error = %e, "connection error");
                    return Outcome::Close("protocol error");
                }
            }
            if state.connection().is_close_requested() {
                break;
            }
        }

        if state.connection().is_close_requested() {
            Outcome::Close("closed by callback")
        } else {
            Outcome::Keep
        }
    }

    fn rearm(&mut self, key: usize) {
        let Some(state) = self.connections.get_mut(&key) else {
            return;
        };
        let interest = self.watched.interest(key).unwrap_or(Interest::READABLE);
        if let Err(e) = self
            .poller
            .modify(state.connection().stream(), interest.to_event(key))
        {
            warn!(conn = key, error = %e, "cannot rewatch connection");
            self.teardown(key, "rewatch failed");
        }
    }

    fn teardown(&mut self, key: usize, reason: &'static str) {
        self.watched.remove(key);
        if let Some(state) = self.connections.remove(&key) {
            let connection = state.into_connection();
            let _ = self.poller.delete(connection.stream());
            connection.shutdown();
            debug!(conn = key, reason, "connection closed");
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("listener", &self.listener)
            .field("watched", &self.watched.len())
            .field("connections", &self.connections.len())
            .field("select_timeout", &self.select_timeout)
            .finish_non_exhaustive()
    }
}
