//! Error types for the server, its protocol engine and its supervisor.
//!
//! Configuration, socket-setup, fork and signal errors are fatal to the
//! process that hits them. Handshake, decode and write errors are local to
//! one connection: the event loop tears that connection down and keeps going.

use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring, supervising or serving.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration value (worker count, backlog, timeout, address).
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The PID file points at a master that answered the liveness probe.
    #[error("Already running, master pid {pid}, start file ({start_file})")]
    AlreadyRunning {
        /// Pid recorded in the PID file.
        pid: i32,
        /// Start file the PID file was derived from.
        start_file: String,
    },

    /// `stop` or `restart` found no live master.
    #[error("Server {0} not running")]
    NotRunning(String),

    /// Creating, binding, listening on or accepting from a socket failed.
    #[error("Socket error: {0}")]
    Socket(String),

    /// A worker process could not be forked.
    #[error("Fork worker failed: {0}")]
    Fork(String),

    /// A signal disposition could not be installed.
    #[error("Install signal ({signal}) failed: {reason}")]
    SignalInstall {
        /// Signal name, e.g. `SIGINT`.
        signal: &'static str,
        /// OS error text.
        reason: String,
    },

    /// The upgrade request could not be answered.
    #[error("Invalid handshake: {0}")]
    Handshake(String),

    /// A header value would inject extra lines into the response.
    #[error("Invalid header value for {header}: {reason}")]
    InvalidHeaderValue {
        /// Header name.
        header: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Writing to a connection failed or wrote a short frame.
    #[error("Write failed: {0}")]
    Write(String),

    /// Not enough bytes to locate the frame payload.
    #[error("Incomplete frame: need {needed} more bytes")]
    IncompleteFrame {
        /// Number of additional bytes needed.
        needed: usize,
    },

    /// A frame header declared a payload larger than this side accepts.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Declared frame size.
        size: u64,
        /// Largest accepted size.
        max: u64,
    },

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_running_display() {
        let err = Error::AlreadyRunning {
            pid: 4242,
            start_file: "/srv/echo".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Already running, master pid 4242, start file (/srv/echo)"
        );
    }

    #[test]
    fn test_not_running_display() {
        let err = Error::NotRunning("wspool".to_string());
        assert_eq!(err.to_string(), "Server wspool not running");
    }

    #[test]
    fn test_frame_too_large_display() {
        let err = Error::FrameTooLarge {
            size: 1 << 40,
            max: 16 << 20,
        };
        assert_eq!(
            err.to_string(),
            "Frame too large: 1099511627776 bytes (max: 16777216)"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
