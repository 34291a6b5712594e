//! Pre-fork process management: the master, its workers and the PID file.
//!
//! The master never serves connections. It forks `count` workers, each of
//! which runs its own [`EventLoop`](crate::reactor::EventLoop), then sleeps
//! until a child-exit or shutdown signal and replaces any worker that died.

pub mod daemon;
pub mod pid_file;
pub mod registry;
pub mod signal;
pub mod supervisor;
pub mod title;

pub use pid_file::{PidFile, probe_alive};
pub use registry::{ProcessRegistry, Termination};
pub use supervisor::{ProcStat, Supervisor, find_children};
