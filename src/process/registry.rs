//! Live-worker bookkeeping and wait-status classification.

use std::collections::BTreeSet;
use std::fmt;

/// The master pid and the set of its live workers.
///
/// Only the supervisor mutates it: a pid is added when a fork succeeds and
/// removed when the monitor reaps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRegistry {
    master: i32,
    workers: BTreeSet<i32>,
}

impl ProcessRegistry {
    /// Empty registry owned by `master`.
    #[must_use]
    pub fn new(master: i32) -> Self {
        Self {
            master,
            workers: BTreeSet::new(),
        }
    }

    /// Pid of the owning master.
    #[must_use]
    pub const fn master(&self) -> i32 {
        self.master
    }

    /// Record a freshly forked worker. Returns `false` if already present.
    pub fn add(&mut self, pid: i32) -> bool {
        self.workers.insert(pid)
    }

    /// Forget a reaped worker. Returns `false` if it was not a known worker.
    pub fn remove(&mut self, pid: i32) -> bool {
        self.workers.remove(&pid)
    }

    /// Returns `true` if `pid` is a live worker.
    #[must_use]
    pub fn contains(&self, pid: i32) -> bool {
        self.workers.contains(&pid)
    }

    /// Number of live workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns `true` if no worker is alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Live worker pids in ascending order.
    pub fn workers(&self) -> impl Iterator<Item = i32> + '_ {
        self.workers.iter().copied()
    }
}

/// How a child process terminated, decoded from a `waitpid` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited normally with this code.
    Exited(i32),
    /// Killed by this signal.
    Signaled(i32),
    /// Stopped by this signal.
    Stopped(i32),
    /// Status matched none of the above.
    Unknown(i32),
}

impl Termination {
    /// Classify a raw wait status.
    #[must_use]
    pub fn from_status(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            Self::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            Self::Signaled(libc::WTERMSIG(status))
        } else if libc::WIFSTOPPED(status) {
            Self::Stopped(libc::WSTOPSIG(status))
        } else {
            Self::Unknown(status)
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited normally with code {code}"),
            Self::Signaled(sig) => write!(f, "terminated by signal {}", signal_name(*sig)),
            Self::Stopped(sig) => write!(f, "stopped by signal {}", signal_name(*sig)),
            Self::Unknown(status) => write!(f, "ended with unknown status {status}"),
        }
    }
}

/// Short name for the signals a worker is commonly ended by.
#[must_use]
pub fn signal_name(sig: libc::c_int) -> String {
    let name = match sig {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGABRT => "SIGABRT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGTERM => "SIGTERM",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        _ => return format!("{sig}"),
    };
    name.to_string()
}
