//! PID file: the only record of which master owns a start file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// PID file derived from a start file path.
///
/// The file name is the absolute start-file path with every `/` and `.`
/// replaced by `_`, plus `.pid`, so each start script gets its own file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
    start_file: PathBuf,
}

impl PidFile {
    /// PID file in `dir` for `start_file`.
    #[must_use]
    pub fn for_start_file(dir: &Path, start_file: &Path) -> Self {
        let sanitized: String = start_file
            .to_string_lossy()
            .chars()
            .map(|c| if c == '/' || c == '.' { '_' } else { c })
            .collect();
        Self {
            path: dir.join(format!("{sanitized}.pid")),
            start_file: start_file.to_path_buf(),
        }
    }

    /// Location of the PID file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start file this PID file belongs to.
    #[must_use]
    pub fn start_file(&self) -> &Path {
        &self.start_file
    }

    /// Recorded pid, if the file exists and holds a positive integer.
    #[must_use]
    pub fn read(&self) -> Option<i32> {
        let content = fs::read_to_string(&self.path).ok()?;
        content.trim().parse().ok().filter(|pid: &i32| *pid > 0)
    }

    /// Recorded pid, if that process answers the liveness probe.
    #[must_use]
    pub fn live_master(&self) -> Option<i32> {
        let pid = self.read()?;
        if probe_alive(pid) {
            Some(pid)
        } else {
            debug!(pid, path = %self.path.display(), "stale pid file");
            None
        }
    }

    /// Record `pid`, replacing any previous content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be written.
    pub fn write(&self, pid: i32) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, pid.to_string())?;
        debug!(pid, path = %self.path.display(), "pid file written");
        Ok(())
    }

    /// Delete the file. A missing file is not an error.
    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "pid file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "cannot remove pid file"),
        }
    }

    /// Fail with [`Error::AlreadyRunning`] if a live master owns this file.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn ensure_not_running(&self) -> Result<()> {
        match self.live_master() {
            Some(pid) => Err(Error::AlreadyRunning {
                pid,
                start_file: self.start_file.display().to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Probe `pid` with signal 0. Nothing is delivered.
///
/// A process owned by another user (`EPERM`) still counts as alive.
#[must_use]
pub fn probe_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
