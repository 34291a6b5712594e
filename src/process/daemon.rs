//! Detach from the controlling terminal.

use std::ffi::CStr;
use std::io;

use crate::error::{Error, Result};

fn os_error(what: &str) -> Error {
    Error::Fork(format!("Daemonize {what} failed: {}", io::Error::last_os_error()))
}

/// Turn the calling process into a daemon.
///
/// The invoking process exits with status 0 so the shell returns at once;
/// the child becomes a session leader, moves to `/`, clears its umask and
/// points stdin, stdout and stderr at `/dev/null`.
///
/// Must be called before any thread is spawned.
///
/// # Errors
///
/// Returns [`Error::Fork`] if any step fails in the surviving process.
pub fn daemonize() -> Result<()> {
    // SAFETY: single-threaded at this point; the parent only exits.
    match unsafe { libc::fork() } {
        -1 => return Err(os_error("fork")),
        0 => {}
        // SAFETY: skip destructors and atexit handlers shared with the child.
        _ => unsafe { libc::_exit(0) },
    }

    // SAFETY: plain syscalls; results are checked.
    unsafe {
        if libc::setsid() == -1 {
            return Err(os_error("setsid"));
        }
        let root: &CStr = c"/";
        if libc::chdir(root.as_ptr()) == -1 {
            return Err(os_error("chdir(/)"));
        }
        libc::umask(0);
    }

    redirect_stdio()
}

fn redirect_stdio() -> Result<()> {
    let dev_null: &CStr = c"/dev/null";
    // SAFETY: the path is NUL-terminated; the descriptor is checked.
    let fd = unsafe { libc::open(dev_null.as_ptr(), libc::O_RDWR) };
    if fd == -1 {
        return Err(os_error("open(/dev/null)"));
    }
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid.
        if unsafe { libc::dup2(fd, target) } == -1 {
            return Err(os_error("dup2"));
        }
    }
    if fd > libc::STDERR_FILENO {
        // SAFETY: `fd` is ours and no longer needed.
        unsafe { libc::close(fd) };
    }
    Ok(())
}
