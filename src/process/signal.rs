//! Signal dispositions for the master and its workers.
//!
//! The master records interrupt and quit in an atomic and keeps interrupt,
//! quit and child-exit blocked outside [`wait_for_signal`], so a signal that
//! arrives while the monitor loop is busy stays pending until the next wait.
//! All real work happens in the monitor loop. Workers restore the defaults
//! and unblock everything so terminate ends them immediately and the master
//! re-forks.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};
use crate::process::registry::signal_name;

static SHUTDOWN_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_shutdown(sig: libc::c_int) {
    SHUTDOWN_SIGNAL.store(sig, Ordering::SeqCst);
}

extern "C" fn wake(_sig: libc::c_int) {}

/// What to do when a signal arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The system default.
    Default,
    /// Discard it.
    Ignore,
    /// Record it for [`take_shutdown_signal`], without `SA_RESTART`.
    RecordShutdown,
    /// Run an empty handler, so [`wait_for_signal`] returns.
    Wake,
}

fn install(sig: libc::c_int, disposition: Disposition) -> Result<()> {
    let handler = match disposition {
        Disposition::Default => libc::SIG_DFL,
        Disposition::Ignore => libc::SIG_IGN,
        Disposition::RecordShutdown => record_shutdown as extern "C" fn(libc::c_int) as libc::sighandler_t,
        Disposition::Wake => wake as extern "C" fn(libc::c_int) as libc::sighandler_t,
    };

    // SAFETY: all-zero is a valid sigaction; the mask is initialized below.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handler;
    action.sa_flags = 0;
    // SAFETY: `action` is a valid, exclusively borrowed sigaction.
    let ret = unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(sig, &action, std::ptr::null_mut())
    };
    if ret == -1 {
        return Err(Error::SignalInstall {
            signal: static_name(sig),
            reason: io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

fn set_mask(how: libc::c_int, signals: &[libc::c_int]) -> Result<()> {
    // SAFETY: all-zero is a valid sigset_t; it is initialized below.
    let mut set: libc::sigset_t = unsafe { mem::zeroed() };
    // SAFETY: `set` is a valid, exclusively borrowed sigset_t.
    let ret = unsafe {
        libc::sigemptyset(&mut set);
        for &sig in signals {
            libc::sigaddset(&mut set, sig);
        }
        libc::sigprocmask(how, &set, std::ptr::null_mut())
    };
    if ret == -1 {
        return Err(Error::SignalInstall {
            signal: "mask",
            reason: io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

const MASTER_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGQUIT, libc::SIGCHLD];

fn static_name(sig: libc::c_int) -> &'static str {
    match sig {
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGPIPE => "SIGPIPE",
        _ => "signal",
    }
}

/// Install the master's handlers: interrupt and quit request shutdown,
/// child-exit wakes [`wait_for_signal`]. All three stay blocked until then.
///
/// # Errors
///
/// Returns [`Error::SignalInstall`] naming the signal that failed.
pub fn install_master() -> Result<()> {
    SHUTDOWN_SIGNAL.store(0, Ordering::SeqCst);
    set_mask(libc::SIG_BLOCK, &MASTER_SIGNALS)?;
    install(libc::SIGINT, Disposition::RecordShutdown)?;
    install(libc::SIGQUIT, Disposition::RecordShutdown)?;
    install(libc::SIGCHLD, Disposition::Wake)
}

/// Sleep until a signal is handled: interrupt, quit or a child exit.
///
/// Signals blocked by [`install_master`] are unblocked only for the
/// duration of the wait, so one raised since the last check returns at once.
pub fn wait_for_signal() {
    // SAFETY: all-zero is a valid sigset_t; it is initialized below.
    let mut empty: libc::sigset_t = unsafe { mem::zeroed() };
    // SAFETY: `empty` is a valid sigset_t. sigsuspend always returns -1
    // with EINTR once a handler has run.
    unsafe {
        libc::sigemptyset(&mut empty);
        libc::sigsuspend(&empty);
    }
}

/// Install a worker's dispositions.
///
/// Interrupt, quit, terminate and child-exit go back to their defaults;
/// broken-pipe is ignored so a write to a vanished peer fails with `EPIPE`.
/// The mask inherited from the master is cleared last, so a terminate that
/// arrived during worker setup takes effect here.
///
/// # Errors
///
/// Returns [`Error::SignalInstall`] naming the signal that failed.
pub fn install_worker() -> Result<()> {
    for sig in [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM, libc::SIGCHLD] {
        install(sig, Disposition::Default)?;
    }
    install(libc::SIGPIPE, Disposition::Ignore)?;
    set_mask(libc::SIG_UNBLOCK, &MASTER_SIGNALS)
}

/// The interrupt or quit received since the master handlers were
/// installed, if any. The record is cleared.
#[must_use]
pub fn take_shutdown_signal() -> Option<i32> {
    match SHUTDOWN_SIGNAL.swap(0, Ordering::SeqCst) {
        0 => None,
        sig => Some(sig),
    }
}

/// Send `sig` to `pid`.
///
/// # Errors
///
/// Returns [`Error::Io`] carrying the OS error.
pub fn send(pid: i32, sig: libc::c_int) -> Result<()> {
    // SAFETY: plain syscall on integer arguments.
    if unsafe { libc::kill(pid, sig) } == -1 {
        return Err(Error::Io(format!(
            "kill({pid}, {}): {}",
            signal_name(sig),
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_signal_is_taken_once() {
        SHUTDOWN_SIGNAL.store(0, Ordering::SeqCst);
        assert_eq!(take_shutdown_signal(), None);
        record_shutdown(libc::SIGQUIT);
        assert_eq!(take_shutdown_signal(), Some(libc::SIGQUIT));
        assert_eq!(take_shutdown_signal(), None);
    }

    // Runs in a forked child so the mask and handlers stay out of the
    // test runner's process.
    #[test]
    fn test_signal_raised_before_wait_is_not_lost() {
        // SAFETY: the child only makes async-signal-safe calls and `_exit`s.
        let pid = unsafe { libc::fork() };
        assert_ne!(pid, -1);
        if pid == 0 {
            let code = (|| {
                if install_master().is_err() {
                    return 1;
                }
                // SAFETY: plain syscall.
                unsafe { libc::raise(libc::SIGINT) };
                // Blocked, so still pending rather than recorded.
                if SHUTDOWN_SIGNAL.load(Ordering::SeqCst) != 0 {
                    return 2;
                }
                wait_for_signal();
                match take_shutdown_signal() {
                    Some(libc::SIGINT) => 0,
                    _ => 3,
                }
            })();
            // SAFETY: leave without running the test harness's destructors.
            unsafe { libc::_exit(code) };
        }

        let mut status = 0;
        // SAFETY: `status` is a valid out-pointer.
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }

    #[test]
    fn test_signal_zero_to_self() {
        assert!(send(std::process::id() as i32, 0).is_ok());
    }

    #[test]
    fn test_send_to_missing_process_fails() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        assert!(matches!(send(pid, 0), Err(Error::Io(_))));
    }
}
