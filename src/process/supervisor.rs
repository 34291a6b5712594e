//! The master process: owns the PID file and keeps `count` workers alive.

use std::fmt;
use std::fs;
use std::io;
use std::net::TcpListener;
use std::path::Path;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::config::{Environment, ServerConfig};
use crate::error::{Error, Result};
use crate::process::pid_file::PidFile;
use crate::process::registry::{ProcessRegistry, Termination, signal_name};
use crate::process::{daemon, signal, title};
use crate::reactor::{Callbacks, EventLoop, bind_listener};

/// Pre-fork supervisor.
///
/// The same value serves both sides of the command surface: in the
/// process that runs `start` it becomes the master; in a process that runs
/// `stop` or `restart` it only locates that master through the PID file.
///
/// ## Example
///
/// ```rust,no_run
/// use wspool::{Callbacks, Connection, ServerConfig, Supervisor};
///
/// let config = ServerConfig::default().with_count(4);
/// let callbacks = Callbacks::new().on_message(|conn: &mut Connection, payload: &[u8]| {
///     let _ = conn.send(payload);
/// });
/// Supervisor::new(config, callbacks)?.start()?;
/// # Ok::<(), wspool::Error>(())
/// ```
pub struct Supervisor {
    config: ServerConfig,
    callbacks: Callbacks,
    pid_file: PidFile,
    registry: ProcessRegistry,
    shared_listener: Option<TcpListener>,
}

impl Supervisor {
    /// Validate `config` and derive the PID file location.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration and
    /// [`Error::Io`] if the start file cannot be resolved.
    pub fn new(config: ServerConfig, callbacks: Callbacks) -> Result<Self> {
        config.validate()?;
        let start_file = config.resolved_start_file()?;
        let pid_file = PidFile::for_start_file(&config.pid_dir, &start_file);
        Ok(Self {
            config,
            callbacks,
            pid_file,
            registry: ProcessRegistry::new(0),
            shared_listener: None,
        })
    }

    /// The configuration this supervisor runs with.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The PID file shared by `start`, `stop` and `restart`.
    #[must_use]
    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    /// Live workers, as seen by the master.
    #[must_use]
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Become the master: claim the PID file, fork the workers and monitor
    /// them until interrupt or quit.
    ///
    /// In [`Environment::Prod`] the process daemonizes first; the invoking
    /// process exits with status 0.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRunning`] if a live master owns the PID file; no
    ///   worker is forked
    /// - [`Error::Socket`] if the listen address cannot be bound
    /// - [`Error::SignalInstall`] or [`Error::Fork`] from master setup
    pub fn start(&mut self) -> Result<()> {
        self.pid_file.ensure_not_running()?;
        let addr = self.config.listen.resolve()?;

        // Bind errors surface here rather than in every worker.
        let listener = bind_listener(addr, self.config.backlog, self.config.reuse_port)?;
        if self.config.reuse_port {
            drop(listener);
        } else {
            self.shared_listener = Some(listener);
        }

        if self.config.environment.is_daemon() {
            daemon::daemonize()?;
        }

        let master = current_pid();
        become_group_leader(master);
        self.registry = ProcessRegistry::new(master);
        self.pid_file.write(master)?;

        title::set(&title::master_title(
            &self.config.process_title,
            &self.pid_file.start_file().display().to_string(),
        ));
        if let Err(e) = signal::install_master() {
            self.pid_file.remove();
            return Err(e);
        }

        info!(
            master,
            listen = %self.config.listen,
            workers = self.config.count,
            environment = ?self.config.environment,
            pid_file = %self.pid_file.path().display(),
            "master started"
        );

        if let Err(e) = self.fork_until_reach() {
            self.shutdown(None);
            return Err(e);
        }
        self.monitor()
    }

    /// Wait for workers to terminate and re-fork up to the target count.
    ///
    /// Returns once interrupt or quit has been received and every worker
    /// has been terminated and reaped. Between checks the master sleeps in
    /// [`signal::wait_for_signal`], so a shutdown request is never missed
    /// while workers stay alive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fork`] if a replacement worker cannot be forked and
    /// [`Error::Io`] if waiting fails for a reason other than an interrupt.
    pub fn monitor(&mut self) -> Result<()> {
        loop {
            if let Some(sig) = signal::take_shutdown_signal() {
                self.shutdown(Some(sig));
                return Ok(());
            }

            let mut status: libc::c_int = 0;
            // SAFETY: `status` is a valid out-pointer.
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            match pid {
                0 => {
                    signal::wait_for_signal();
                    continue;
                }
                -1 => {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EINTR) => continue,
                        Some(libc::ECHILD) => {
                            // Every worker is gone and none is being waited on.
                            self.registry = ProcessRegistry::new(self.registry.master());
                            self.fork_until_reach()?;
                            continue;
                        }
                        _ => {
                            self.shutdown(None);
                            return Err(Error::Io(format!("waitpid: {err}")));
                        }
                    }
                }
                _ => {}
            }

            let known = self.registry.remove(pid);
            let termination = Termination::from_status(status);
            match self.config.environment {
                Environment::Dev => warn!(pid, known, %termination, "worker quit"),
                Environment::Prod => debug!(pid, known, %termination, "worker quit"),
            }

            if !self.config.respawn_delay.is_zero() {
                thread::sleep(self.config.respawn_delay);
            }
            if let Some(sig) = signal::take_shutdown_signal() {
                self.shutdown(Some(sig));
                return Ok(());
            }
            self.fork_until_reach()?;
        }
    }

    /// Fork workers until the registry holds the target count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fork`] if `fork(2)` fails.
    pub fn fork_until_reach(&mut self) -> Result<()> {
        while self.registry.len() < self.config.count {
            self.fork_worker()?;
        }
        Ok(())
    }

    /// Fork one worker and record it. Returns the worker pid.
    ///
    /// The child never returns from this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fork`] if `fork(2)` fails.
    pub fn fork_worker(&mut self) -> Result<i32> {
        // SAFETY: the master is single-threaded; the child only runs the
        // worker and then `_exit`s.
        match unsafe { libc::fork() } {
            -1 => Err(Error::Fork(io::Error::last_os_error().to_string())),
            0 => {
                let code = self.run_worker();
                // SAFETY: skip destructors owned by the master's state.
                unsafe { libc::_exit(code) }
            }
            pid => {
                self.registry.add(pid);
                debug!(pid, live = self.registry.len(), "worker forked");
                Ok(pid)
            }
        }
    }

    fn run_worker(&mut self) -> i32 {
        title::set(&title::worker_title(&self.config.process_title));

        let listener = match self.shared_listener.take() {
            Some(listener) => Ok(listener),
            None => self.config.listen.resolve().and_then(|addr| {
                bind_listener(addr, self.config.backlog, self.config.reuse_port)
            }),
        };
        let result = listener
            .and_then(|listener| {
                signal::install_worker()?;
                let callbacks = std::mem::take(&mut self.callbacks);
                EventLoop::new(listener, &self.config, callbacks)
            })
            .and_then(|mut event_loop| {
                info!(pid = current_pid(), "worker ready");
                event_loop.run()
            });

        match result {
            Ok(()) => 0,
            Err(e) => {
                error!(pid = current_pid(), error = %e, "worker failed");
                1
            }
        }
    }

    fn shutdown(&mut self, sig: Option<i32>) {
        if let Some(sig) = sig {
            info!(signal = %signal_name(sig), "master shutting down");
        }
        let workers: Vec<i32> = self.registry.workers().collect();
        for pid in &workers {
            if let Err(e) = signal::send(*pid, libc::SIGTERM) {
                debug!(pid, error = %e, "worker already gone");
            }
        }
        for pid in workers {
            reap(pid);
            self.registry.remove(pid);
        }
        self.pid_file.remove();
    }

    /// Stop a running master and its workers.
    ///
    /// The master is suspended first so it cannot re-fork, its workers are
    /// killed, then the master is killed and the PID file removed. Returns
    /// the killed worker pids.
    ///
    /// # Errors
    ///
    /// - [`Error::NotRunning`] if no live master owns the PID file
    /// - [`Error::Io`] if a signal cannot be delivered
    pub fn stop(&self) -> Result<Vec<i32>> {
        let master = self.live_master()?;
        signal::send(master, libc::SIGSTOP)?;

        let children = find_children(master);
        for pid in &children {
            signal::send(*pid, libc::SIGKILL)?;
        }
        signal::send(master, libc::SIGKILL)?;
        self.pid_file.remove();

        info!(master, workers = children.len(), "stopped");
        Ok(children)
    }

    /// Terminate every worker of a running master; the master's monitor
    /// forks replacements. Returns the terminated worker pids.
    ///
    /// # Errors
    ///
    /// - [`Error::NotRunning`] if no live master owns the PID file
    /// - [`Error::Io`] if a signal cannot be delivered
    pub fn restart(&self) -> Result<Vec<i32>> {
        let master = self.live_master()?;
        let children = find_children(master);
        for pid in &children {
            signal::send(*pid, libc::SIGTERM)?;
        }
        info!(master, workers = children.len(), "restart requested");
        Ok(children)
    }

    fn live_master(&self) -> Result<i32> {
        self.pid_file
            .live_master()
            .ok_or_else(|| Error::NotRunning(self.config.process_title.clone()))
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("pid_file", &self.pid_file)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn current_pid() -> i32 {
    // SAFETY: getpid cannot fail.
    unsafe { libc::getpid() }
}

fn become_group_leader(pid: i32) {
    // SAFETY: plain syscalls on the calling process.
    unsafe {
        if libc::getpgid(0) != pid && libc::setpgid(0, 0) == -1 {
            warn!(error = %io::Error::last_os_error(), "cannot become process group leader");
        }
    }
}

fn reap(pid: i32) {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: `status` is a valid out-pointer.
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        if ret == pid {
            debug!(pid, termination = %Termination::from_status(status), "worker reaped");
        }
        return;
    }
}

/// Fields of `/proc/<pid>/stat` used to identify workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    /// Single-letter process state (`R`, `S`, `Z`, ...).
    pub state: char,
    /// Parent pid.
    pub ppid: i32,
    /// Process group id.
    pub pgrp: i32,
}

impl ProcStat {
    /// Parse the content of a `/proc/<pid>/stat` file.
    ///
    /// The command name may itself contain spaces and parentheses, so
    /// fields are counted from the last `)`.
    #[must_use]
    pub fn parse(stat: &str) -> Option<Self> {
        let rest = &stat[stat.rfind(')')? + 1..];
        let mut fields = rest.split_whitespace();
        let state = fields.next()?.chars().next()?;
        let ppid = fields.next()?.parse().ok()?;
        let pgrp = fields.next()?.parse().ok()?;
        Some(Self { state, ppid, pgrp })
    }

    /// Read the stat of `pid`, if it exists.
    #[must_use]
    pub fn read(pid: i32) -> Option<Self> {
        Self::parse(&fs::read_to_string(Path::new("/proc").join(pid.to_string()).join("stat")).ok()?)
    }
}

/// Children of `master` that are members of its process group.
///
/// Children that left the group are not workers and are left alone.
#[must_use]
pub fn find_children(master: i32) -> Vec<i32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut children: Vec<i32> = entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| ProcStat::read(*pid).is_some_and(|stat| stat.ppid == master))
        // SAFETY: plain syscall on an integer pid.
        .filter(|pid| unsafe { libc::getpgid(*pid) } == master)
        .collect();
    children.sort_unstable();
    children
}
