//! The `wspool-echo` binary run as a real master with forked workers.

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use wspool::process::{ProcStat, find_children};

use super::TestClient;

const BIN: &str = env!("CARGO_BIN_EXE_wspool-echo");

/// Poll `cond` every 20ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// Returns `true` if `pid` exists and is not a zombie.
pub fn is_alive(pid: i32) -> bool {
    ProcStat::read(pid).is_some_and(|stat| stat.state != 'Z')
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

/// A running echo master with its own PID directory and port.
pub struct EchoProcess {
    pid_dir: TempDir,
    addr: SocketAddr,
    count: usize,
    master: Child,
}

impl EchoProcess {
    /// Start a master with `count` workers and wait until it serves.
    pub fn start(count: usize) -> Self {
        let pid_dir = tempfile::tempdir().unwrap();
        let addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
        let master = Command::new(BIN)
            .args(common_args(&pid_dir, addr, count))
            .arg("start")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let process = Self {
            pid_dir,
            addr,
            count,
            master,
        };
        assert!(
            wait_until(Duration::from_secs(10), || process.workers().len() == count
                && process.pid_file().is_some()
                && TestClient::connect(addr).is_ok()),
            "echo server did not come up"
        );
        process
    }

    /// Run another subcommand against the same PID directory.
    pub fn command(&self, subcommand: &str) -> Output {
        Command::new(BIN)
            .args(common_args(&self.pid_dir, self.addr, self.count))
            .arg(subcommand)
            .stdin(Stdio::null())
            .output()
            .unwrap()
    }

    /// Address the workers listen on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Pid of the master.
    pub fn master_pid(&self) -> i32 {
        self.master.id() as i32
    }

    /// Live (non-zombie) workers of the master.
    pub fn workers(&self) -> Vec<i32> {
        find_children(self.master_pid())
            .into_iter()
            .filter(|pid| is_alive(*pid))
            .collect()
    }

    /// The PID file, if present.
    pub fn pid_file(&self) -> Option<PathBuf> {
        std::fs::read_dir(self.pid_dir.path())
            .ok()?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .find(|p| p.extension().is_some_and(|ext| ext == "pid"))
    }

    /// Reap the master once it has exited; `None` if it is still running.
    pub fn try_reap(&mut self) -> Option<std::process::ExitStatus> {
        self.master.try_wait().unwrap()
    }
}

impl Drop for EchoProcess {
    fn drop(&mut self) {
        if self.try_reap().is_some() {
            return;
        }
        let master = self.master_pid();
        for pid in find_children(master) {
            // SAFETY: plain syscall.
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
        let _ = self.master.kill();
        let _ = self.master.wait();
    }
}

fn common_args(pid_dir: &TempDir, addr: SocketAddr, count: usize) -> Vec<String> {
    vec![
        "--listen".into(),
        format!("tcp://{addr}"),
        "--count".into(),
        count.to_string(),
        "--pid-dir".into(),
        pid_dir.path().display().to_string(),
        "--title".into(),
        "wspool-test".into(),
    ]
}
