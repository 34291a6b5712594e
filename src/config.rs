//! Server configuration.
//!
//! A [`ServerConfig`] is built once in the master, validated, and then shared
//! read-only by every forked worker.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::protocol::{FrameMode, HeaderMap};

/// Transport named by the scheme of a listen address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// `tcp://`
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

/// A `scheme://host:port` listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    /// Transport scheme.
    pub transport: Transport,
    /// Host name or IP literal (IPv6 without brackets).
    pub host: String,
    /// Port; 0 lets the OS choose.
    pub port: u16,
}

impl ListenAddr {
    /// Parse an address such as `tcp://0.0.0.0:8080` or `tcp://[::1]:9000`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the scheme is missing or unsupported, or
    /// if the host or port is malformed.
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("Missing scheme in socket address: {s}")))?;

        let transport = match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Transport::Tcp,
            other => {
                return Err(Error::Config(format!("Unsupported transport: {other}")));
            }
        };

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("Missing port in socket address: {s}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Config(format!("Missing host in socket address: {s}")));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Config(format!("Invalid port in socket address: {s}")))?;

        Ok(Self {
            transport,
            host: host.to_string(),
            port,
        })
    }

    /// Resolve to the first matching socket address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] if the host does not resolve.
    pub fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::Socket(format!("Resolve {self} failed: {e}")))?
            .next()
            .ok_or_else(|| Error::Socket(format!("No address found for {self}")))
    }
}

impl FromStr for ListenAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.transport, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.transport, self.host, self.port)
        }
    }
}

/// Operating environment selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Foreground; worker deaths are reported at `warn`.
    #[default]
    Dev,
    /// Daemonized; worker deaths are reported at `debug`.
    Prod,
}

impl Environment {
    /// Returns `true` if the master should detach from its terminal.
    #[must_use]
    pub const fn is_daemon(self) -> bool {
        matches!(self, Environment::Prod)
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            other => Err(Error::Config(format!(
                "Unknown environment {other} (expected dev or prod)"
            ))),
        }
    }
}

/// Server configuration, immutable once the master starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address.
    ///
    /// Default: `tcp://0.0.0.0:8080`
    pub listen: ListenAddr,

    /// Number of worker processes. Must be at least 1.
    ///
    /// Default: 1
    pub count: usize,

    /// Pending-connection queue length passed to `listen(2)`. Must be positive.
    ///
    /// Default: 100
    pub backlog: u32,

    /// Upper bound on one readiness wait in the event loop.
    ///
    /// Default: 200 seconds
    pub select_timeout: Duration,

    /// Upper bound on waiting for a connection after the listener was
    /// reported ready but another worker won the accept.
    ///
    /// Default: 60 seconds
    pub accept_timeout: Duration,

    /// Prefix for master and worker process titles.
    ///
    /// Default: `wspool`
    pub process_title: String,

    /// Directory holding the PID file.
    ///
    /// Default: `std::env::temp_dir()`
    pub pid_dir: PathBuf,

    /// Extra headers appended to every handshake response.
    pub response_headers: HeaderMap,

    /// Outbound framing.
    ///
    /// Default: [`FrameMode::Chunked`]
    pub frame_mode: FrameMode,

    /// Let every worker bind its own listener to the same address.
    ///
    /// Default: true
    pub reuse_port: bool,

    /// Pause before each re-fork of a dead worker.
    ///
    /// Default: zero (re-fork immediately)
    pub respawn_delay: Duration,

    /// Start file the PID file path is derived from.
    ///
    /// Default: `None`, meaning the current executable.
    pub start_file: Option<PathBuf>,

    /// Foreground or daemonized operation.
    pub environment: Environment,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ListenAddr {
                transport: Transport::Tcp,
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            count: 1,
            backlog: 100,
            select_timeout: Duration::from_secs(200),
            accept_timeout: Duration::from_secs(60),
            process_title: "wspool".to_string(),
            pid_dir: std::env::temp_dir(),
            response_headers: HeaderMap::new(),
            frame_mode: FrameMode::Chunked,
            reuse_port: true,
            respawn_delay: Duration::ZERO,
            start_file: None,
            environment: Environment::Dev,
        }
    }
}

impl ServerConfig {
    /// Create a configuration listening on `listen`, defaults elsewhere.
    #[must_use]
    pub fn new(listen: ListenAddr) -> Self {
        Self {
            listen,
            ..Default::default()
        }
    }

    /// Set the number of worker processes.
    #[must_use]
    pub const fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Set the listen backlog.
    #[must_use]
    pub const fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the readiness-wait timeout.
    #[must_use]
    pub const fn with_select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    /// Set the accept timeout.
    #[must_use]
    pub const fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Set the process title prefix. An empty title is ignored.
    #[must_use]
    pub fn with_process_title(mut self, title: impl Into<String>) -> Self {
        let title = title.into();
        if !title.is_empty() {
            self.process_title = title;
        }
        self
    }

    /// Set the PID file directory.
    #[must_use]
    pub fn with_pid_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pid_dir = dir.into();
        self
    }

    /// Add a custom handshake response header.
    #[must_use]
    pub fn with_response_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response_headers.insert(name, value);
        self
    }

    /// Set the outbound framing mode.
    #[must_use]
    pub const fn with_frame_mode(mut self, mode: FrameMode) -> Self {
        self.frame_mode = mode;
        self
    }

    /// Enable or disable per-worker listeners on a shared port.
    #[must_use]
    pub const fn with_reuse_port(mut self, reuse: bool) -> Self {
        self.reuse_port = reuse;
        self
    }

    /// Set the pause before re-forking a dead worker.
    #[must_use]
    pub const fn with_respawn_delay(mut self, delay: Duration) -> Self {
        self.respawn_delay = delay;
        self
    }

    /// Set the start file the PID file path is derived from.
    #[must_use]
    pub fn with_start_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.start_file = Some(path.into());
        self
    }

    /// Set the operating environment.
    #[must_use]
    pub const fn with_environment(mut self, env: Environment) -> Self {
        self.environment = env;
        self
    }

    /// Check the invariants every process relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the worker count or backlog is zero, or a
    /// custom header would break the response framing.
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(Error::Config("Illegal child process number: 0".into()));
        }
        if self.backlog == 0 {
            return Err(Error::Config("Backlog must be positive".into()));
        }
        if i32::try_from(self.backlog).is_err() {
            return Err(Error::Config(format!("Backlog too large: {}", self.backlog)));
        }
        for (name, value) in self.response_headers.iter() {
            if name.is_empty() || name.contains([':', '\r', '\n']) || value.contains(['\r', '\n'])
            {
                return Err(Error::Config(format!("Invalid response header: {name}")));
            }
        }
        Ok(())
    }

    /// Resolve the start file: the configured one, or the running executable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the current executable cannot be determined.
    pub fn resolved_start_file(&self) -> Result<PathBuf> {
        match &self.start_file {
            Some(path) => Ok(std::path::absolute(path)?),
            None => Ok(std::env::current_exe()?),
        }
    }

    /// Parse a configuration from TOML text.
    ///
    /// ```
    /// let config = wspool::ServerConfig::from_toml_str(r#"
    ///     listen = "tcp://127.0.0.1:9000"
    ///     count = 4
    ///     select_timeout = 5.0
    ///
    ///     [response_headers]
    ///     Server = "wspool"
    /// "#).unwrap();
    /// assert_eq!(config.count, 4);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for syntax errors, negative timeouts and any
    /// value rejected by [`ServerConfig::validate`].
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| Error::Config(format!("Invalid TOML: {e}")))?;
        raw.into_config()
    }

    /// Read and parse a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, otherwise as
    /// [`ServerConfig::from_toml_str`].
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    listen: Option<String>,
    count: Option<usize>,
    backlog: Option<u32>,
    select_timeout: Option<f64>,
    accept_timeout: Option<f64>,
    process_title: Option<String>,
    pid_dir: Option<PathBuf>,
    #[serde(default)]
    response_headers: BTreeMap<String, String>,
    frame_mode: Option<FrameMode>,
    reuse_port: Option<bool>,
    respawn_delay: Option<f64>,
    start_file: Option<PathBuf>,
    environment: Option<Environment>,
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| Error::Config(format!("{name} must be a non-negative number of seconds")))
}

impl RawConfig {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = ServerConfig::default();
        if let Some(listen) = self.listen {
            config.listen = ListenAddr::parse(&listen)?;
        }
        if let Some(count) = self.count {
            config.count = count;
        }
        if let Some(backlog) = self.backlog {
            config.backlog = backlog;
        }
        if let Some(t) = self.select_timeout {
            config.select_timeout = seconds("select_timeout", t)?;
        }
        if let Some(t) = self.accept_timeout {
            config.accept_timeout = seconds("accept_timeout", t)?;
        }
        if let Some(title) = self.process_title {
            config = config.with_process_title(title);
        }
        if let Some(dir) = self.pid_dir {
            config.pid_dir = dir;
        }
        config.response_headers = self.response_headers.into_iter().collect();
        if let Some(mode) = self.frame_mode {
            config.frame_mode = mode;
        }
        if let Some(reuse) = self.reuse_port {
            config.reuse_port = reuse;
        }
        if let Some(t) = self.respawn_delay {
            config.respawn_delay = seconds("respawn_delay", t)?;
        }
        config.start_file = self.start_file;
        if let Some(env) = self.environment {
            config.environment = env;
        }
        config.validate()?;
        Ok(config)
    }
}
