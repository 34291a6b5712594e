//! wspool echo server
//!
//! Echoes every text message back to its sender from a pool of worker
//! processes.
//!
//! # Usage
//!
//! ```bash
//! wspool-echo start --listen tcp://0.0.0.0:8080 --count 4
//! wspool-echo start --env prod
//! wspool-echo restart
//! wspool-echo stop
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};

use wspool::{Callbacks, Connection, Environment, ListenAddr, ServerConfig, Supervisor};

/// Pre-fork WebSocket echo server
#[derive(Parser, Debug)]
#[command(name = "wspool-echo")]
#[command(about = "Multi-process WebSocket echo server")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Start the master and its workers
    Start,
    /// Terminate the workers so the master forks fresh ones
    Restart,
    /// Kill the master and its workers
    Stop,
}

#[derive(Args, Debug)]
struct Options {
    /// Environment: dev runs in the foreground, prod as a daemon
    #[arg(short, long, global = true, default_value = "dev")]
    env: Environment,

    /// TOML configuration file; command-line options override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Listen address, scheme://host:port
    #[arg(short, long, global = true)]
    listen: Option<ListenAddr>,

    /// Number of worker processes
    #[arg(short, long, global = true)]
    count: Option<usize>,

    /// Directory holding the PID file
    #[arg(long, global = true)]
    pid_dir: Option<PathBuf>,

    /// Process title prefix
    #[arg(long, global = true)]
    title: Option<String>,

    /// Log per-connection events
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl Options {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_toml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(count) = self.count {
            config = config.with_count(count);
        }
        if let Some(dir) = &self.pid_dir {
            config = config.with_pid_dir(dir);
        }
        if let Some(title) = &self.title {
            config = config.with_process_title(title);
        }
        Ok(config.with_environment(self.env))
    }
}

fn echo_callbacks() -> Callbacks {
    Callbacks::new()
        .on_connection(|conn: &mut Connection| {
            debug!(conn = conn.id(), peer = ?conn.peer_addr(), "connected");
        })
        .on_message(|conn: &mut Connection, payload: &[u8]| {
            if let Err(e) = conn.send(payload) {
                debug!(conn = conn.id(), error = %e, "echo failed");
                conn.close();
            }
        })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.options.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("wspool={default_level}").into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = cli.options.server_config()?;
    let title = config.process_title.clone();
    let mut supervisor = Supervisor::new(config, echo_callbacks())?;

    match cli.command {
        Command::Start => {
            if cli.options.env == Environment::Prod {
                println!("In production mode, daemon [on].");
            } else {
                println!("In development mode, daemon [off]. Press Ctrl + C to quit.");
            }
            supervisor.start()?;
        }
        Command::Restart => {
            let workers = supervisor.restart()?;
            info!(?workers, "terminated");
            println!("Server {title} restart success.");
        }
        Command::Stop => {
            let workers = supervisor.stop()?;
            info!(?workers, "killed");
            println!("Server {title} stop success.");
        }
    }
    Ok(())
}
