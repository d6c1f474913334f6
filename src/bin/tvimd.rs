//! tvim Daemon - TV input session broker
//!
//! Runs the session broker for every user profile and serves it on a
//! Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! tvimd start
//!
//! # Start the daemon (background/daemonized)
//! tvimd start -d
//!
//! # Stop the daemon
//! tvimd stop
//!
//! # Check daemon status
//! tvimd status
//!
//! # Start with a custom socket path
//! TVIM_SOCKET=/run/tvim.sock tvimd start
//!
//! # Enable debug logging
//! RUST_LOG=tvimd=debug tvimd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown
//! - SIGHUP: Rescan provider manifests and rebuild the input list

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tvim_core::UserId;
use tvimd::broker::{spawn_broker, BrokerDeps, BrokerHandle};
use tvimd::config::Config;
use tvimd::directory::ManifestDirectory;
use tvimd::hardware::InMemoryHardwareManager;
use tvimd::loopback::LoopbackConnector;
use tvimd::server::DaemonServer;
use tvimd::settings::FileSettingsStore;
use tvimd::watch_log::{JsonlWatchLog, WatchLogHandle};

/// tvim daemon - TV input session broker
#[derive(Parser, Debug)]
#[command(name = "tvimd", version, about)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/tvim/tvimd.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("tvim")
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    state_dir().join("tvimd.pid")
}

/// Returns the path to the log file.
fn log_file_path() -> PathBuf {
    state_dir().join("tvimd.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Writes the current PID to the PID file.
fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Returns the PID of a running daemon, clearing a stale PID file.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid).context("PID out of range")?;
    // SAFETY: kill has no memory-safety preconditions
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.or_else(Config::default_path);
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    match args.command.unwrap_or(Command::Start { daemon: false }) {
        Command::Start { daemon } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'tvimd stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                // Must fork before the tokio runtime starts
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                return Ok(());
            };
            println!("Stopping daemon (PID {pid})...");
            stop_daemon(pid)?;

            for _ in 0..50 {
                if !is_process_running(pid) {
                    println!("Daemon stopped.");
                    return Ok(());
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }

            eprintln!("Daemon did not stop within 5 seconds.");
            process::exit(1);
        }
        Command::Status => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };
            println!("Daemon is running (PID {pid})");
            if config.socket_path.exists() {
                println!("Socket: {}", config.socket_path.display());
            }
            println!("Providers: {}", config.providers_dir.display());
            println!("State: {}", config.state_dir.display());
            Ok(())
        }
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tvimd=info".parse()?)
                .add_directive("tvim_provider=info".parse()?)
                .add_directive("tvim_core=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        user = %config.current_user,
        "tvim daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let directory = Arc::new(ManifestDirectory::new(&config.providers_dir));
    if let Err(e) = directory.rescan().await {
        warn!(error = %e, "Initial provider scan failed, starting with no providers");
    }

    let watch_log = WatchLogHandle::spawn(
        Arc::new(JsonlWatchLog::new(config.state_dir.join("watch"))),
        config.current_user,
    );

    let broker = spawn_broker(BrokerDeps {
        directory: directory.clone(),
        connector: Arc::new(LoopbackConnector::new(directory.clone())),
        hardware: Arc::new(InMemoryHardwareManager::new()),
        settings: Arc::new(FileSettingsStore::new(config.state_dir.join("settings"))),
        watch_log: watch_log.clone(),
        current_user: config.current_user,
    });
    info!("Session broker started");

    spawn_rescan_on_hangup(directory, broker.clone(), cancel_token.clone());

    let server = DaemonServer::new(&config.socket_path, broker, cancel_token);
    info!(socket = %config.socket_path.display(), "Starting server");

    let result = server.run().await;

    watch_log.flush().await;
    watch_log.close();

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("tvim daemon stopped");
    Ok(())
}

/// Rescans provider manifests on every SIGHUP.
fn spawn_rescan_on_hangup(
    directory: Arc<ManifestDirectory>,
    broker: BrokerHandle,
    cancel_token: CancellationToken,
) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "SIGHUP handler unavailable, rescans disabled");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Received SIGHUP, rescanning providers");
                    match directory.rescan().await {
                        Ok(scan) => {
                            if let Err(e) = broker
                                .rebuild_inputs(UserId::CURRENT, scan.updated_packages)
                                .await
                            {
                                warn!(error = %e, "Input rebuild failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "Provider rescan failed"),
                    }
                }
            }
        }
    });
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}
