//! coap-shepherd daemon - LWM2M device-management server
//!
//! This binary runs the CoAP server, accepting device registrations and
//! keeping every registered device's session alive.
//!
//! # Usage
//!
//! ```bash
//! # Start the server (foreground)
//! shepherdd start
//!
//! # Start the server (background/daemonized) with a config file
//! shepherdd start -d --config /etc/coap-shepherd/shepherd.toml
//!
//! # Stop the server
//! shepherdd stop
//!
//! # Check server status
//! shepherdd status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use shepherdd::config::ShepherdConfig;
use shepherdd::registry::{AcceptAll, ShepherdEvent};
use shepherdd::server::ShepherdServer;

/// coap-shepherd - LWM2M device-management server over CoAP
#[derive(Parser, Debug)]
#[command(name = "shepherdd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (TOML)
        #[arg(long, env = "SHEPHERD_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Stop the running server
    Stop,
    /// Show server status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("coap-shepherd")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("shepherdd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("shepherdd.log")
}

fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

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

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    // Signal 0 only checks that the process exists
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Server is already running (PID {pid})");
                eprintln!("Use 'shepherdd stop' to stop it first.");
                process::exit(1);
            }

            // Load before forking so config errors reach the terminal
            let config = load_config(config.as_deref())?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping server (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Server stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Server did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Server is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Server is running (PID {pid})");
                println!("PID file: {}", pid_file_path().display());
                Ok(())
            } else {
                println!("Server is not running.");
                process::exit(1);
            }
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ShepherdConfig> {
    let config = ShepherdConfig::load_or_default(path).with_context(|| match path {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load default config".to_string(),
    })?;
    Ok(config)
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: ShepherdConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("shepherdd=info".parse()?)
                .add_directive("shepherd_core=info".parse()?)
                .add_directive("shepherd_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        port = config.port,
        "coap-shepherd starting"
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

    let server = ShepherdServer::start(config, Arc::new(AcceptAll), cancel_token.clone())
        .await
        .context("Failed to start server")?;

    spawn_event_logger(server.registry().subscribe(), cancel_token);

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("coap-shepherd stopped");
    Ok(())
}

/// Writes lifecycle events to the log.
fn spawn_event_logger(
    mut events: broadcast::Receiver<ShepherdEvent>,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,

                result = events.recv() => match result {
                    Ok(ShepherdEvent::Error { client_name, message }) => {
                        let client_name = client_name.map(|name| name.to_string()).unwrap_or_default();
                        warn!(client_name = %client_name, message = %message, "Device error");
                    }
                    Ok(ShepherdEvent::Notify { client_name, path, value }) => {
                        debug!(client_name = %client_name, path = %path, value = %value, "device::notify");
                    }
                    Ok(event) => {
                        let client_name = event.client_name().map(|name| name.to_string()).unwrap_or_default();
                        info!(event = event.name(), client_name = %client_name, "Lifecycle event");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Event logger lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
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
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
