//! patrol-daemon — privileged host agent for EC, platform, and action
//! plumbing.
//!
//! The binary decides between two operating modes:
//!
//! - `run`: detach into the background the way a service manager expects
//!   (double fork, new session, cwd to `/`).
//! - `foreground`: stay attached, log to stderr unless told otherwise.
//!
//! Daemonization MUST happen before the Tokio runtime exists. `fork()`
//! only duplicates the calling thread; forking after worker threads are
//! up leaves mutexes locked forever in the child. `main` is therefore
//! synchronous: it parses arguments, forks if asked, and only then
//! constructs the runtime and enters the async body.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use patrol_core::{PatrolConfig, SharedSecret};
use patrol_daemon::supervisor;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// patrol host agent.
#[derive(Parser, Debug)]
#[command(name = "patrol-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/patrol/patrol.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to a file instead of stderr. Defaults to the configured log
    /// directory in `run` mode.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Override the control socket path.
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Override the monitor socket path.
    #[arg(long)]
    monitor_socket: Option<PathBuf>,
}

/// Operating mode.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Detach and run under the service manager.
    Run,
    /// Run attached to the terminal.
    Foreground,
}

/// Double-fork daemonization. Only called from the single-threaded
/// context before the runtime starts.
#[allow(unsafe_code)] // fork() requires unsafe
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // SAFETY: no runtime, no worker threads, nothing spawned yet; the
    // process is single-threaded, which is the one precondition fork()
    // safety needs here. The parent exits immediately.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid()?;

    // SAFETY: still single-threaded; we are the first fork's child. The
    // second fork prevents the daemon from reacquiring a controlling
    // terminal.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    std::env::set_current_dir("/")?;
    Ok(())
}

fn init_logging(args: &Args, config: &PatrolConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_file = match (&args.log_file, args.mode) {
        (Some(path), _) => Some(path.clone()),
        (None, Mode::Run) => Some(config.log_dir.join("patrol-daemon.log")),
        (None, Mode::Foreground) => None,
    };

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create log directory")?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

/// Synchronous entry point: fork first, runtime second.
fn main() -> Result<()> {
    let args = Args::parse();

    if args.mode == Mode::Run {
        if let Err(err) = daemonize() {
            eprintln!("daemonization failed: {err}");
            return Err(err);
        }
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let mut config = if args.config.exists() {
        PatrolConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        PatrolConfig::default()
    };
    if let Some(path) = args.control_socket.clone() {
        config.control_socket = path;
    }
    if let Some(path) = args.monitor_socket.clone() {
        config.monitor_socket = path;
    }

    init_logging(&args, &config)?;

    if !args.config.exists() {
        info!(path = %args.config.display(), "no config file, using defaults");
    }
    info!(
        mode = ?args.mode,
        pid = std::process::id(),
        log_max_size = config.log_max_size,
        log_max_files = config.log_max_files,
        "patrol daemon starting"
    );

    // The shared secret is the root of the whole authentication story; a
    // daemon without one cannot admit any client.
    let secret = SharedSecret::from_file(&config.secret_file)
        .with_context(|| format!("failed to load shared secret from {}", config.secret_file.display()))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Unix signals flip the shutdown flag; the supervisor drains from
    // there.
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, "failed to register SIGINT handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        let _ = shutdown_tx.send(true);
    });

    supervisor::run(config, secret, shutdown_rx).await
}
