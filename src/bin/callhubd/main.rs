//! callhub Daemon - Signaling relay for call peers
//!
//! This binary runs the relay: it accepts WebSocket connections from
//! clients, tracks who is online and who is in a call, relays call setup
//! and SDP/ICE messages, and wakes offline callees through FCM.
//!
//! # Usage
//!
//! ```bash
//! # Start the relay (foreground)
//! callhubd start
//!
//! # Start with a config file, backgrounded
//! callhubd start -d --config /etc/callhub/callhub.toml
//!
//! # Stop the relay
//! callhubd stop
//!
//! # Check relay status
//! callhubd status
//! ```

mod pidfile;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use callhubd::config::RelayConfig;
use callhubd::hub::spawn_hub;
use callhubd::notify::{DisabledNotifier, FcmNotifier, OfflineNotifier, TokenRegistry};
use callhubd::server::RelayServer;

use pidfile::{process_alive, send_terminate, PidFile};

/// callhub daemon - signaling relay for VoIP/video call peers
#[derive(Parser, Debug)]
#[command(name = "callhubd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to a TOML config file
    #[arg(long, global = true, env = "CALLHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(long, global = true, env = "CALLHUB_LISTEN")]
    listen: Option<SocketAddr>,

    /// Emit structured JSON logs
    #[arg(long, global = true, env = "CALLHUB_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the relay
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running relay
    Stop,
    /// Show relay status
    Status,
}

/// How long `stop` waits for the relay to exit
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("callhub")
}

fn pid_file() -> PidFile {
    PidFile::new(state_dir().join("callhubd.pid"))
}

fn log_file_path() -> PathBuf {
    state_dir().join("callhubd.log")
}

/// Loads the config file and applies command-line overrides.
///
/// Relative paths are resolved against the launch directory, since a
/// daemonized process runs from `/`.
fn load_config(args: &Args) -> Result<RelayConfig> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let config_path = args.config.as_ref().map(|p| cwd.join(p));

    let mut config = RelayConfig::load(config_path.as_deref()).context("Failed to load config")?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    config.fcm.credentials = cwd.join(&config.fcm.credentials);

    config.validate().context("Invalid config")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let pid_file = pid_file();

    let default_command = Command::Start { daemon: false };
    match args.command.as_ref().unwrap_or(&default_command) {
        Command::Start { daemon } => {
            if let Some(pid) = pid_file.running() {
                eprintln!("Relay is already running (PID {pid})");
                eprintln!("Use 'callhubd stop' to stop it first.");
                process::exit(1);
            }

            let config = load_config(&args)?;
            if *daemon {
                pidfile::detach(&log_file_path())?;
            }

            let _guard = pid_file.claim()?;
            run_daemon(config, args.json_logs)
        }
        Command::Stop => {
            let Some(pid) = pid_file.running() else {
                println!("Relay is not running.");
                return Ok(());
            };

            println!("Stopping relay (PID {pid})...");
            send_terminate(pid)?;

            let deadline = std::time::Instant::now() + STOP_TIMEOUT;
            while std::time::Instant::now() < deadline {
                if !process_alive(pid) {
                    println!("Relay stopped.");
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(100));
            }

            eprintln!("Relay did not stop within {} seconds.", STOP_TIMEOUT.as_secs());
            process::exit(1);
        }
        Command::Status => match pid_file.running() {
            Some(pid) => {
                println!("Relay is running (PID {pid})");
                println!("PID file: {}", pid_file.path().display());
                if let Ok(config) = load_config(&args) {
                    println!("Listen: {}", config.listen);
                }
                Ok(())
            }
            None => {
                println!("Relay is not running.");
                process::exit(1);
            }
        },
    }
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("callhubd=info".parse()?)
        .add_directive("callhub_core=info".parse()?)
        .add_directive("callhub_protocol=info".parse()?);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Builds the FCM notifier, falling back to a disabled one.
fn load_notifier(credentials: &Path) -> Arc<dyn OfflineNotifier> {
    match FcmNotifier::from_credentials_file(credentials) {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            warn!(
                credentials = %credentials.display(),
                error = %e,
                "Push notifications disabled"
            );
            Arc::new(DisabledNotifier)
        }
    }
}

#[tokio::main]
async fn run_daemon(config: RelayConfig, json_logs: bool) -> Result<()> {
    init_logging(json_logs)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "callhub relay starting"
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

    let tokens = TokenRegistry::default();
    let notifier = load_notifier(&config.fcm.credentials);

    let hub = spawn_hub(config.hub_settings(), tokens.clone(), notifier);
    info!(max_clients = config.max_clients, "Session hub started");

    let server = RelayServer::new(
        config.listen,
        hub,
        tokens,
        config.connection_settings(),
        cancel_token,
    );

    info!(listen = %server.listen_addr(), "Starting server");

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("callhub relay stopped");
    Ok(())
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
