use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use scenemesh_core::{FrameworkLock, logging, paths};
use scenemesh_network::config::DaemonAddress;
use scenemesh_network::{ConnectionSystem, DAEMON_ID, NetworkConfig};

const DEFAULT_PORT: u16 = 5999;

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "scenemesh-daemon")]
#[command(about = "Relay daemon that introduces SceneMesh participants to each other")]
struct Args {
    /// JSON config file (defaults to ~/.scenemesh/network.json when present)
    #[arg(short, long, env = "SCENEMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Participant name announced to peers
    #[arg(long)]
    name: Option<String>,

    /// IP announced to peers
    #[arg(long)]
    ip: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "SCENEMESH_PORT")]
    port: Option<u16>,

    /// IP of another daemon to join
    #[arg(long, requires = "daemon_port")]
    daemon_ip: Option<String>,

    /// Port of another daemon to join
    #[arg(long)]
    daemon_port: Option<u16>,

    /// Relay addresses only, never exchange scene content
    #[arg(long)]
    pure: bool,

    /// Write logs here instead of ~/.scenemesh/logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Seconds between "Connected Participant(s)" log lines; 0 disables
    #[arg(long, default_value_t = 10)]
    periodic_log_secs: u64,
}

impl Args {
    fn config_path(&self) -> Option<PathBuf> {
        match &self.config {
            Some(path) => Some(path.clone()),
            None => paths::network_config_path().ok().filter(|p| p.exists()),
        }
    }

    /// File config (or daemon defaults) with command-line overrides applied.
    fn build_config(&self) -> NetworkConfig {
        let mut config = match self.config_path() {
            Some(path) if path.exists() => NetworkConfig::load_or_default(&path),
            _ => {
                let mut config = NetworkConfig::daemon("daemon", DEFAULT_PORT);
                config.participant_id = DAEMON_ID;
                config
            }
        };

        config.relay = true;
        if self.pure {
            config.pure_daemon = true;
        }
        if let Some(name) = &self.name {
            config.participant_name = name.clone();
        }
        if let Some(ip) = &self.ip {
            config.ip = ip.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(port) = self.daemon_port {
            config.daemon = Some(DaemonAddress {
                ip: self.daemon_ip.clone().unwrap_or_else(|| config.ip.clone()),
                port,
            });
        }
        config
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = match &args.log_dir {
        Some(dir) => logging::init_logging_to_dir(dir, "daemon", "info,scenemesh_network=debug")?,
        None => {
            paths::ensure_dirs()?;
            logging::init_logging("daemon")?
        }
    };

    let config = args.build_config();
    info!(
        "Starting {} daemon '{}' ({}) on {}:{}",
        config.participant_type(),
        config.participant_name,
        config.participant_id,
        config.ip,
        config.port
    );
    if let Some(other) = config.other_daemon() {
        info!("Joining daemon at {}:{}", other.ip, other.port);
    }

    let system = ConnectionSystem::new(config, FrameworkLock::new());
    if !system.connect_services() {
        bail!("failed to start connection system");
    }
    let port = system
        .listening_port()
        .context("connection system reported no listening port")?;
    info!("Listening on port {port}");
    system.log_connection_info();

    run_until_shutdown(&system, args.periodic_log_secs).await;

    if !system.disconnect_services() {
        warn!("Connection system was already stopped");
    }
    info!("Daemon stopped");
    Ok(())
}

async fn run_until_shutdown(system: &ConnectionSystem, periodic_log_secs: u64) {
    if periodic_log_secs == 0 {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
        }
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(periodic_log_secs));
    ticker.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Cannot listen for Ctrl-C: {e}");
                }
                info!("Shutdown requested");
                return;
            }
            _ = ticker.tick() => system.trigger_log_message_for_periodic_log(),
        }
    }
}
