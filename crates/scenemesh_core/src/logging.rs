//! Tracing setup shared by SceneMesh processes.
//!
//! Every process writes a daily-rolling file named after its component
//! (`scenemesh-daemon.2026-10-19`), so a daemon and a renderer sharing one
//! log directory do not interleave. The filter comes from `SCENEMESH_LOG`,
//! then `RUST_LOG`, then the caller's default.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::paths;

/// Filter override read before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "SCENEMESH_LOG";

pub const DEFAULT_FILTER: &str = "info,scenemesh_network=debug,scenemesh_daemon=debug";

/// File name prefix for `component`'s log files.
pub fn log_file_prefix(component: &str) -> String {
    if component.is_empty() {
        "scenemesh".to_string()
    } else {
        format!("scenemesh-{component}")
    }
}

/// The first non-blank of `SCENEMESH_LOG`, `RUST_LOG` and `fallback`.
fn filter_directives(scenemesh_log: Option<String>, rust_log: Option<String>, fallback: &str) -> String {
    [scenemesh_log, rust_log]
        .into_iter()
        .flatten()
        .find(|d| !d.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn env_filter(fallback: &str) -> EnvFilter {
    let directives = filter_directives(
        std::env::var(LOG_ENV_VAR).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        fallback,
    );
    EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("Ignoring log filter '{directives}': {e}");
        EnvFilter::new(fallback)
    })
}

/// File output for `component` under `~/.scenemesh/logs`, plus a compact
/// console layer. Keep the guard alive for the whole process.
pub fn init_logging(component: &str) -> Result<WorkerGuard> {
    let logs_dir = paths::logs_dir()?;
    install(&logs_dir, component, DEFAULT_FILTER, true)
}

/// File-only output for `component` under `logs_dir`. Used by the daemon's
/// `--log-dir` and by tests.
pub fn init_logging_to_dir(logs_dir: &Path, component: &str, filter: &str) -> Result<WorkerGuard> {
    install(logs_dir, component, filter, false)
}

fn install(logs_dir: &Path, component: &str, filter: &str, console: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, log_file_prefix(component));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(console.then(|| fmt::layer().with_target(false).compact()))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}
