//! Shared plumbing for the long running commands.

mod feed;
mod stats;

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use contracts::ScBlueprint;
use tracing::{info, warn};

use crate::cli::RunOptions;
use crate::error::CliError;

pub use feed::LocalFeed;
pub use stats::RunStats;

/// Load and validate a blueprint, failing early on a missing file
pub fn load_blueprint(path: &Path) -> crate::error::Result<ScBlueprint> {
    if !path.exists() {
        return Err(CliError::config_not_found(path));
    }
    let blueprint = config_loader::ConfigLoader::load_from_path(path)
        .map_err(|e| CliError::config(path, e))?;
    info!(
        config = %path.display(),
        window = ?blueprint.scan.window,
        sinks = blueprint.sinks.len(),
        "Configuration loaded"
    );
    Ok(blueprint)
}

/// Start the Prometheus exporter when a port is given
pub fn init_metrics(options: &RunOptions) -> anyhow::Result<()> {
    if options.metrics_port != 0 {
        observability::init_metrics_only(options.metrics_port)
            .context("Failed to start metrics endpoint")?;
        info!(port = options.metrics_port, "Metrics endpoint available");
    }
    Ok(())
}

/// Resolves on Ctrl+C, SIGTERM, or after `duration_secs` when non-zero
pub async fn stop_requested(duration_secs: u64) {
    let deadline = async {
        if duration_secs == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(duration_secs)).await;
        }
    };
    tokio::select! {
        _ = shutdown_signal() => warn!("Received shutdown signal, stopping..."),
        _ = deadline => info!(seconds = duration_secs, "Run duration reached"),
    }
}

/// Interval for progress reports; never fires when `secs` is 0
pub fn report_interval(secs: u64) -> tokio::time::Interval {
    let period = if secs == 0 {
        Duration::from_secs(u32::MAX as u64)
    } else {
        Duration::from_secs(secs)
    };
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

/// Ctrl+C and SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
