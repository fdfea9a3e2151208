//! `display` command implementation.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use contracts::{DestRef, ScBlueprint};
use destinations::{BitmapDest, FanoutDest};
use scnet::{DestNet, NetContext, SourceMcast};
use tracing::{debug, info};

use crate::cli::DisplayArgs;
use crate::error::CliError;
use crate::session::{self, RunStats};

/// Execute the `display` command
pub async fn run_display(args: &DisplayArgs) -> Result<()> {
    session::init_metrics(&args.run)?;
    let blueprint = session::load_blueprint(&args.run.config)?;
    let display = &blueprint.display;

    let bitmap = Arc::new(BitmapDest::create(
        "display",
        display.max_width,
        display.max_height,
        display.bitmap_type,
        None,
        0,
    )?);
    let primary: DestRef = bitmap.clone();
    let fanout = Arc::new(
        FanoutDest::with_sinks(primary, &blueprint.sinks)
            .await
            .context("Failed to start sinks")?,
    );

    let started = Instant::now();
    let mut stats = if args.mcast {
        receive_mcast(args, &blueprint, fanout.clone()).await?
    } else {
        receive_net(args, &blueprint, fanout.clone(), &bitmap).await?
    };
    stats.duration = started.elapsed();

    for (sink, snapshot) in fanout.metrics() {
        info!(sink = %sink, written = snapshot.write_count, dropped = snapshot.dropped_count, "Sink totals");
    }
    fanout.shutdown().await;

    let snapshot = args
        .snapshot
        .clone()
        .or_else(|| display.snapshot_path.as_ref().map(PathBuf::from));
    if let Some(path) = snapshot {
        bitmap
            .snapshot_png(&path)
            .with_context(|| format!("Failed to write snapshot {}", path.display()))?;
        info!(path = %path.display(), "Snapshot written");
    }

    stats.print_summary();
    Ok(())
}

async fn receive_net(
    args: &DisplayArgs,
    blueprint: &ScBlueprint,
    target: Arc<FanoutDest>,
    bitmap: &BitmapDest,
) -> Result<RunStats> {
    let mut ctx = NetContext::from_config(&blueprint.net)?;
    if let Some(server) = args.server {
        ctx = ctx.with_server(server);
    }
    let ctx = Arc::new(ctx);
    let client = DestNet::new(Arc::clone(&ctx), args.window, target);
    client
        .connect(ctx.connect_timeout)
        .await
        .map_err(|e| CliError::connect(ctx.server, e))?;
    info!(server = %ctx.server, window = args.window, udp_port = ?client.udp_port(), "Connected");

    let mut report = session::report_interval(args.run.report_every);
    let stopped = session::stop_requested(args.run.duration);
    tokio::pin!(stopped);
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = report.tick() => {
                let client_stats = client.stats();
                info!(
                    state = ?client.state(),
                    packets = client_stats.packets.load(Ordering::Relaxed),
                    sets = client_stats.sets_applied.load(Ordering::Relaxed),
                    gaps = client_stats.gaps_skipped.load(Ordering::Relaxed),
                    dirty = ?bitmap.take_dirty_box(),
                    "Display"
                );
            }
        }
    }

    client.disconnect().await;
    let client_stats = client.stats();
    debug!(
        duplicates = client_stats.duplicates.load(Ordering::Relaxed),
        malformed = client_stats.malformed.load(Ordering::Relaxed),
        "client closed"
    );
    Ok(RunStats {
        sets_applied: client_stats.sets_applied.load(Ordering::Relaxed),
        ..RunStats::default()
    })
}

async fn receive_mcast(
    args: &DisplayArgs,
    blueprint: &ScBlueprint,
    target: Arc<FanoutDest>,
) -> Result<RunStats> {
    let config = blueprint
        .mcast
        .as_ref()
        .ok_or(CliError::MissingSection { what: "mcast" })?;
    let mut source = SourceMcast::from_config(config, target).await?;
    source.set_change_callback(|window, flags| {
        debug!(window, flags = %format!("{flags:#06x}"), "window state changed");
    });
    info!(group = %config.group, port = config.port, window = config.window_id, "Listening for multicast");

    source.run(session::stop_requested(args.run.duration)).await;

    let mcast = source.stats();
    info!(
        configs = mcast.configs,
        filtered = mcast.filtered,
        malformed = mcast.malformed,
        lost = mcast.lost,
        "Multicast receiver stopped"
    );
    Ok(RunStats {
        sets_applied: mcast.patch_sets,
        ..RunStats::default()
    })
}
