//! `serve` command implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use contracts::{DestRef, Return, ReturnCallback, ScBlueprint, RID_LIVE};
use scan_core::ScanConverter;
use scnet::{DestMcast, NetContext, ScServer};
use tracing::{debug, info, warn};

use crate::cli::ServeArgs;
use crate::error::CliError;
use crate::session::{self, LocalFeed, RunStats};

/// Execute the `serve` command
pub async fn run_serve(args: &ServeArgs) -> Result<()> {
    session::init_metrics(&args.run)?;
    let mut blueprint = session::load_blueprint(&args.run.config)?;

    if let Some(ref host) = args.host {
        info!(host = %host, "Overriding server host from CLI");
        blueprint.net.server_host = host.clone();
    }
    if let Some(port) = args.port {
        info!(port, "Overriding command port from CLI");
        blueprint.net.command_port = port;
    }

    let ctx = Arc::new(NetContext::from_config(&blueprint.net)?);
    let mut server = ScServer::bind(Arc::clone(&ctx), blueprint.scan.clone()).await;
    let addr = server
        .local_addr()
        .with_context(|| format!("Failed to bind command port {}", ctx.server))?;
    info!(%addr, max_windows = ctx.max_windows, "Accepting displays");

    let mcast = if args.mcast {
        Some(mcast_converter(&blueprint)?)
    } else {
        None
    };

    let feed = if args.no_feed {
        None
    } else {
        let sink = feed_sink(server.feeder(), mcast.as_ref().map(|(sc, _)| sc.clone()));
        Some(LocalFeed::start(&blueprint.feed, 0x5eed, sink)?)
    };

    let stop = server.stop_handle();
    let server_task = tokio::spawn(async move {
        let result = server.run().await;
        (server, result)
    });

    let started = Instant::now();
    let mut stats = RunStats::default();
    let mut report = session::report_interval(args.run.report_every);
    let mut output = tokio::time::interval(Duration::from_millis(
        blueprint.scan.output_interval_ms.max(1),
    ));
    let stopped = session::stop_requested(args.run.duration);
    tokio::pin!(stopped);

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = output.tick(), if mcast.is_some() => {
                if let Some((converter, dest)) = &mcast {
                    if let Some(out) = converter.tick() {
                        observability::record_output_metrics("mcast", &out);
                        stats.record(&out);
                    }
                    if let Err(e) = dest.refresh_if_due() {
                        warn!(error = %e, "multicast refresh failed");
                    }
                }
            }
            _ = report.tick() => {
                info!(
                    uptime_secs = started.elapsed().as_secs(),
                    feed_dropped = feed.as_ref().map(LocalFeed::batches_dropped).unwrap_or(0),
                    mcast_messages = mcast.as_ref().map(|(_, d)| d.messages_sent()).unwrap_or(0),
                    "Serving"
                );
            }
        }
    }

    if let Some(feed) = feed {
        let (fed, dropped) = feed.finish().await?;
        stats.batches_fed = fed;
        stats.batches_dropped = dropped;
    }
    stop.stop();
    let (server, result) = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .context("Server did not stop in time")??;
    result.context("Command loop failed")?;
    debug!(windows = server.num_converters(), "server stopped");

    stats.duration = started.elapsed();
    stats.print_summary();
    info!("scconv server finished");
    Ok(())
}

/// Local converter whose live destination is the multicast sender
fn mcast_converter(blueprint: &ScBlueprint) -> Result<(ScanConverter, Arc<DestMcast>)> {
    let config = blueprint
        .mcast
        .as_ref()
        .ok_or(CliError::MissingSection { what: "mcast" })?;
    let max_size = (blueprint.display.max_width, blueprint.display.max_height);
    let dest = Arc::new(DestMcast::from_config(config, max_size)?);
    let converter = ScanConverter::new("mcast", &blueprint.scan, max_size)?;
    let live: DestRef = dest.clone();
    let fade = &blueprint.scan.fade;
    converter.add_dest(RID_LIVE, live, (fade.fade_type, fade.rate))?;
    info!(group = %config.group, port = config.port, window = config.window_id, "Multicast sender ready");
    Ok((converter, dest))
}

/// Every batch goes to the server's windows and the multicast converter
fn feed_sink(server: ReturnCallback, mcast: Option<ScanConverter>) -> ReturnCallback {
    Arc::new(move |batch: Vec<Return>| {
        if let Some(converter) = &mcast {
            if let Err(e) = converter.new_data(true, &batch, 0, batch.len()) {
                warn!(error = %e, "multicast conversion failed");
            }
        }
        server(batch);
    })
}
