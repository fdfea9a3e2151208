//! `simulate` command implementation.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use contracts::{DestRef, Return, ReturnCallback, ScBlueprint, RID_LIVE};
use destinations::{BitmapDest, FanoutDest};
use scan_core::ScanConverter;
use tracing::{info, warn};

use crate::cli::SimulateArgs;
use crate::session::{self, LocalFeed, RunStats};

/// Radar id of the trails destination
const RID_TRAILS: u8 = 1;

/// Execute the `simulate` command
pub async fn run_simulate(args: &SimulateArgs) -> Result<()> {
    session::init_metrics(&args.run)?;
    let mut blueprint = session::load_blueprint(&args.run.config)?;
    if let Some(rpm) = args.rpm {
        info!(rpm, "Overriding rotation rate from CLI");
        blueprint.feed.rpm = rpm;
    }

    let stop = session::stop_requested(args.run.duration);
    let sim = simulate(&blueprint, args.seed, args.run.report_every, stop).await?;

    let snapshot = args
        .snapshot
        .clone()
        .or_else(|| blueprint.display.snapshot_path.as_ref().map(PathBuf::from));
    if let Some(path) = snapshot {
        write_snapshot(&sim.live, &path)?;
        if let Some(trails) = &sim.trails {
            write_snapshot(trails, &trails_path(&path))?;
        }
    }

    sim.stats.print_summary();
    Ok(())
}

pub(crate) struct Simulation {
    pub stats: RunStats,
    pub live: Arc<BitmapDest>,
    pub trails: Option<Arc<BitmapDest>>,
}

/// Feed the simulated radar through one converter until `stop` resolves
pub(crate) async fn simulate(
    blueprint: &ScBlueprint,
    seed: u64,
    report_every: u64,
    stop: impl Future<Output = ()>,
) -> Result<Simulation> {
    let display = &blueprint.display;
    let max_size = (display.max_width, display.max_height);
    let converter = ScanConverter::new("simulate", &blueprint.scan, max_size)?;

    let live = Arc::new(BitmapDest::create(
        "live",
        max_size.0,
        max_size.1,
        display.bitmap_type,
        None,
        0,
    )?);
    live.set_fade_interval(Duration::from_millis(display.fade_interval_ms));
    let primary: DestRef = live.clone();
    let fanout = Arc::new(
        FanoutDest::with_sinks(primary, &blueprint.sinks)
            .await
            .context("Failed to start sinks")?,
    );
    let fade = &blueprint.scan.fade;
    converter.add_dest(RID_LIVE, fanout.clone(), (fade.fade_type, fade.rate))?;

    let trails = match &blueprint.scan.trails {
        Some(settings) => {
            let bitmap = Arc::new(BitmapDest::create(
                "trails",
                max_size.0,
                max_size.1,
                display.bitmap_type,
                None,
                0,
            )?);
            converter.add_dest(RID_TRAILS, bitmap.clone(), (settings.fade_type, settings.rate))?;
            Some(bitmap)
        }
        None => None,
    };

    if !converter.wait_for_tables(Duration::from_secs(5)) {
        warn!("Pixel tables not ready, early returns will be dropped");
    }

    let feeder = converter.clone();
    let sink: ReturnCallback = Arc::new(move |batch: Vec<Return>| {
        if let Err(e) = feeder.new_data(true, &batch, 0, batch.len()) {
            warn!(error = %e, "scan conversion failed");
        }
    });
    let feed = LocalFeed::start(&blueprint.feed, seed, sink)?;

    let started = Instant::now();
    let mut stats = RunStats::default();
    let mut report = session::report_interval(report_every);
    let mut output = tokio::time::interval(Duration::from_millis(
        blueprint.scan.output_interval_ms.max(1),
    ));
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = output.tick() => {
                if let Some(out) = converter.tick() {
                    observability::record_output_metrics("simulate", &out);
                    stats.record(&out);
                }
            }
            _ = report.tick() => {
                let summary = stats.scan.summary();
                info!(
                    returns = summary.total_returns,
                    patches = summary.total_patches,
                    feed_dropped = feed.batches_dropped(),
                    revolution_ms = converter.revolution_period().map(|p| p.as_millis() as u64),
                    "Simulating"
                );
            }
        }
    }

    let (fed, dropped) = feed.finish().await?;
    stats.record(&converter.flush());
    stats.batches_fed = fed;
    stats.batches_dropped = dropped;
    stats.duration = started.elapsed();
    fanout.shutdown().await;

    Ok(Simulation {
        stats,
        live,
        trails,
    })
}

fn write_snapshot(bitmap: &BitmapDest, path: &Path) -> Result<()> {
    bitmap
        .snapshot_png(path)
        .with_context(|| format!("Failed to write snapshot {}", path.display()))?;
    info!(path = %path.display(), "Snapshot written");
    Ok(())
}

/// `radar.png` -> `radar-trails.png`
fn trails_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "png".to_string());
    path.with_file_name(format!("{stem}-trails.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{FadeSettings, FadeType, TargetConfig, View, WinGeom};

    fn blueprint() -> ScBlueprint {
        let mut bp = ScBlueprint::with_window(128, 128, WinGeom::new(0, 0, 128, 128));
        bp.scan.view = View::new(0.0, 0.0, 2000.0, 2000.0);
        bp.scan.pim_azimuths = 512;
        bp.scan.output_interval_ms = 20;
        bp.scan.fade = FadeSettings {
            fade_type: FadeType::Replace,
            rate: 1,
        };
        bp.scan.trails = Some(FadeSettings {
            fade_type: FadeType::RealTime,
            rate: 1,
        });
        bp.feed.rpm = 240.0;
        bp.feed.azimuths_per_rev = 512;
        bp.feed.samples = 128;
        bp.feed.end_range_m = 1000.0;
        bp.feed.noise_level = 0;
        bp.feed.batch_azimuths = 32;
        bp.feed.targets = vec![TargetConfig {
            range_m: 500.0,
            bearing_deg: 90.0,
            extent_m: 200.0,
            level: 180,
            speed_mps: 0.0,
            course_deg: 0.0,
        }];
        bp
    }

    #[tokio::test]
    async fn simulated_target_reaches_the_bitmap() {
        let bp = blueprint();
        let sim = simulate(&bp, 7, 0, tokio::time::sleep(Duration::from_millis(400)))
            .await
            .unwrap();
        assert!(sim.stats.batches_fed > 0);
        assert!(sim.stats.scan.total_returns > 0);
        assert!(sim.stats.scan.total_patches > 0);
        let guard = sim.live.lock_bitmap();
        assert!(guard.pixels().iter().any(|v| *v > 0));
        assert!(sim.trails.is_some());
    }

    #[test]
    fn trails_snapshot_name() {
        assert_eq!(
            trails_path(Path::new("/tmp/out/radar.png")),
            PathBuf::from("/tmp/out/radar-trails.png")
        );
        assert_eq!(trails_path(Path::new("shot")), PathBuf::from("shot-trails.png"));
    }
}
