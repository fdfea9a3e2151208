//! `info` command implementation.

use anyhow::{Context, Result};
use contracts::ScBlueprint;
use serde::Serialize;
use tracing::info;

use crate::cli::InfoArgs;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    version: String,
    display: DisplayInfo,
    window: WindowInfo,
    net: NetInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    mcast: Option<McastInfo>,
    feed: FeedInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    scan: Option<ScanInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sinks: Vec<SinkInfo>,
}

#[derive(Serialize)]
struct DisplayInfo {
    max_width: u16,
    max_height: u16,
    bitmap_type: String,
}

#[derive(Serialize)]
struct WindowInfo {
    x: i16,
    y: i16,
    w: u16,
    h: u16,
    view_m: [f32; 4],
    fade: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    trails: Option<String>,
}

#[derive(Serialize)]
struct NetInfo {
    command: String,
    heartbeat: String,
    max_windows: usize,
}

#[derive(Serialize)]
struct McastInfo {
    group: String,
    window_id: u16,
}

#[derive(Serialize)]
struct FeedInfo {
    rpm: f32,
    azimuths_per_rev: u16,
    samples: u16,
    end_range_m: f32,
    targets: usize,
}

#[derive(Serialize)]
struct ScanInfo {
    pim_azimuths: u16,
    zone_size: u16,
    output_interval_ms: u64,
    ssc_enabled: bool,
    true_trail_ranges: Vec<f32>,
}

#[derive(Serialize)]
struct SinkInfo {
    name: String,
    sink_type: String,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {}", args.config.display());
    }

    let blueprint = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if args.json {
        let info = build_config_info(&blueprint, args);
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&blueprint, args);
    }

    Ok(())
}

fn fade_label(settings: &contracts::FadeSettings) -> String {
    format!("{:?} (rate {})", settings.fade_type, settings.rate)
}

fn build_config_info(blueprint: &ScBlueprint, args: &InfoArgs) -> ConfigInfo {
    let scan = &blueprint.scan;
    let net = &blueprint.net;

    let sinks = if args.sinks {
        blueprint
            .sinks
            .iter()
            .map(|s| SinkInfo {
                name: s.name.clone(),
                sink_type: format!("{:?}", s.sink_type),
            })
            .collect()
    } else {
        Vec::new()
    };

    let scan_info = args.scan.then(|| ScanInfo {
        pim_azimuths: scan.pim_azimuths,
        zone_size: scan.zone_size,
        output_interval_ms: scan.output_interval_ms,
        ssc_enabled: scan.ssc.enabled,
        true_trail_ranges: scan.true_trails.ranges.clone(),
    });

    ConfigInfo {
        version: format!("{:?}", blueprint.version),
        display: DisplayInfo {
            max_width: blueprint.display.max_width,
            max_height: blueprint.display.max_height,
            bitmap_type: format!("{:?}", blueprint.display.bitmap_type),
        },
        window: WindowInfo {
            x: scan.window.x,
            y: scan.window.y,
            w: scan.window.w,
            h: scan.window.h,
            view_m: [scan.view.x, scan.view.y, scan.view.w, scan.view.h],
            fade: fade_label(&scan.fade),
            trails: scan.trails.as_ref().map(fade_label),
        },
        net: NetInfo {
            command: format!("{}:{}", net.server_host, net.command_port),
            heartbeat: format!("{}:{}", net.heartbeat_group, net.heartbeat_port),
            max_windows: net.max_windows,
        },
        mcast: blueprint.mcast.as_ref().map(|m| McastInfo {
            group: format!("{}:{}", m.group, m.port),
            window_id: m.window_id,
        }),
        feed: FeedInfo {
            rpm: blueprint.feed.rpm,
            azimuths_per_rev: blueprint.feed.azimuths_per_rev,
            samples: blueprint.feed.samples,
            end_range_m: blueprint.feed.end_range_m,
            targets: blueprint.feed.targets.len(),
        },
        scan: scan_info,
        sinks,
    }
}

fn print_config_info(blueprint: &ScBlueprint, args: &InfoArgs) {
    let scan = &blueprint.scan;
    let net = &blueprint.net;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                scconv Configuration                          ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    println!("🖥  Display");
    println!("   ├─ Version: {:?}", blueprint.version);
    println!(
        "   ├─ Max size: {}x{}",
        blueprint.display.max_width, blueprint.display.max_height
    );
    println!("   └─ Bitmap: {:?}", blueprint.display.bitmap_type);

    println!("\n📐 Window");
    println!(
        "   ├─ Geometry: {}x{} at ({}, {})",
        scan.window.w, scan.window.h, scan.window.x, scan.window.y
    );
    println!(
        "   ├─ View: {}x{} m centred on ({}, {})",
        scan.view.w, scan.view.h, scan.view.x, scan.view.y
    );
    println!("   ├─ Fade: {}", fade_label(&scan.fade));
    match &scan.trails {
        Some(trails) => println!("   └─ Trails: {}", fade_label(trails)),
        None => println!("   └─ Trails: off"),
    }

    if args.scan {
        println!("\n⚙️  Scan Conversion");
        println!("   ├─ PIM azimuths: {}", scan.pim_azimuths);
        println!("   ├─ Zone size: {}", scan.zone_size);
        println!("   ├─ Output interval: {} ms", scan.output_interval_ms);
        println!(
            "   ├─ SSC: {}",
            if scan.ssc.enabled { "on" } else { "off" }
        );
        println!("   └─ True trail ranges: {:?}", scan.true_trails.ranges);
    }

    println!("\n🌐 Network");
    println!("   ├─ Command: {}:{}", net.server_host, net.command_port);
    println!(
        "   ├─ Heartbeats: {}:{}",
        net.heartbeat_group, net.heartbeat_port
    );
    match &blueprint.mcast {
        Some(m) => println!(
            "   └─ Multicast: {}:{} (window {})",
            m.group, m.port, m.window_id
        ),
        None => println!("   └─ Multicast: off"),
    }

    let feed = &blueprint.feed;
    println!("\n📡 Simulated Feed");
    println!("   ├─ Rotation: {} rpm", feed.rpm);
    println!(
        "   ├─ Returns: {} per revolution, {} samples to {} m",
        feed.azimuths_per_rev, feed.samples, feed.end_range_m
    );
    println!("   └─ Targets: {}", feed.targets.len());

    if args.sinks && !blueprint.sinks.is_empty() {
        println!("\n📤 Sinks ({})", blueprint.sinks.len());
        for (i, sink) in blueprint.sinks.iter().enumerate() {
            let is_last = i == blueprint.sinks.len() - 1;
            let prefix = if is_last { "└─" } else { "├─" };
            println!("   {} {} ({:?})", prefix, sink.name, sink.sink_type);
        }
    }

    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{McastConfig, WinGeom};
    use std::path::PathBuf;

    #[test]
    fn json_info_follows_flags() {
        let mut bp = ScBlueprint::with_window(512, 512, WinGeom::new(10, 20, 300, 200));
        bp.mcast = Some(McastConfig {
            group: "239.1.1.1".into(),
            port: 4378,
            interface: "0.0.0.0".into(),
            window_id: 5,
            config_interval_ms: 1000,
        });
        let args = InfoArgs {
            config: PathBuf::from("unused.toml"),
            json: true,
            scan: false,
            sinks: false,
        };
        let value = serde_json::to_value(build_config_info(&bp, &args)).unwrap();
        assert_eq!(value["window"]["w"], 300);
        assert_eq!(value["mcast"]["group"], "239.1.1.1:4378");
        assert!(value.get("scan").is_none());
        assert!(value.get("sinks").is_none());
    }
}
