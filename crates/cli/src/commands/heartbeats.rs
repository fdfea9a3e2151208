//! `heartbeats` command implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use scnet::{HeartbeatMonitor, PeerStatus};
use tracing::info;

use crate::cli::HeartbeatsArgs;
use crate::session;

/// Execute the `heartbeats` command
pub async fn run_heartbeats(args: &HeartbeatsArgs) -> Result<()> {
    let addr = match args.listen {
        Some(addr) => addr,
        None => {
            let net = session::load_blueprint(&args.config)?.net;
            let ip = net
                .heartbeat_group
                .parse()
                .with_context(|| format!("Bad heartbeat group '{}'", net.heartbeat_group))?;
            SocketAddr::new(ip, net.heartbeat_port)
        }
    };

    let mut monitor = HeartbeatMonitor::bind(addr)
        .await
        .with_context(|| format!("Failed to listen for heartbeats on {addr}"))?;
    info!(listen = %monitor.local_addr(), "Watching heartbeats");

    let peers = watch(
        &mut monitor,
        Duration::from_secs(args.every.max(1)),
        session::stop_requested(args.duration),
    )
    .await;

    println!("\n{} server(s) seen, {} malformed datagram(s)", peers.len(), monitor.malformed_count());
    Ok(())
}

/// Print the peer table every `every` until `stop`; returns the final table
pub(crate) async fn watch(
    monitor: &mut HeartbeatMonitor,
    every: Duration,
    stop: impl Future<Output = ()>,
) -> Vec<PeerStatus> {
    let task = monitor.start();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => print_peers(&monitor.peers()),
        }
    }
    if let Some(task) = task {
        task.abort();
    }
    let mut peers = monitor.peers();
    peers.sort_by_key(|p| p.from);
    peers
}

fn print_peers(peers: &[PeerStatus]) {
    if peers.is_empty() {
        println!("(no heartbeats yet)");
        return;
    }
    let now = Instant::now();
    println!(
        "{:<22} {:>6} {:>6} {:>5} {:>6} {:>8} {:>7}",
        "FROM", "APP", "PORT", "STATE", "WINDOWS", "AGE(ms)", "COUNT"
    );
    for peer in peers {
        let hb = &peer.heartbeat;
        println!(
            "{:<22} {:>#6x} {:>6} {:>5} {:>6} {:>8} {:>7}",
            peer.from.to_string(),
            hb.app_id,
            hb.listening_port,
            if hb.state == 1 { "run" } else { "idle" },
            hb.num_channels,
            now.saturating_duration_since(peer.last_seen).as_millis(),
            peer.count
        );
    }
}
