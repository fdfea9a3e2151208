//! # Integration Tests
//!
//! 集成测试与端到端测试。
//!
//! 负责：
//! - 合约快照测试
//! - 配置 -> 模拟雷达 -> 扫描变换 -> 位图/记录 e2e
//! - 127.0.0.1 上的客户端/服务器、组播与心跳 e2e

#[cfg(test)]
mod contract_tests {
    use contracts::{azimuth_to_degs, degs_to_azimuth, ScError, MAX_DESTINATIONS, RID_LIVE};

    #[test]
    fn test_contracts_compile() {
        let _ = contracts::ConfigVersion::V1;
        assert_eq!(RID_LIVE, 0);
        assert_eq!(MAX_DESTINATIONS, 2);
    }

    #[test]
    fn test_azimuth_scale() {
        assert_eq!(degs_to_azimuth(90.0), 16384);
        assert!((azimuth_to_degs(32768) - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_config_is_valid() {
        let blueprint = config_loader::ConfigLoader::load_from_str(
            include_str!("../../../scconv.toml"),
            config_loader::ConfigFormat::Toml,
        )
        .unwrap();
        assert!(blueprint.mcast.is_some());
        assert_eq!(blueprint.feed.targets.len(), 2);
    }

    #[test]
    fn test_error_codes_survive_the_wire() {
        let err = ScError::not_supported("set_radar_lut", "remote");
        let back = ScError::from_code(err.code(), err.to_string());
        assert!(back.is_not_supported());
    }
}

#[cfg(test)]
mod e2e_helpers {
    use std::time::{Duration, Instant};

    use contracts::{Return, ScBlueprint, ScanConfig, View, WinGeom};
    use contracts::{FadeSettings, FadeType};

    pub const SIZE: u16 = 64;

    /// 64x64 window over a 640 m square, replace fade
    pub fn scan_config() -> ScanConfig {
        let mut blueprint = ScBlueprint::with_window(SIZE, SIZE, WinGeom::new(0, 0, SIZE, SIZE));
        blueprint.scan.view = View::new(0.0, 0.0, 640.0, 640.0);
        blueprint.scan.pim_azimuths = 256;
        blueprint.scan.pim_samples = 256;
        blueprint.scan.output_interval_ms = 10;
        blueprint.scan.fade = FadeSettings {
            fade_type: FadeType::Replace,
            rate: 1,
        };
        blueprint.scan
    }

    /// One full revolution of constant `level`
    pub fn turn(level: u8) -> Vec<Return> {
        (0..256)
            .map(|i| Return::new_u8((i * 256) as u16, 0.0, 1280.0, vec![level; 256]))
            .collect()
    }

    /// Poll `done` every 20 ms, running `step` first, until true or 5 s pass
    pub async fn wait_until(mut step: impl FnMut(), mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            step();
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        done()
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::collections::HashMap;
    use std::net::UdpSocket;
    use std::sync::Arc;
    use std::time::Duration;

    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::{
        BitmapType, DestRef, FadeType, Return, ReturnCallback, ScControl, SinkConfig, SinkType,
        RID_LIVE,
    };
    use destinations::{read_recording, BitmapDest, FanoutDest};
    use radar_feed::{forward, FeedPipeline, SimulatedRadar};
    use scan_core::ScanConverter;
    use scnet::{
        DestMcast, DestNet, HeartbeatMonitor, NetContext, ScServer, SourceMcast, DEFAULT_APP_ID,
    };

    use crate::e2e_helpers::{scan_config, turn, wait_until, SIZE};

    const PIPELINE_TOML: &str = r#"
[display]
max_width = 96
max_height = 96

[scan]
pim_azimuths = 512
output_interval_ms = 20
window = { x = 0, y = 0, w = 96, h = 96 }
view = { x = 0.0, y = 0.0, w = 2000.0, h = 2000.0 }

[scan.fade]
fade_type = "replace"
rate = 1

[feed]
rpm = 240.0
azimuths_per_rev = 512
samples = 128
end_range_m = 1000.0
batch_azimuths = 32

[[feed.targets]]
range_m = 500.0
bearing_deg = 180.0
extent_m = 200.0
level = 150
"#;

    fn bitmap(name: &str) -> Arc<BitmapDest> {
        Arc::new(BitmapDest::create(name, SIZE, SIZE, BitmapType::Index8, None, 0).unwrap())
    }

    /// Config file -> simulated radar -> feed queue -> converter -> bitmap + recorder
    #[tokio::test]
    async fn test_e2e_config_into_running_pipeline() {
        let mut blueprint = ConfigLoader::load_from_str(PIPELINE_TOML, ConfigFormat::Toml).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let recording = dir.path().join("live.screc");
        blueprint.sinks = vec![SinkConfig {
            name: "recorder".to_string(),
            sink_type: SinkType::File,
            queue_capacity: 64,
            params: HashMap::from([("path".to_string(), recording.display().to_string())]),
        }];
        ConfigLoader::validate(&blueprint).unwrap();

        let max = (blueprint.display.max_width, blueprint.display.max_height);
        let live = Arc::new(
            BitmapDest::create("live", max.0, max.1, blueprint.display.bitmap_type, None, 0).unwrap(),
        );
        let primary: DestRef = live.clone();
        let fanout = Arc::new(FanoutDest::with_sinks(primary, &blueprint.sinks).await.unwrap());
        let converter = ScanConverter::new("e2e", &blueprint.scan, max).unwrap();
        converter
            .add_dest(RID_LIVE, fanout.clone(), (FadeType::Replace, 1))
            .unwrap();
        assert!(converter.wait_for_tables(Duration::from_secs(5)));

        let mut pipeline = FeedPipeline::new(blueprint.feed.queue_capacity);
        pipeline.register_source(Box::new(SimulatedRadar::new("sim", blueprint.feed.clone())));
        let feeder = converter.clone();
        let sink: ReturnCallback = Arc::new(move |batch: Vec<Return>| {
            feeder.new_data(true, &batch, 0, batch.len()).unwrap();
        });
        let task = tokio::spawn(forward(pipeline.take_receiver().unwrap(), pipeline.metrics(), sink));
        pipeline.start_all();

        // target due south of the centre
        let hit = wait_until(
            || {
                converter.tick();
            },
            || live.value_at(48, 72) == 150,
        )
        .await;
        pipeline.close();
        let batches = task.await.unwrap();
        converter.flush();
        fanout.shutdown().await;

        assert!(hit, "target never drawn");
        assert!(batches > 0);
        assert_eq!(live.value_at(48, 20), 0);
        let records = read_recording(&recording).unwrap();
        assert!(!records.is_empty());
        assert!(records.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    /// Two display clients on 127.0.0.1, each with its own window
    #[tokio::test]
    async fn test_e2e_server_feeds_two_windows() {
        let mut server = ScServer::bind(Arc::new(NetContext::loopback()), scan_config()).await;
        let addr = server.local_addr().unwrap();
        let feed = server.feeder();
        let stop = server.stop_handle();
        let task = tokio::spawn(async move {
            let result = server.run().await;
            (server, result)
        });

        let ctx = Arc::new(NetContext::loopback().with_server(addr));
        let (left, right) = (bitmap("left"), bitmap("right"));
        let client_a = DestNet::new(Arc::clone(&ctx), 1, left.clone());
        let client_b = DestNet::new(Arc::clone(&ctx), 2, right.clone());
        client_a.connect(Duration::from_secs(2)).await.unwrap();
        client_b.connect(Duration::from_secs(2)).await.unwrap();
        client_a.send_command(scnet::Command::Ping).await.unwrap();
        client_b.send_command(scnet::Command::Ping).await.unwrap();

        let returns = turn(90);
        let both = wait_until(
            || feed(returns.clone()),
            || left.value_at(32, 32) == 90 && right.value_at(32, 32) == 90,
        )
        .await;
        assert!(both);

        // control calls are posted in order ahead of the query
        client_a.set_rotation_degs(45.0).unwrap();
        assert_eq!(client_a.get_parameter("rotation").await.unwrap(), "45");
        assert_eq!(client_b.get_parameter("rotation").await.unwrap(), "0");

        client_a.disconnect().await;
        client_b.disconnect().await;
        stop.stop();
        let (server, result) = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        result.unwrap();
        assert_eq!(server.num_converters(), 0);
    }

    /// Converter -> DestMcast -> UDP -> SourceMcast -> bitmap
    #[tokio::test]
    async fn test_e2e_multicast_window() {
        let display = bitmap("mcast-display");
        let target: DestRef = display.clone();
        let mut source = SourceMcast::bind(
            "127.0.0.1:0".parse().unwrap(),
            std::net::Ipv4Addr::LOCALHOST,
            7,
            target,
        )
        .await
        .unwrap();
        let listen = source.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let receiver = tokio::spawn(async move {
            source
                .run(async {
                    let _ = stop_rx.await;
                })
                .await;
            source.stats()
        });

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let sender = Arc::new(DestMcast::new(socket, listen, 7, (SIZE, SIZE), Duration::from_millis(50)));
        let converter = ScanConverter::new("mcast", &scan_config(), (SIZE, SIZE)).unwrap();
        converter
            .add_dest(RID_LIVE, sender.clone(), (FadeType::Replace, 1))
            .unwrap();

        let returns = turn(60);
        let drawn = wait_until(
            || {
                converter.new_data(true, &returns, 0, returns.len()).unwrap();
                converter.tick();
                sender.refresh_if_due().unwrap();
            },
            || display.value_at(10, 10) == 60,
        )
        .await;
        let _ = stop_tx.send(());
        let stats = tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .unwrap()
            .unwrap();

        assert!(drawn);
        assert!(stats.configs >= 1);
        assert!(stats.patch_sets >= 1);
        assert_eq!(stats.malformed, 0);
        assert!(sender.messages_sent() >= stats.configs + stats.patch_sets);
    }

    /// A running server announces itself to the heartbeat monitor
    #[tokio::test]
    async fn test_e2e_server_heartbeats() {
        let mut monitor = HeartbeatMonitor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let watcher = monitor.start().unwrap();
        let mut ctx = NetContext::loopback().with_heartbeat_addr(monitor.local_addr());
        ctx.heartbeat_interval = Duration::from_millis(50);

        let mut server = ScServer::bind(Arc::new(ctx), scan_config()).await;
        let port = server.local_addr().unwrap().port();
        let stop = server.stop_handle();
        let task = tokio::spawn(async move { server.run().await });

        let alive = wait_until(|| {}, || monitor.is_alive(DEFAULT_APP_ID, Duration::from_secs(1))).await;
        stop.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        watcher.abort();

        assert!(alive);
        let peers = monitor.peers();
        assert_eq!(peers[0].heartbeat.listening_port, port);
        assert_eq!(peers[0].heartbeat.state, 1);
    }
}
