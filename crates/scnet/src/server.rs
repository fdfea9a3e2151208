//! ScServer - scan conversion served to remote displays
//!
//! Every client window gets its own `ScanConverter` whose live
//! destination is the window's `RemoteDisplay`. Returns fed to the server
//! go to all converters.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use contracts::{DestRef, Return, ReturnCallback, ScResult, ScanConfig, WinGeom, RID_LIVE};
use scan_core::ScanConverter;
use tracing::{info, warn};

use crate::context::NetContext;
use crate::source::{DisplayTarget, NetEvent, SourceNet, StopHandle};

impl DisplayTarget for ScanConverter {
    fn set_parameter(&self, name: &str, value: &str) -> ScResult<()> {
        ScanConverter::set_parameter(self, name, value)
    }

    fn get_parameter(&self, name: &str) -> ScResult<String> {
        ScanConverter::get_parameter(self, name)
    }

    fn clear_display(&self) -> ScResult<()> {
        self.clear()
    }

    fn service(&self) {
        if let Some(report) = self.tick() {
            observability::record_output_metrics(contracts::ScControl::name(self), &report);
        }
    }
}

type ConverterMap = Arc<Mutex<HashMap<u16, ScanConverter>>>;

pub struct ScServer {
    net: SourceNet,
    converters: ConverterMap,
}

impl ScServer {
    /// Bind sockets; new windows get a converter built from `template`
    /// with its window clamped to the client's display size.
    pub async fn bind(ctx: Arc<NetContext>, template: ScanConfig) -> Self {
        let mut net = SourceNet::bind(ctx).await;
        let converters: ConverterMap = Arc::default();

        let map = Arc::clone(&converters);
        net.set_display_factory(move |window_id, remote| {
            let (max_w, max_h) = contracts::ScDest::max_size(remote.as_ref());
            let mut config = template.clone();
            config.window = WinGeom::new(
                config.window.x,
                config.window.y,
                config.window.w.min(max_w),
                config.window.h.min(max_h),
            );
            let converter = ScanConverter::new(format!("window-{window_id}"), &config, (max_w, max_h))?;
            let dest: DestRef = remote;
            converter.add_dest(RID_LIVE, dest, (config.fade.fade_type, config.fade.rate))?;
            map.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(window_id, converter.clone());
            info!(window = window_id, w = config.window.w, h = config.window.h, "converter created");
            Ok(Arc::new(converter) as Arc<dyn DisplayTarget>)
        });

        let map = Arc::clone(&converters);
        net.set_event_handler(move |event| {
            if let NetEvent::DisplayRemoved(window_id) = event {
                let removed = map
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(window_id);
                if let Some(converter) = removed {
                    converter.remove_dest(RID_LIVE);
                    info!(window = window_id, "converter dropped");
                }
            }
        });
        Self { net, converters }
    }

    pub fn net(&mut self) -> &mut SourceNet {
        &mut self.net
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.net.local_addr()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.net.stop_handle()
    }

    pub fn num_converters(&self) -> usize {
        self.converters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn converter(&self, window_id: u16) -> Option<ScanConverter> {
        self.converters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&window_id)
            .cloned()
    }

    /// Scan convert one batch into every window
    pub fn feed(&self, returns: &[Return]) {
        feed_all(&self.converters, returns);
    }

    /// Callback for a `ReturnSource`
    pub fn feeder(&self) -> ReturnCallback {
        let converters = Arc::clone(&self.converters);
        Arc::new(move |returns: Vec<Return>| feed_all(&converters, &returns))
    }

    /// Serve until stopped, then drop every client
    pub async fn run(&mut self) -> ScResult<()> {
        let result = self.net.command_loop().await;
        self.net.shutdown();
        result
    }
}

fn feed_all(converters: &ConverterMap, returns: &[Return]) {
    // clone out so converters run without the map lock
    let targets: Vec<(u16, ScanConverter)> = converters
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(wid, sc)| (*wid, sc.clone()))
        .collect();
    for (window_id, converter) in targets {
        if let Err(e) = converter.new_data(true, returns, 0, returns.len()) {
            warn!(window = window_id, error = %e, "scan conversion failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DestNet;
    use contracts::{BitmapType, FadeSettings, FadeType, ScBlueprint, View};
    use destinations::BitmapDest;
    use std::time::{Duration, Instant};

    fn template() -> ScanConfig {
        let mut blueprint = ScBlueprint::with_window(64, 64, WinGeom::new(0, 0, 64, 64));
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

    fn turn(level: u8) -> Vec<Return> {
        (0..256)
            .map(|i| Return::new_u8((i * 256) as u16, 0.0, 1280.0, vec![level; 256]))
            .collect()
    }

    #[tokio::test]
    async fn remote_window_receives_converted_video() {
        let mut server = ScServer::bind(Arc::new(NetContext::loopback()), template()).await;
        let addr = server.local_addr().unwrap();
        let feed = server.feeder();
        let stop = server.stop_handle();
        let task = tokio::spawn(async move {
            let result = server.run().await;
            (server, result)
        });

        let bitmap = Arc::new(BitmapDest::create("local", 64, 64, BitmapType::Index8, None, 0).unwrap());
        let ctx = Arc::new(NetContext::loopback().with_server(addr));
        let client = DestNet::new(ctx, 3, bitmap.clone());
        client.connect(Duration::from_secs(2)).await.unwrap();
        // Hello is answered before any patch can flow
        client.send_command(crate::command::Command::Ping).await.unwrap();

        let returns = turn(100);
        let deadline = Instant::now() + Duration::from_secs(5);
        while bitmap.value_at(32, 32) != 100 && Instant::now() < deadline {
            feed(returns.clone());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(bitmap.value_at(32, 32), 100);
        assert_eq!(bitmap.value_at(5, 60), 100);

        client.set_parameter("clear_value", "0").await.unwrap();
        assert_eq!(client.get_parameter("clear_value").await.unwrap(), "0");

        client.disconnect().await;
        stop.stop();
        let (server, result) = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        result.unwrap();
        assert_eq!(server.num_converters(), 0);
    }
}
