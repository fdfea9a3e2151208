//! FanoutDest - one converter slot feeding several destinations
//!
//! The primary destination decides success and max size. Secondary
//! destinations (usually queued sinks from configuration) get every call;
//! their errors are logged, `NotSupported` silently ignored.

use std::sync::Arc;

use contracts::{
    DestRef, FadeType, MpRefMode, PatchSet, Rgb, ScControl, ScDest, ScError, ScResult, ScState,
    SinkConfig, SinkType, SweepLine, View, WinGeom,
};
use tracing::{info, instrument, warn};

use crate::handle::DestHandle;
use crate::metrics::MetricsSnapshot;
use crate::sinks::{LogSink, PatchRecorder};

/// Build a queued destination from sink configuration
#[instrument(
    name = "create_dest_handle",
    skip(config),
    fields(sink = %config.name, sink_type = ?config.sink_type)
)]
pub async fn create_dest_handle(config: &SinkConfig, max_size: (u16, u16)) -> ScResult<DestHandle> {
    match config.sink_type {
        SinkType::Log => {
            let sink = LogSink::new(&config.name);
            Ok(DestHandle::spawn(sink, config.queue_capacity, max_size))
        }
        SinkType::File => {
            let sink = PatchRecorder::from_params(&config.name, &config.params).map_err(|e| {
                ScError::invalid(format!("sinks.{}", config.name), e.to_string())
            })?;
            Ok(DestHandle::spawn(sink, config.queue_capacity, max_size))
        }
    }
}

pub struct FanoutDest {
    name: String,
    primary: DestRef,
    sinks: Vec<Arc<DestHandle>>,
}

impl FanoutDest {
    pub fn new(primary: DestRef) -> Self {
        Self {
            name: format!("{}+fanout", primary.name()),
            primary,
            sinks: Vec::new(),
        }
    }

    /// Primary plus one queued sink per config entry
    pub async fn with_sinks(primary: DestRef, configs: &[SinkConfig]) -> ScResult<Self> {
        let mut fanout = Self::new(primary);
        let max_size = fanout.primary.max_size();
        for config in configs {
            let handle = create_dest_handle(config, max_size).await?;
            fanout.sinks.push(Arc::new(handle));
        }
        info!(dest = %fanout.name, sinks = fanout.sinks.len(), "fan-out ready");
        Ok(fanout)
    }

    pub fn add_sink(&mut self, handle: Arc<DestHandle>) {
        self.sinks.push(handle);
    }

    pub fn primary(&self) -> &DestRef {
        &self.primary
    }

    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.sinks
            .iter()
            .map(|h| (h.name().to_string(), h.metrics().snapshot()))
            .collect()
    }

    pub async fn shutdown(&self) {
        for sink in &self.sinks {
            sink.shutdown().await;
        }
    }

    fn fan(&self, op: &str, call: impl Fn(&dyn ScDest) -> ScResult<()>) -> ScResult<()> {
        call(self.primary.as_ref())?;
        for sink in &self.sinks {
            match call(sink.as_ref()) {
                Ok(()) => {}
                Err(e) if e.is_not_supported() => {}
                Err(e) => warn!(dest = %sink.name(), op, error = %e, "secondary destination failed"),
            }
        }
        Ok(())
    }
}

impl ScControl for FanoutDest {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_win_pos(&self, x: i16, y: i16) -> ScResult<()> {
        self.fan("set_win_pos", |d| d.set_win_pos(x, y))
    }

    fn set_win_geom(&self, geom: WinGeom) -> ScResult<()> {
        self.fan("set_win_geom", |d| d.set_win_geom(geom))
    }

    fn set_win_param(&self, param: u16, arg1: u32, arg2: u32) -> ScResult<()> {
        self.fan("set_win_param", |d| d.set_win_param(param, arg1, arg2))
    }

    fn set_fade(&self, rid: u8, fade_type: FadeType, rate: u16) -> ScResult<()> {
        self.fan("set_fade", |d| d.set_fade(rid, fade_type, rate))
    }

    fn set_view(&self, view: View) -> ScResult<()> {
        self.fan("set_view", |d| d.set_view(view))
    }

    fn pan_view(&self, x: f32, y: f32, clear_trails: bool) -> ScResult<()> {
        self.fan("pan_view", |d| d.pan_view(x, y, clear_trails))
    }

    fn set_radar_colour(&self, rid: u8, colour: Rgb) -> ScResult<()> {
        self.fan("set_radar_colour", |d| d.set_radar_colour(rid, colour))
    }

    fn set_radar_bright(&self, rid: u8, bright: u8) -> ScResult<()> {
        self.fan("set_radar_bright", |d| d.set_radar_bright(rid, bright))
    }

    fn set_radar_lut(&self, rid: u8, lut: &[u8; 256]) -> ScResult<()> {
        self.fan("set_radar_lut", |d| d.set_radar_lut(rid, lut))
    }

    fn show_radar(&self, rid: u8, state: ScState) -> ScResult<()> {
        self.fan("show_radar", |d| d.show_radar(rid, state))
    }

    fn patch_set(&self, patches: &PatchSet) -> ScResult<()> {
        self.fan("patch_set", |d| d.patch_set(patches))
    }

    fn set_source(&self, source_id: u32, arg1: u32, arg2: u32) -> ScResult<()> {
        self.fan("set_source", |d| d.set_source(source_id, arg1, arg2))
    }

    fn set_radar_position(&self, x: f32, y: f32, clear_trails: bool) -> ScResult<()> {
        self.fan("set_radar_position", |d| d.set_radar_position(x, y, clear_trails))
    }

    fn set_rotation_degs(&self, degs: f64) -> ScResult<()> {
        self.fan("set_rotation_degs", |d| d.set_rotation_degs(degs))
    }

    fn set_scale_factor(&self, factor: u8) -> ScResult<()> {
        self.fan("set_scale_factor", |d| d.set_scale_factor(factor))
    }

    fn set_moving_platform_ref_mode(&self, mode: MpRefMode) -> ScResult<()> {
        self.fan("set_moving_platform_ref_mode", |d| d.set_moving_platform_ref_mode(mode))
    }

    fn set_sweep_line(&self, sweep: SweepLine) -> ScResult<()> {
        self.fan("set_sweep_line", |d| d.set_sweep_line(sweep))
    }
}

impl ScDest for FanoutDest {
    fn max_size(&self) -> (u16, u16) {
        self.primary.max_size()
    }

    fn draws_sweep_line(&self) -> bool {
        self.primary.draws_sweep_line()
    }

    fn sweep_azimuth(&self, azimuth: u16) {
        self.primary.sweep_azimuth(azimuth);
    }

    fn clear(&self, value: u8) -> ScResult<()> {
        self.fan("clear", |d| d.clear(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BitmapDest;
    use contracts::{BitmapType, Patch, PatchFormat};
    use std::collections::HashMap;

    #[tokio::test]
    async fn secondary_failures_do_not_reach_caller() {
        let bitmap = Arc::new(BitmapDest::create("bmp", 16, 16, BitmapType::Index8, None, 0).unwrap());
        let configs = vec![SinkConfig {
            name: "log".into(),
            sink_type: SinkType::Log,
            queue_capacity: 4,
            params: HashMap::new(),
        }];
        let fanout = FanoutDest::with_sinks(bitmap.clone(), &configs).await.unwrap();
        // log sinks have no colour
        fanout.set_radar_colour(0, Rgb::from_u32(0xff0000)).unwrap();
        let set = PatchSet {
            format: PatchFormat::Raw8,
            patches: vec![Patch::filled(0, 0, 2, 2, 50).unwrap()],
        };
        fanout.patch_set(&set).unwrap();
        assert_eq!(bitmap.value_at(1, 1), 50);
        fanout.shutdown().await;
        let metrics = fanout.metrics();
        assert_eq!(metrics[0].0, "log");
        assert_eq!(metrics[0].1.write_count, 1);
    }

    #[tokio::test]
    async fn primary_errors_propagate() {
        let bitmap = Arc::new(BitmapDest::create("bmp", 8, 8, BitmapType::Index8, None, 0).unwrap());
        let fanout = FanoutDest::new(bitmap);
        assert!(fanout.set_win_geom(WinGeom::new(0, 0, 9, 9)).is_err());
        assert_eq!(fanout.max_size(), (8, 8));
    }
}
