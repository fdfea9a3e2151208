//! Simulated rotating radar
//!
//! Produces returns for a fixed-rate antenna: optional noise floor plus
//! point targets that move at constant speed and course.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use contracts::{azimuth_to_degs, FeedConfig, Return, ReturnCallback, ReturnSource, TargetConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

/// Pure return generator; owns no thread
#[derive(Debug, Clone)]
pub struct SweepModel {
    config: FeedConfig,
}

impl SweepModel {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Time between batches at the configured rotation rate
    pub fn batch_interval(&self) -> Duration {
        let rev = 60.0 / self.config.rpm.max(0.1) as f64;
        let per_return = rev / self.config.azimuths_per_rev.max(1) as f64;
        Duration::from_secs_f64(per_return * self.config.batch_azimuths.max(1) as f64)
    }

    /// Target position (x east, y north) after `t` seconds
    pub fn target_position(target: &TargetConfig, t: f32) -> (f32, f32) {
        let bearing = target.bearing_deg.to_radians();
        let course = target.course_deg.to_radians();
        let travelled = target.speed_mps * t;
        (
            target.range_m * bearing.sin() + travelled * course.sin(),
            target.range_m * bearing.cos() + travelled * course.cos(),
        )
    }

    /// Return number `index` (counted from the first return) at time `t`
    pub fn return_at(&self, index: u64, t: f32, rng: &mut impl Rng) -> Return {
        let n = self.config.azimuths_per_rev.max(1) as u64;
        let azimuth = ((index % n) * 65536 / n) as u16;
        let samples = self.config.samples.max(1) as usize;
        let end_range = self.config.end_range_m;
        let per_sample = end_range / samples as f32;

        let mut data: Vec<u8> = if self.config.noise_level > 0 {
            (0..samples)
                .map(|_| rng.random_range(0..=self.config.noise_level))
                .collect()
        } else {
            vec![0; samples]
        };

        let az = (azimuth_to_degs(azimuth) as f32).to_radians();
        for target in &self.config.targets {
            let (x, y) = Self::target_position(target, t);
            let range = x.hypot(y);
            let mut diff = az - x.atan2(y);
            while diff > PI {
                diff -= 2.0 * PI;
            }
            while diff < -PI {
                diff += 2.0 * PI;
            }
            let half = target.extent_m / 2.0;
            if diff.abs() >= PI / 2.0 || range * diff.abs() > half {
                continue;
            }
            let first = ((range - half).max(0.0) / per_sample) as usize;
            let last = (((range + half) / per_sample).ceil() as usize).min(samples);
            for level in data.iter_mut().take(last).skip(first) {
                *level = (*level).max(target.level);
            }
        }
        Return::new_u8(azimuth, 0.0, end_range, data)
    }

    /// One batch starting at `index`
    pub fn batch(&self, index: u64, t: f32, rng: &mut impl Rng) -> Vec<Return> {
        (0..self.config.batch_azimuths.max(1) as u64)
            .map(|k| self.return_at(index + k, t, rng))
            .collect()
    }
}

/// Simulated radar driven by its own thread
pub struct SimulatedRadar {
    source_id: String,
    model: SweepModel,
    seed: u64,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedRadar {
    pub fn new(source_id: impl Into<String>, config: FeedConfig) -> Self {
        Self {
            source_id: source_id.into(),
            model: SweepModel::new(config),
            seed: 0x5eed,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn model(&self) -> &SweepModel {
        &self.model
    }
}

impl ReturnSource for SimulatedRadar {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn listen(&self, callback: ReturnCallback) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let model = self.model.clone();
        let running = Arc::clone(&self.running);
        let seed = self.seed;
        let source_id = self.source_id.clone();
        let interval = model.batch_interval();
        info!(
            source = %source_id,
            rpm = model.config().rpm,
            interval_ms = interval.as_millis() as u64,
            targets = model.config().targets.len(),
            "simulated radar started"
        );

        let spawned = std::thread::Builder::new()
            .name(format!("feed-{source_id}"))
            .spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let started = Instant::now();
                let mut next = started;
                let mut index = 0u64;
                while running.load(Ordering::Relaxed) {
                    let t = started.elapsed().as_secs_f32();
                    let batch = model.batch(index, t, &mut rng);
                    index += batch.len() as u64;
                    trace!(source = %source_id, index, "batch produced");
                    callback(batch);

                    next += interval;
                    let now = Instant::now();
                    if next > now {
                        std::thread::sleep(next - now);
                    } else {
                        // behind schedule: skip the backlog
                        next = now;
                    }
                }
                debug!(source = %source_id, returns = index, "simulated radar stopped");
            });
        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(e) => {
                warn!(source = %self.source_id, error = %e, "feed thread failed to start");
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // stop may be called from the callback itself
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!(source = %self.source_id, "feed thread panicked");
            }
        }
    }

    fn is_listening(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for SimulatedRadar {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::degs_to_azimuth;
    use std::sync::atomic::AtomicUsize;

    fn config(targets: Vec<TargetConfig>, noise: u8) -> FeedConfig {
        FeedConfig {
            rpm: 240.0,
            azimuths_per_rev: 360,
            samples: 100,
            end_range_m: 1000.0,
            noise_level: noise,
            targets,
            batch_azimuths: 30,
            queue_capacity: 8,
        }
    }

    fn target(range_m: f32, bearing_deg: f32) -> TargetConfig {
        TargetConfig {
            range_m,
            bearing_deg,
            extent_m: 50.0,
            level: 200,
            speed_mps: 0.0,
            course_deg: 0.0,
        }
    }

    #[test]
    fn target_shows_at_its_bearing_and_range() {
        let model = SweepModel::new(config(vec![target(500.0, 90.0)], 0));
        let mut rng = StdRng::seed_from_u64(1);

        let hit = model.return_at(90, 0.0, &mut rng);
        assert_eq!(hit.azimuth, degs_to_azimuth(90.0));
        assert_eq!(hit.samples.level(50), 200);
        assert_eq!(hit.samples.level(10), 0);
        assert_eq!(hit.samples.level(90), 0);

        let miss = model.return_at(270, 0.0, &mut rng);
        assert!((0..100).all(|s| miss.samples.level(s) == 0));
    }

    #[test]
    fn moving_target_follows_course() {
        let mut t = target(500.0, 0.0);
        t.speed_mps = 10.0;
        t.course_deg = 180.0;
        let (x, y) = SweepModel::target_position(&t, 20.0);
        assert!(x.abs() < 1e-3);
        assert!((y - 300.0).abs() < 1e-3);
    }

    #[test]
    fn noise_stays_below_level() {
        let model = SweepModel::new(config(Vec::new(), 12));
        let mut rng = StdRng::seed_from_u64(7);
        let batch = model.batch(0, 0.0, &mut rng);
        assert_eq!(batch.len(), 30);
        let levels: Vec<u8> = batch
            .iter()
            .flat_map(|r| (0..r.num_samples()).map(|s| r.samples.level(s)))
            .collect();
        assert!(levels.iter().all(|v| *v <= 12));
        assert!(levels.iter().any(|v| *v > 0));
    }

    #[test]
    fn batch_interval_matches_rotation() {
        let model = SweepModel::new(config(Vec::new(), 0));
        // 240 rpm -> 250 ms per turn; 30 of 360 azimuths per batch
        let interval = model.batch_interval();
        assert!((interval.as_secs_f64() - 0.25 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn listen_produces_batches_until_stopped() {
        let radar = SimulatedRadar::new("sim", config(vec![target(300.0, 45.0)], 0)).with_seed(3);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        radar.listen(Arc::new(move |batch: Vec<Return>| {
            seen.fetch_add(batch.len(), Ordering::Relaxed);
        }));
        assert!(radar.is_listening());
        std::thread::sleep(Duration::from_millis(100));
        radar.stop();
        assert!(!radar.is_listening());
        let produced = count.load(Ordering::Relaxed);
        assert!(produced >= 30);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::Relaxed), produced);
    }
}
