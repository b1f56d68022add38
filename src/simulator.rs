use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex,
    },
    task::JoinHandle,
};
use tracing::{debug, info, trace};

use crate::{
    error::{Result, VeloxError},
    trainer::Trainer,
    types::{ConnectTarget, IndoorBikeMetrics, ScannedDevice, SimulatorConfig},
};

/// Advertised name of the simulated trainer
pub const SIM_NAME: &str = "Velox Sim HT";
/// Address of the simulated trainer
pub const SIM_ADDRESS: &str = "SIM:HT:00:00:00:01";

const SIM_RSSI: i16 = -30;
const SIM_MANUFACTURER: &str = "Velox";

const INITIAL_POWER: f64 = 100.0;
const INITIAL_CADENCE: f64 = 85.0;
const INITIAL_SPEED: f64 = 28.0;

const POWER_LAG: f64 = 0.30;
const MAX_POWER_STEP: f64 = 30.0;
const CADENCE_LAG: f64 = 0.55;
const MAX_CADENCE_STEP: f64 = 5.5;
const SPEED_LAG: f64 = 0.40;
const MAX_SPEED_STEP: f64 = 2.8;

const CADENCE_LIMITS: (f64, f64) = (45.0, 128.0);
const SPEED_LIMITS: (f64, f64) = (7.0, 78.0);

const RESISTANCE_LIMITS: (f64, f64) = (1.0, 200.0);
const SLOPE_LIMITS: (f64, f64) = (-10.0, 15.0);

/// Riding pattern the virtual rider is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideMode {
    /// Holding the target
    Steady,
    /// Pushing above the target
    Surge,
    /// Easing off below the target
    Recovery,
}

/// Deterministic rider and trainer physics
///
/// Every [`tick`](Self::tick) advances one second of riding. Power chases a
/// noisy target with a capped first-order lag; cadence and speed follow power.
#[derive(Debug, Clone)]
pub struct RideModel {
    rng: StdRng,
    target_watts: i32,
    power_bounds: (f64, f64),
    power: f64,
    cadence: f64,
    speed: f64,
    tick: u64,
    mode: RideMode,
    mode_remaining: i32,
}

impl RideModel {
    /// Create a model seeded and bounded by `config`
    #[must_use]
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            target_watts: config.initial_target_watts,
            power_bounds: (
                f64::from(config.power_range.min_watts),
                f64::from(config.power_range.max_watts),
            ),
            power: INITIAL_POWER,
            cadence: INITIAL_CADENCE,
            speed: INITIAL_SPEED,
            tick: 0,
            mode: RideMode::Steady,
            mode_remaining: 0,
        }
    }

    /// Power the rider is steering toward
    #[must_use]
    pub const fn target_watts(&self) -> i32 {
        self.target_watts
    }

    /// Change the power the rider steers toward
    pub fn set_target_watts(&mut self, watts: i32) {
        self.target_watts = watts;
    }

    /// Current riding pattern
    #[must_use]
    pub const fn mode(&self) -> RideMode {
        self.mode
    }

    fn roll_mode(&mut self) {
        let roll: f64 = self.rng.gen();
        let (mode, duration) = if roll < 0.12 {
            (RideMode::Surge, self.rng.gen_range(8..=20))
        } else if roll < 0.24 {
            (RideMode::Recovery, self.rng.gen_range(8..=18))
        } else {
            (RideMode::Steady, self.rng.gen_range(18..=45))
        };
        if mode != self.mode {
            trace!("Simulated rider switches to {:?} for {}s", mode, duration);
        }
        self.mode = mode;
        self.mode_remaining = duration;
    }

    /// Advance one second and return the resulting sample
    pub fn tick(&mut self) -> IndoorBikeMetrics {
        self.tick += 1;
        if self.mode_remaining <= 0 {
            self.roll_mode();
        }
        self.mode_remaining -= 1;

        let (power_offset, cadence_offset) = match self.mode {
            RideMode::Steady => (0.0, 0.0),
            RideMode::Surge => (
                self.rng.gen_range(20.0..=55.0),
                self.rng.gen_range(4.0..=11.0),
            ),
            RideMode::Recovery => (
                -self.rng.gen_range(15.0..=40.0),
                -self.rng.gen_range(5.0..=12.0),
            ),
        };

        #[allow(clippy::cast_precision_loss)]
        let t = self.tick as f64;
        let periodic = 10.0 * (t / 5.0).sin() + 6.0 * (t / 11.0).sin();
        let noise = self.rng.gen_range(-6.0..=6.0);
        let (min_power, max_power) = self.power_bounds;
        let dynamic_target = (f64::from(self.target_watts) + power_offset + periodic + noise)
            .max(min_power)
            .min(max_power);

        self.power +=
            ((dynamic_target - self.power) * POWER_LAG).clamp(-MAX_POWER_STEP, MAX_POWER_STEP);
        if (self.power - dynamic_target).abs() < 1.0 {
            self.power = dynamic_target;
        }

        let cadence_periodic = 8.0 * (t / 3.8).sin() + 5.0 * (t / 8.5).sin();
        let cadence_target = 70.0
            + self.power / 8.8
            + cadence_offset
            + cadence_periodic
            + self.rng.gen_range(-8.0..=8.0);
        let speed_target = 14.0 + self.power / 11.0 + self.rng.gen_range(-2.2..=2.2);

        self.cadence += ((cadence_target - self.cadence) * CADENCE_LAG)
            .clamp(-MAX_CADENCE_STEP, MAX_CADENCE_STEP);
        self.speed +=
            ((speed_target - self.speed) * SPEED_LAG).clamp(-MAX_SPEED_STEP, MAX_SPEED_STEP);
        self.cadence = self.cadence.clamp(CADENCE_LIMITS.0, CADENCE_LIMITS.1);
        self.speed = self.speed.clamp(SPEED_LIMITS.0, SPEED_LIMITS.1);

        #[allow(clippy::cast_possible_truncation)]
        let power_watts = self.power.round() as i16;
        IndoorBikeMetrics {
            power_watts: Some(power_watts),
            cadence_rpm: Some(round_tenth(self.cadence)),
            speed_kmh: Some(round_tenth(self.speed)),
        }
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

struct SimState {
    connected: bool,
    model: RideModel,
    metrics: Option<mpsc::Sender<IndoorBikeMetrics>>,
    ticker: Option<JoinHandle<()>>,
}

/// In-process trainer with realistic telemetry
///
/// Implements the same [`Trainer`] contract as [`FtmsDevice`](crate::FtmsDevice),
/// so workouts can run without hardware.
pub struct SimulatedTrainer {
    config: SimulatorConfig,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTrainer {
    /// Create a simulator with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SimulatorConfig::default())
    }

    /// Create a simulator with explicit settings
    #[must_use]
    pub fn with_config(config: SimulatorConfig) -> Self {
        let state = SimState {
            connected: false,
            model: RideModel::new(&config),
            metrics: None,
            ticker: None,
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Power target the simulated rider is currently steering toward
    pub async fn target_watts(&self) -> i32 {
        self.state.lock().await.model.target_watts()
    }

    fn label() -> String {
        format!("{SIM_NAME} ({SIM_ADDRESS})")
    }

    async fn connected_state(&self) -> Result<tokio::sync::MutexGuard<'_, SimState>> {
        let state = self.state.lock().await;
        if state.connected {
            Ok(state)
        } else {
            Err(VeloxError::NotConnected)
        }
    }
}

impl Default for SimulatedTrainer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Trainer for SimulatedTrainer {
    async fn scan(&self) -> Result<Vec<ScannedDevice>> {
        Ok(vec![ScannedDevice {
            name: SIM_NAME.to_string(),
            address: SIM_ADDRESS.to_string(),
            rssi: SIM_RSSI,
            has_ftms: true,
            manufacturer: Some(SIM_MANUFACTURER.to_string()),
        }])
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<String> {
        self.state.lock().await.connected = true;
        let label = Self::label();
        info!("Connected to {} (requested {})", label, target);
        Ok(label)
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Ok(());
        }
        state.connected = false;
        state.metrics = None;
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        info!("Disconnected from {}", Self::label());
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    async fn subscribe_metrics(&self) -> Result<mpsc::Receiver<IndoorBikeMetrics>> {
        let mut state = self.connected_state().await?;
        let (tx, rx) = mpsc::channel(16);
        state.metrics = Some(tx);

        if state.ticker.as_ref().map_or(true, JoinHandle::is_finished) {
            let interval = Duration::from_millis(self.config.tick_interval_ms.max(1));
            state.ticker = Some(tokio::spawn(run_ticker(Arc::clone(&self.state), interval)));
            debug!("Simulator telemetry started, one sample every {:?}", interval);
        }
        Ok(rx)
    }

    async fn set_target_power(&self, watts: i32) -> Result<i32> {
        let mut state = self.connected_state().await?;
        let applied = self.config.power_range.normalize(watts);
        state.model.set_target_watts(applied);
        debug!("Simulated ERG target request={} W applied={} W", watts, applied);
        Ok(applied)
    }

    async fn probe_erg_support(&self) -> bool {
        self.state.lock().await.connected
    }

    async fn set_target_resistance(&self, level: f64) -> Result<f64> {
        if !level.is_finite() {
            return Err(VeloxError::InvalidParameters(format!(
                "Resistance level must be finite, got {level}"
            )));
        }
        let mut state = self.connected_state().await?;
        let applied = level.clamp(RESISTANCE_LIMITS.0, RESISTANCE_LIMITS.1);
        #[allow(clippy::cast_possible_truncation)]
        let target = 3.0f64.mul_add(applied, 70.0).round() as i32;
        state.model.set_target_watts(target);
        debug!("Simulated resistance request={:.1} applied={:.1}", level, applied);
        Ok(applied)
    }

    async fn set_target_slope(&self, percent: f64) -> Result<f64> {
        if !percent.is_finite() {
            return Err(VeloxError::InvalidParameters(format!(
                "Slope must be finite, got {percent}"
            )));
        }
        let mut state = self.connected_state().await?;
        let applied = percent.clamp(SLOPE_LIMITS.0, SLOPE_LIMITS.1);
        #[allow(clippy::cast_possible_truncation)]
        let target = 18.0f64.mul_add(applied, 180.0).round() as i32;
        state.model.set_target_watts(target);
        debug!("Simulated slope request={:.1}% applied={:.1}%", percent, applied);
        Ok(applied)
    }
}

/// Emit one sample per interval until the simulator disconnects
async fn run_ticker(state: Arc<Mutex<SimState>>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let mut guard = state.lock().await;
        if !guard.connected {
            break;
        }
        let sample = guard.model.tick();
        trace!("Simulated sample {:?}", sample);
        if let Some(tx) = guard.metrics.as_ref() {
            match tx.try_send(sample) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("Metrics consumer lagging, sample dropped"),
                Err(TrySendError::Closed(_)) => guard.metrics = None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(model: &mut RideModel, count: usize) -> Vec<IndoorBikeMetrics> {
        (0..count).map(|_| model.tick()).collect()
    }

    #[test]
    fn test_model_is_deterministic_for_a_seed() {
        let config = SimulatorConfig::default();
        let mut a = RideModel::new(&config);
        let mut b = RideModel::new(&config);
        assert_eq!(samples(&mut a, 300), samples(&mut b, 300));

        let mut other = RideModel::new(&SimulatorConfig {
            seed: 7,
            ..SimulatorConfig::default()
        });
        assert_ne!(samples(&mut a, 50), samples(&mut other, 50));
    }

    #[test]
    fn test_model_respects_physical_limits() {
        let mut model = RideModel::new(&SimulatorConfig::default());
        let mut previous = INITIAL_POWER;
        for i in 0..2_000 {
            if i == 700 {
                model.set_target_watts(1_150);
            }
            let sample = model.tick();
            let power = f64::from(sample.power_watts.unwrap());
            let cadence = sample.cadence_rpm.unwrap();
            let speed = sample.speed_kmh.unwrap();

            assert!((50.0..=1200.0).contains(&power), "power {power}");
            assert!((45.0..=128.0).contains(&cadence), "cadence {cadence}");
            assert!((7.0..=78.0).contains(&speed), "speed {speed}");
            assert!((power - previous).abs() <= MAX_POWER_STEP + 1.0);
            previous = power;
        }
    }

    #[test]
    fn test_model_tracks_target() {
        let mut model = RideModel::new(&SimulatorConfig::default());
        model.set_target_watts(300);
        samples(&mut model, 100);

        let window = samples(&mut model, 200);
        let mean = window
            .iter()
            .map(|s| f64::from(s.power_watts.unwrap()))
            .sum::<f64>()
            / 200.0;
        assert!((250.0..=350.0).contains(&mean), "mean power {mean}");
    }

    #[tokio::test]
    async fn test_scan_reports_single_simulated_device() {
        let trainer = SimulatedTrainer::new();
        let devices = trainer.scan().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].label(), "Velox Sim HT (SIM:HT:00:00:00:01)");
        assert_eq!(devices[0].rssi, -30);
        assert!(devices[0].has_ftms);
        assert_eq!(devices[0].manufacturer.as_deref(), Some("Velox"));
    }

    #[tokio::test]
    async fn test_control_requires_connection() {
        let trainer = SimulatedTrainer::new();
        assert!(matches!(
            trainer.set_target_power(200).await,
            Err(VeloxError::NotConnected)
        ));
        assert!(matches!(
            trainer.subscribe_metrics().await,
            Err(VeloxError::NotConnected)
        ));
        assert!(!trainer.probe_erg_support().await);
        trainer.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_power_target_is_normalized() {
        let trainer = SimulatedTrainer::new();
        let label = trainer.connect(&ConnectTarget::Auto).await.unwrap();
        assert_eq!(label, "Velox Sim HT (SIM:HT:00:00:00:01)");
        assert!(trainer.probe_erg_support().await);

        assert_eq!(trainer.set_target_power(203).await.unwrap(), 205);
        assert_eq!(trainer.target_watts().await, 205);
        assert_eq!(trainer.set_target_power(10).await.unwrap(), 50);
        assert_eq!(trainer.set_target_power(5_000).await.unwrap(), 1_200);
    }

    #[tokio::test]
    async fn test_resistance_and_slope_drive_target() {
        let trainer = SimulatedTrainer::new();
        trainer.connect(&ConnectTarget::Auto).await.unwrap();

        assert_eq!(trainer.set_target_resistance(50.0).await.unwrap(), 50.0);
        assert_eq!(trainer.target_watts().await, 220);
        assert_eq!(trainer.set_target_resistance(500.0).await.unwrap(), 200.0);
        assert_eq!(trainer.target_watts().await, 670);
        assert_eq!(trainer.set_target_resistance(0.0).await.unwrap(), 1.0);

        assert_eq!(trainer.set_target_slope(5.0).await.unwrap(), 5.0);
        assert_eq!(trainer.target_watts().await, 270);
        assert_eq!(trainer.set_target_slope(-25.0).await.unwrap(), -10.0);
        assert_eq!(trainer.target_watts().await, 0);
        assert!(matches!(
            trainer.set_target_slope(f64::NAN).await,
            Err(VeloxError::InvalidParameters(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_stream_until_disconnect() {
        let trainer = SimulatedTrainer::new();
        trainer.connect(&ConnectTarget::Auto).await.unwrap();
        let mut metrics = trainer.subscribe_metrics().await.unwrap();

        for _ in 0..3 {
            let sample = metrics.recv().await.unwrap();
            assert!(sample.power_watts.is_some());
            assert!(sample.cadence_rpm.is_some());
            assert!(sample.speed_kmh.is_some());
        }

        trainer.disconnect().await.unwrap();
        assert!(!trainer.is_connected().await);
        while metrics.recv().await.is_some() {}
    }
}
