use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::Result,
    types::{ConnectTarget, IndoorBikeMetrics, ScannedDevice},
};

/// Control and telemetry contract shared by real trainers and the simulator
///
/// The workout runner only talks to this trait, so it runs unchanged against
/// an [`FtmsDevice`](crate::FtmsDevice) or a
/// [`SimulatedTrainer`](crate::SimulatedTrainer).
#[async_trait]
pub trait Trainer: Send + Sync {
    /// Discover trainers in range
    async fn scan(&self) -> Result<Vec<ScannedDevice>>;

    /// Connect and return a human readable label of the trainer
    async fn connect(&self, target: &ConnectTarget) -> Result<String>;

    /// Disconnect; calling this while disconnected is a no-op
    async fn disconnect(&self) -> Result<()>;

    /// Whether a trainer is currently connected
    async fn is_connected(&self) -> bool;

    /// Start telemetry and receive merged metrics snapshots
    ///
    /// A later call replaces the previous receiver.
    async fn subscribe_metrics(&self) -> Result<mpsc::Receiver<IndoorBikeMetrics>>;

    /// Hold an absolute power target, returning the watts actually applied
    async fn set_target_power(&self, watts: i32) -> Result<i32>;

    /// Best-effort check that the trainer accepts ERG control
    async fn probe_erg_support(&self) -> bool;

    /// Set a resistance level, returning the level applied
    async fn set_target_resistance(&self, level: f64) -> Result<f64>;

    /// Set a simulated grade in percent, returning the grade applied
    async fn set_target_slope(&self, percent: f64) -> Result<f64>;
}
