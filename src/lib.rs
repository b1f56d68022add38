#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Velox
//!
//! Control FTMS smart bike trainers over Bluetooth Low Energy and run
//! structured ERG workouts against them.
//!
//! The crate is split along the path a watt takes:
//!
//! - **Telemetry**: decoders for Indoor Bike Data (0x2AD2) and Cycling Power
//!   Measurement (0x2A63), including the ambiguous speed-field heuristic some
//!   trainers require, merged into one [`IndoorBikeMetrics`] stream.
//! - **Device link**: [`FtmsDevice`] resolves, connects and controls a trainer
//!   through the Fitness Machine Control Point, falling back through several
//!   command sequences when a trainer refuses the canonical one.
//! - **Simulator**: [`SimulatedTrainer`] produces realistic telemetry and
//!   honours the same [`Trainer`] contract, so everything runs without hardware.
//! - **Workout runner**: [`WorkoutRunner`] walks a [`WorkoutPlan`], applying
//!   each step's target with retries and emitting progress once per second.
//!
//! ## Quick Start
//!
//! ```no_run
//! use velox::{ConnectTarget, FtmsDevice, Trainer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let trainer = FtmsDevice::bluetooth().await?;
//!     println!("Connected to {}", trainer.connect(&ConnectTarget::Auto).await?);
//!
//!     let mut metrics = trainer.subscribe_metrics().await?;
//!     trainer.set_target_power(200).await?;
//!
//!     while let Some(sample) = metrics.recv().await {
//!         println!("{:?} W at {:?} rpm", sample.power_watts, sample.cadence_rpm);
//!     }
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy transport built on btleplug
pub mod ble;
/// FTMS trainer control
pub mod device;
/// Error types and handling
pub mod error;
/// Control point commands and capability payloads
pub mod protocol;
/// Workout execution
pub mod runner;
/// In-process trainer simulator
pub mod simulator;
/// Telemetry decoding and merging
pub mod telemetry;
/// Built-in workout library
pub mod templates;
/// Trainer contract shared by hardware and simulator
pub mod trainer;
/// GATT transport abstraction
pub mod transport;
/// Type definitions and data structures
pub mod types;
/// Workout plans and progress
pub mod workout;

// Re-export the main types for convenient usage
pub use device::FtmsDevice;
pub use error::{Result, VeloxError};
pub use protocol::normalize_power_target;
pub use runner::{RunnerState, WorkoutRunner};
pub use simulator::SimulatedTrainer;
pub use telemetry::decode_indoor_bike;
pub use templates::{build_plan_from_template, find_template, WorkoutTemplate};
pub use trainer::Trainer;
pub use types::{
    ConnectTarget, ConnectionParams, ControlConfig, IndoorBikeMetrics, RunnerConfig,
    ScannedDevice, SimulatorConfig, SupportedPowerRange,
};
pub use workout::{TargetMode, WorkoutOutcome, WorkoutPlan, WorkoutProgress, WorkoutStep};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fitness Machine service (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data characteristic (0x2AD2), notify
pub const INDOOR_BIKE_DATA_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Supported Power Range characteristic (0x2AD8), read
pub const SUPPORTED_POWER_RANGE_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad8_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point characteristic (0x2AD9), write and indicate
pub const FTMS_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power service (0x1818)
pub const CYCLING_POWER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1818_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power Measurement characteristic (0x2A63), notify
pub const CYCLING_POWER_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a63_0000_1000_8000_0080_5f9b_34fb);
