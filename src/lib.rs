//! Virtual-time simulator of a poly-phase smart electricity meter.

/// TOML scenario configuration (`config.toml`).
pub mod config;
pub mod devices;
/// Public meter facade and API error type.
pub mod meter;
pub mod scenario;
/// Simulation core: calculator, engine, virtual clock, runner.
pub mod sim;

pub use devices::{Device, DeviceResponse, InfoForDevice};
pub use meter::{Meter, MeterError};
