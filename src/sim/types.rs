//! Core meter value types: configuration, registers, instantaneous quantities.

use num_complex::Complex64;

/// Maximum number of tariffs a scenario may configure.
pub const MAX_TARIFF_COUNT: usize = 16;
/// Maximum number of phases of the simulated meter.
pub const MAX_PHASE_COUNT: usize = 3;
/// Maximum serial-number length in characters.
pub const MAX_SERIAL_LENGTH: usize = 31;
/// Maximum virtual-to-real speed-up ratio.
pub const MAX_SPEEDUP: u16 = 10_000;
/// Upper bound for initial energy-register values (Ws).
pub const MAX_INIT_ENERGY_REG: i64 = 100_000_000_000_000;
/// Upper bound for phase voltage (V).
pub const MAX_VOLTAGE: f64 = 400.0;
/// Upper bound for phase current (A).
pub const MAX_CURRENT: f64 = 100.0;
/// Upper bound for total harmonic distortion (fraction).
pub const MAX_THD: f64 = 1.0;
/// Upper bound for mains frequency (Hz).
pub const MAX_FREQUENCY: f64 = 1000.0;

/// Sentinel: no scenario or device update is scheduled.
pub const NO_UPDATE_SCHEDULED: i32 = i32::MAX;
/// Sentinel: a device update is due immediately.
pub const UPDATE_NEEDED_NOW: i32 = 0;

/// A single energy register: integer total plus a fractional residue.
///
/// The residue stays in `[0, 1)` so that integer totals are exact modulo the
/// accumulation granularity; every accumulation carries overflow from the
/// fraction into `value`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyRegister {
    /// Integer part (Ws / vars / VAs depending on the register).
    pub value: i64,
    /// Fractional residue in `[0, 1)`.
    pub fraction: f64,
}

impl EnergyRegister {
    /// Splits a floating-point energy amount into integer part and residue.
    pub fn from_f64(v: f64) -> Self {
        Self {
            value: v.floor() as i64,
            fraction: v - v.floor(),
        }
    }

    /// Adds `sign * src` to this register and renormalizes the residue
    /// back into `[0, 1)`.
    pub fn add_signed(&mut self, src: &EnergyRegister, sign: i64) {
        self.value += sign * src.value;
        self.fraction += sign as f64 * src.fraction;
        if self.fraction.abs() >= 1.0 {
            self.value += self.fraction.floor() as i64;
            self.fraction -= self.fraction.floor();
        } else if self.fraction < 0.0 {
            self.value -= 1;
            self.fraction += 1.0;
        }
    }

    /// Combined value, for comparisons in tests and reporting.
    pub fn as_f64(&self) -> f64 {
        self.value as f64 + self.fraction
    }
}

/// Energy registers of one (tariff, phase) cell.
///
/// Reactive registers are indexed 0..3 for quadrants I..IV; the quadrant is
/// selected per accumulation from the signs of true and reactive power.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Energy {
    /// Imported active energy (Ws).
    pub active_plus: EnergyRegister,
    /// Exported active energy (Ws).
    pub active_minus: EnergyRegister,
    /// Reactive energy per quadrant (vars).
    pub reactive: [EnergyRegister; 4],
    /// Apparent energy while importing (VAs).
    pub apparent_plus: EnergyRegister,
    /// Apparent energy while exporting (VAs).
    pub apparent_minus: EnergyRegister,
}

/// Energy registers indexed `[tariff][phase]`.
pub type EnergyGrid = Vec<[Energy; MAX_PHASE_COUNT]>;

/// Instantaneous electrical quantities of the meter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Instant {
    /// Mains frequency (Hz).
    pub frequency: f32,
    /// RMS phase voltage (V).
    pub voltage: [f64; MAX_PHASE_COUNT],
    /// RMS phase current (A).
    pub current: [f64; MAX_PHASE_COUNT],
    /// RMS neutral current (A).
    pub current_neutral: f64,
    /// Voltage-to-current angle per phase (degrees in `[0, 360)`).
    pub ui_angle: [f64; MAX_PHASE_COUNT],
    /// Phase-to-phase angles (degrees, fixed at 120).
    pub pp_angle: [f64; 2],
}

/// Power triangle per phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct Power {
    /// True power (W).
    pub true_power: [f64; MAX_PHASE_COUNT],
    /// Reactive power (var).
    pub reactive_power: [f64; MAX_PHASE_COUNT],
    /// Apparent power (VA).
    pub apparent_power: [f64; MAX_PHASE_COUNT],
    /// Power angle (degrees).
    pub phi: [f64; MAX_PHASE_COUNT],
}

/// Fundamental-frequency vector data on the complex plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct Vector {
    /// Complex power per phase.
    pub complex_power: [Complex64; MAX_PHASE_COUNT],
    /// Complex phase voltage.
    pub phase_voltage: [Complex64; MAX_PHASE_COUNT],
    /// Complex phase current (scenario current plus device bias).
    pub phase_current: [Complex64; MAX_PHASE_COUNT],
    /// Complex neutral current.
    pub complex_neutral: Complex64,
}

/// Total harmonic distortion per phase, for voltage and current.
#[derive(Debug, Clone, Copy, Default)]
pub struct Thd {
    pub thd_u: [f32; MAX_PHASE_COUNT],
    pub thd_i: [f32; MAX_PHASE_COUNT],
}

/// A scheduled change of the instantaneous quantities at a virtual timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct Update {
    /// Virtual seconds since simulation start.
    pub timestamp: i32,
    /// Tariff active from this update on.
    pub tariff: u8,
    pub instant: Instant,
    pub thd: Thd,
}

/// Engine-level meter configuration.
///
/// Produced from the raw TOML scenario by [`crate::config::ScenarioConfig`];
/// all fields are already validated and in range.
#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Meter serial number (at most [`MAX_SERIAL_LENGTH`] characters).
    pub serial_number: String,
    /// UTC timestamp of virtual second zero.
    pub start_time: i64,
    /// Number of tariffs (1..=16).
    pub tariff_count: u8,
    /// Number of phases (1..=3).
    pub phase_count: u8,
    /// Meter constant (Ws per impulse).
    pub meter_constant: u32,
    /// Virtual-to-real speed-up ratio (1..=10000).
    pub speedup: u16,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            serial_number: String::new(),
            start_time: 0,
            tariff_count: 1,
            phase_count: 3,
            meter_constant: 0,
            speedup: 1,
        }
    }
}

/// Complete meter state owned by the engine and written by the calculator.
#[derive(Debug)]
pub struct MeterState {
    pub cfg: MeterConfig,
    pub current_tariff: u8,
    pub instant: Instant,
    pub power: Power,
    pub vector: Vector,
    pub thd: Thd,
    pub energy: EnergyGrid,
}

impl MeterState {
    /// Creates a state with zeroed dynamic quantities.
    pub fn new(cfg: MeterConfig, energy: EnergyGrid) -> Self {
        Self {
            cfg,
            current_tariff: 0,
            instant: Instant::default(),
            power: Power::default(),
            vector: Vector::default(),
            thd: Thd::default(),
            energy,
        }
    }
}
