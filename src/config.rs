//! Raw TOML scenario configuration (`config.toml`).
//!
//! Parsing is tolerant the way the meter is: unknown keys are ignored, a
//! field outside its range is logged and falls back to its default, and a
//! file that cannot be read at all yields the default scenario.

use std::fs;
use std::path::Path;

use log::error;
use serde::Deserialize;
use thiserror::Error;

use crate::sim::types::{
    EnergyGrid, EnergyRegister, MeterConfig, MAX_INIT_ENERGY_REG, MAX_SERIAL_LENGTH, MAX_SPEEDUP,
    MAX_TARIFF_COUNT,
};

/// Top-level scenario configuration parsed from TOML.
///
/// Every field is optional; [`ScenarioConfig::to_meter_config`] applies range
/// validation and defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScenarioConfig {
    pub serial_number: Option<String>,
    pub speedup: Option<i64>,
    pub tariff_count: Option<i64>,
    pub phase_count: Option<i64>,
    pub meter_constant: Option<i64>,
    /// Start of the simulation as a TOML datetime, converted to UTC seconds.
    pub start_timestamp: Option<toml::value::Datetime>,
    /// Initial energy registers, one entry per tariff.
    pub tariff: Vec<TariffConfig>,
}

/// Initial registers of one tariff, keyed by phase.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TariffConfig {
    pub phase1: Option<PhaseRegisters>,
    pub phase2: Option<PhaseRegisters>,
    pub phase3: Option<PhaseRegisters>,
}

/// Initial register values of one phase (Ws).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRegisters {
    pub active_plus: Option<i64>,
    pub active_minus: Option<i64>,
    pub reactive1: Option<i64>,
    pub reactive2: Option<i64>,
    pub reactive3: Option<i64>,
    pub reactive4: Option<i64>,
}

/// Configuration file error.
#[derive(Debug, Error)]
#[error("config error at {field}: {message}")]
pub struct ConfigError {
    /// Offending field or file.
    pub field: String,
    pub message: String,
}

impl ScenarioConfig {
    /// Parses a scenario configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is
    /// invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            field: "config.toml".to_string(),
            message: format!("cannot read \"{}\": {e}", path.display()),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a scenario configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError {
            field: "toml".to_string(),
            message: e.to_string(),
        })
    }

    /// Validates every field and assembles the engine-level configuration.
    ///
    /// Out-of-range values are logged and replaced by their defaults. An
    /// absent or unparsable start timestamp resolves to the current wall
    /// time.
    pub fn to_meter_config(&self) -> MeterConfig {
        let mut cfg = MeterConfig::default();

        if let Some(serial) = &self.serial_number {
            if serial.chars().count() <= MAX_SERIAL_LENGTH {
                cfg.serial_number = serial.clone();
            } else {
                error!("serial number too long");
            }
        }

        if let Some(v) = self.speedup {
            if v >= 1 && v <= MAX_SPEEDUP as i64 {
                cfg.speedup = v as u16;
            } else {
                error!("parsed invalid speedup: {v}");
            }
        }

        if let Some(v) = self.tariff_count {
            if v >= 1 && v <= MAX_TARIFF_COUNT as i64 {
                cfg.tariff_count = v as u8;
            } else {
                error!("parsed invalid tariff count: {v}");
            }
        }

        if let Some(v) = self.phase_count {
            if (1..=3).contains(&v) {
                cfg.phase_count = v as u8;
            } else {
                error!("parsed invalid phase count: {v}");
            }
        }

        if let Some(v) = self.meter_constant {
            if v >= 0 && v <= u32::MAX as i64 {
                cfg.meter_constant = v as u32;
            } else {
                error!("parsed invalid meter constant: {v}");
            }
        }

        cfg.start_time = self
            .start_time_utc()
            .unwrap_or_else(|| chrono::Utc::now().timestamp());

        cfg
    }

    /// The configured start timestamp as UTC seconds, if present and
    /// convertible. Timezone-less TOML datetimes are taken as UTC.
    pub fn start_time_utc(&self) -> Option<i64> {
        let ts = self.start_timestamp.as_ref()?;
        let text = ts.to_string();

        if let Ok(t) = chrono::DateTime::parse_from_rfc3339(&text) {
            return Some(t.timestamp());
        }
        if let Ok(t) = chrono::NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(t.and_utc().timestamp());
        }
        if let Ok(d) = chrono::NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
            return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
        }

        error!("parsed invalid start timestamp: {text}");
        None
    }

    /// Builds the initial energy grid for `tariff_count` tariffs from the
    /// configured register values. Entries beyond the tariff count are
    /// ignored; missing ones stay zero.
    pub fn initial_energy(&self, tariff_count: u8) -> EnergyGrid {
        let mut grid: EnergyGrid = vec![Default::default(); tariff_count as usize];

        for (tariff, entry) in self.tariff.iter().take(tariff_count as usize).enumerate() {
            let phases = [&entry.phase1, &entry.phase2, &entry.phase3];
            for (phase, regs) in phases.into_iter().enumerate() {
                let Some(regs) = regs else {
                    continue;
                };
                let cell = &mut grid[tariff][phase];
                seed_register(&mut cell.active_plus, "activePlus", regs.active_plus);
                seed_register(&mut cell.active_minus, "activeMinus", regs.active_minus);
                seed_register(&mut cell.reactive[0], "reactive1", regs.reactive1);
                seed_register(&mut cell.reactive[1], "reactive2", regs.reactive2);
                seed_register(&mut cell.reactive[2], "reactive3", regs.reactive3);
                seed_register(&mut cell.reactive[3], "reactive4", regs.reactive4);
            }
        }

        grid
    }
}

fn seed_register(reg: &mut EnergyRegister, name: &str, value: Option<i64>) {
    let Some(v) = value else {
        return;
    };
    if (0..=MAX_INIT_ENERGY_REG).contains(&v) {
        reg.value = v;
    } else {
        error!("parsed invalid energy register {name}: {v}");
    }
}
