//! Scenario directory loading: parsed configuration plus the lazy cursor
//! over the scheduled updates (`updates.csv`).

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use thiserror::Error;

use crate::config::ScenarioConfig;
use crate::sim::types::{
    EnergyGrid, Instant, MeterConfig, Thd, Update, MAX_CURRENT, MAX_FREQUENCY, MAX_TARIFF_COUNT,
    MAX_THD, MAX_VOLTAGE,
};

/// Fields per `updates.csv` line.
const FIELD_COUNT: usize = 18;

/// A parsed scenario: meter configuration and the initial energy registers.
#[derive(Debug)]
pub struct Scenario {
    pub config: MeterConfig,
    pub energy: EnergyGrid,
}

impl Scenario {
    /// Loads `config.toml` from the scenario directory. A missing or invalid
    /// file logs a warning and yields the default scenario.
    pub fn load(dir: &Path) -> Self {
        let raw = match ScenarioConfig::from_toml_file(&dir.join("config.toml")) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("reading scenario config failed ({err}), proceeding with defaults");
                ScenarioConfig::default()
            }
        };

        let config = raw.to_meter_config();
        let energy = raw.initial_energy(config.tariff_count);
        Self { config, energy }
    }
}

impl Default for Scenario {
    fn default() -> Self {
        let config = MeterConfig::default();
        let energy = vec![Default::default(); config.tariff_count as usize];
        Self { config, energy }
    }
}

/// Scenario directory errors.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("cannot open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Structured per-line error of the update stream.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("line {line}: not an update record")]
    NotARecord { line: u64 },
    #[error("line {line}: expected {FIELD_COUNT} fields, found {count}")]
    FieldCount { line: u64, count: usize },
    #[error("line {line}: invalid {field} value {value:?}")]
    InvalidValue {
        line: u64,
        field: &'static str,
        value: String,
    },
    #[error("malformed update record: {0}")]
    Csv(#[from] csv::Error),
}

/// The update stream the engine consumes: lazy, finite, non-restartable.
pub type UpdateStream = Box<dyn Iterator<Item = Result<Update, UpdateError>> + Send>;

/// Cursor over the scheduled updates of a scenario.
///
/// Yields one `Result` per line: well-formed lines become [`Update`]s, lines
/// whose first byte is not a digit, wrong field counts and out-of-range
/// scalars become [`UpdateError`]s. End of file ends the iterator.
pub struct UpdateReader<R: io::Read = File> {
    records: csv::StringRecordsIntoIter<R>,
}

impl UpdateReader<File> {
    /// Opens `updates.csv` in the scenario directory. Unlike the config file
    /// this one is required.
    pub fn open(dir: &Path) -> Result<Self, ScenarioError> {
        let path = dir.join("updates.csv");
        let file = File::open(&path).map_err(|source| ScenarioError::Io { path, source })?;
        Ok(Self::from_reader(file))
    }
}

impl<R: io::Read> UpdateReader<R> {
    pub fn from_reader(reader: R) -> Self {
        let records = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader)
            .into_records();
        Self { records }
    }
}

impl<R: io::Read> Iterator for UpdateReader<R> {
    type Item = Result<Update, UpdateError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(
            record
                .map_err(UpdateError::from)
                .and_then(|rec| parse_record(&rec)),
        )
    }
}

fn parse_record(record: &csv::StringRecord) -> Result<Update, UpdateError> {
    let line = record.position().map_or(0, |pos| pos.line());

    let first = record.get(0).unwrap_or("");
    if !first.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return Err(UpdateError::NotARecord { line });
    }
    if record.len() != FIELD_COUNT {
        return Err(UpdateError::FieldCount {
            line,
            count: record.len(),
        });
    }

    let timestamp = int_field(record, 0, "timestamp", line, 0, i32::MAX as i64)? as i32;
    let tariff = int_field(
        record,
        1,
        "currentTariff",
        line,
        0,
        MAX_TARIFF_COUNT as i64 - 1,
    )? as u8;

    let mut instant = Instant {
        frequency: float_field(record, 2, "frequency", line, MAX_FREQUENCY)? as f32,
        ..Instant::default()
    };
    for i in 0..3 {
        instant.voltage[i] = float_field(record, 3 + i, "voltage", line, MAX_VOLTAGE)?;
    }
    for i in 0..3 {
        instant.current[i] = float_field(record, 6 + i, "current", line, MAX_CURRENT)?;
    }
    for i in 0..3 {
        instant.ui_angle[i] = float_field(record, 9 + i, "uiAngle", line, 360.0)?;
    }

    let mut thd = Thd::default();
    for i in 0..3 {
        thd.thd_u[i] = float_field(record, 12 + i, "thdU", line, MAX_THD)? as f32;
    }
    for i in 0..3 {
        thd.thd_i[i] = float_field(record, 15 + i, "thdI", line, MAX_THD)? as f32;
    }

    Ok(Update {
        timestamp,
        tariff,
        instant,
        thd,
    })
}

fn int_field(
    record: &csv::StringRecord,
    idx: usize,
    field: &'static str,
    line: u64,
    min: i64,
    max: i64,
) -> Result<i64, UpdateError> {
    let text = record.get(idx).unwrap_or("");
    match text.parse::<i64>() {
        Ok(v) if v >= min && v <= max => Ok(v),
        _ => Err(UpdateError::InvalidValue {
            line,
            field,
            value: text.to_string(),
        }),
    }
}

fn float_field(
    record: &csv::StringRecord,
    idx: usize,
    field: &'static str,
    line: u64,
    max: f64,
) -> Result<f64, UpdateError> {
    let text = record.get(idx).unwrap_or("");
    match text.parse::<f64>() {
        Ok(v) if v >= 0.0 && v <= max => Ok(v),
        _ => Err(UpdateError::InvalidValue {
            line,
            field,
            value: text.to_string(),
        }),
    }
}
