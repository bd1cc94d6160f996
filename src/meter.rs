//! Public meter facade.
//!
//! Wraps the engine and the optional runner behind one handle. Every data
//! query that depends on virtual time first passes the runner's update
//! barrier, so a client always reads state integrated up to "now"; purely
//! structural queries (serial number, phase count, ...) skip the barrier.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::devices::{Device, DeviceError};
use crate::scenario::{Scenario, ScenarioError, UpdateReader};
use crate::sim::engine::Engine;
use crate::sim::runner::Runner;
use crate::sim::types::{
    Energy, Instant, Power, Thd, Vector, MAX_PHASE_COUNT, MAX_SPEEDUP,
};

/// Meter API errors.
#[derive(Debug, Error)]
pub enum MeterError {
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error("a runner already exists")]
    RunnerExists,
    #[error("no runner has been created")]
    NoRunner,
    #[error("runner thread could not be started: {0}")]
    RunnerSpawn(#[source] std::io::Error),
    #[error("stepping is refused while the runner is running")]
    Refused,
    #[error("speedup {0} out of range 1..={MAX_SPEEDUP}")]
    InvalidSpeedup(u16),
    #[error("tariff index {0} out of range")]
    InvalidTariff(usize),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// A simulated poly-phase energy meter.
///
/// Created from a scenario directory containing `config.toml` (optional) and
/// `updates.csv` (required). Virtual time advances either through
/// [`Meter::step_forward`] or through a runner created with
/// [`Meter::create_runner`].
pub struct Meter {
    engine: Arc<Engine>,
    runner: Option<Runner>,
}

impl Meter {
    /// Initializes the simulator from a scenario directory and applies the
    /// update scheduled for virtual second zero.
    pub fn open(dir: &Path) -> Result<Self, MeterError> {
        let updates = UpdateReader::open(dir)?;
        let scenario = Scenario::load(dir);
        let engine = Arc::new(Engine::new(scenario, Box::new(updates)));
        Ok(Self {
            engine,
            runner: None,
        })
    }

    fn barrier(&self) {
        if let Some(runner) = &self.runner {
            runner.update();
        }
    }

    fn runner(&self) -> Result<&Runner, MeterError> {
        self.runner.as_ref().ok_or(MeterError::NoRunner)
    }

    /// Creates the background runner. With `start == false` it comes up
    /// paused at virtual second zero and waits for [`Meter::resume`].
    pub fn create_runner(&mut self, start: bool) -> Result<(), MeterError> {
        if self.runner.is_some() {
            return Err(MeterError::RunnerExists);
        }
        let runner =
            Runner::spawn(Arc::clone(&self.engine), start).map_err(MeterError::RunnerSpawn)?;
        self.runner = Some(runner);
        Ok(())
    }

    /// Stops and joins the runner, if any. The engine stays usable through
    /// [`Meter::step_forward`].
    pub fn destroy_runner(&mut self) {
        if let Some(mut runner) = self.runner.take() {
            runner.finish();
        }
    }

    /// Resumes the runner; virtual time flows again from the current uptime.
    pub fn resume(&self) -> Result<(), MeterError> {
        let runner = self.runner()?;
        runner.update();
        runner.resume();
        Ok(())
    }

    /// Schedules a pause at virtual time `when`.
    pub fn pause(&self, when: i32) -> Result<(), MeterError> {
        let runner = self.runner()?;
        runner.update();
        runner.pause(when);
        Ok(())
    }

    /// Whether the runner exists and is currently advancing virtual time.
    pub fn is_running(&self) -> bool {
        match &self.runner {
            Some(runner) => {
                runner.update();
                runner.is_running()
            }
            None => false,
        }
    }

    /// Changes the virtual-to-real speed-up of the runner.
    pub fn set_speedup(&self, speedup: u16) -> Result<(), MeterError> {
        if speedup < 1 || speedup > MAX_SPEEDUP {
            return Err(MeterError::InvalidSpeedup(speedup));
        }
        let runner = self.runner()?;
        runner.update();
        runner.set_speedup(speedup);
        runner.update();
        Ok(())
    }

    /// Advances virtual time by `seconds`. Allowed only while no runner
    /// exists or the runner is paused.
    pub fn step_forward(&self, seconds: u32) -> Result<(), MeterError> {
        if let Some(runner) = &self.runner {
            if runner.is_running() {
                return Err(MeterError::Refused);
            }
        }
        self.engine
            .step_forward(seconds.min(i32::MAX as u32) as i32);
        Ok(())
    }

    /// Registers a device; returns its id. The device is polled on the next
    /// step.
    pub fn add_device(&self, device: Box<dyn Device>) -> Result<usize, MeterError> {
        self.barrier();
        let id = self.engine.devices().add(device)?;
        self.barrier();
        Ok(id)
    }

    /// Removes the device with the given id.
    pub fn remove_device(&self, id: usize) -> Result<(), MeterError> {
        self.barrier();
        self.engine.devices().remove(id)?;
        self.barrier();
        Ok(())
    }

    /// Tells the simulator that some device changed state, forcing a poll on
    /// the next step.
    pub fn notify_devices(&self) {
        self.barrier();
        self.engine.devices().notify();
        self.barrier();
    }

    pub fn tariff_count(&self) -> u8 {
        self.engine.tariff_count()
    }

    pub fn current_tariff(&self) -> u8 {
        self.barrier();
        self.engine.current_tariff()
    }

    pub fn serial_number(&self) -> String {
        self.engine.serial_number()
    }

    /// Current absolute time: start time plus uptime.
    pub fn time_utc(&self) -> i64 {
        self.engine.start_time() + self.uptime() as i64
    }

    /// Shifts the absolute clock so that `time` is "now". Uptime is
    /// preserved; the shift is atomic.
    pub fn set_time_utc(&self, time: i64) {
        self.barrier();
        let uptime = self.engine.uptime();
        self.engine.set_start_time(time - uptime as i64);
    }

    /// Virtual seconds elapsed since simulation start.
    pub fn uptime(&self) -> i32 {
        match &self.runner {
            Some(runner) => {
                runner.update();
                runner.time()
            }
            None => self.engine.uptime(),
        }
    }

    pub fn phase_count(&self) -> u8 {
        self.engine.phase_count()
    }

    pub fn frequency(&self) -> f32 {
        self.barrier();
        self.engine.frequency()
    }

    pub fn meter_constant(&self) -> u32 {
        self.engine.meter_constant()
    }

    pub fn instant(&self) -> Instant {
        self.barrier();
        self.engine.instant()
    }

    /// Energy register totals over all phases and tariffs.
    pub fn energy_total(&self) -> Energy {
        self.barrier();
        self.engine.energy_total()
    }

    /// Per-phase energy registers of one tariff, zero-padded to three
    /// phases.
    pub fn energy_tariff(&self, tariff: usize) -> Result<[Energy; MAX_PHASE_COUNT], MeterError> {
        self.barrier();
        self.engine
            .energy_tariff(tariff)
            .ok_or(MeterError::InvalidTariff(tariff))
    }

    pub fn power(&self) -> Power {
        self.barrier();
        self.engine.power()
    }

    pub fn vector(&self) -> Vector {
        self.barrier();
        self.engine.vector()
    }

    pub fn thd(&self) -> Thd {
        self.barrier();
        self.engine.thd()
    }
}

impl Drop for Meter {
    fn drop(&mut self) {
        self.destroy_runner();
    }
}
