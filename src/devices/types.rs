//! Device-facing protocol types.

use num_complex::Complex64;

use crate::sim::types::{MAX_PHASE_COUNT, UPDATE_NEEDED_NOW};

/// Snapshot handed to every device when the engine polls it.
#[derive(Debug, Clone, Copy, Default)]
pub struct InfoForDevice {
    /// Complex phase voltages at the current update.
    pub voltage: [Complex64; MAX_PHASE_COUNT],
    /// Current virtual time (seconds since simulation start).
    pub now: i32,
    /// Current absolute time (UTC seconds).
    pub now_utc: i64,
}

/// Per-poll reply of a device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceResponse {
    /// Additive complex current per phase (A).
    pub current: [Complex64; MAX_PHASE_COUNT],
    /// Virtual time at which the device wants its next poll;
    /// [`crate::sim::types::NO_UPDATE_SCHEDULED`] for none.
    pub next_update_time: i32,
}

impl Default for DeviceResponse {
    /// Zeroed currents with the next poll due immediately, so a device that
    /// never touches `next_update_time` keeps being polled on every step.
    fn default() -> Self {
        Self {
            current: [Complex64::default(); MAX_PHASE_COUNT],
            next_update_time: UPDATE_NEEDED_NOW,
        }
    }
}

/// An external load or source that contributes additive complex phase
/// currents between scenario updates.
///
/// `on_tick` runs on the simulation worker with the device registry locked:
/// it may block and may use its own state freely, but must not call back into
/// the meter API.
pub trait Device: Send {
    fn on_tick(&mut self, info: &InfoForDevice, response: &mut DeviceResponse);
}

impl<F> Device for F
where
    F: FnMut(&InfoForDevice, &mut DeviceResponse) + Send,
{
    fn on_tick(&mut self, info: &InfoForDevice, response: &mut DeviceResponse) {
        self(info, response)
    }
}
