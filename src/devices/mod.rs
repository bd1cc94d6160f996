//! Registry of external devices contributing phase currents.

pub mod types;

pub use types::{Device, DeviceResponse, InfoForDevice};

use std::sync::{Mutex, PoisonError};

use log::debug;
use thiserror::Error;

use crate::sim::calculator::{self, CurrentBias};
use crate::sim::types::{NO_UPDATE_SCHEDULED, UPDATE_NEEDED_NOW};

/// Number of device slots; the slot index doubles as the device id.
pub const MAX_DEVICES: usize = 32;

/// Device registry errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("all {MAX_DEVICES} device slots are occupied")]
    CapacityExhausted,
    #[error("no device registered under id {0}")]
    NoSuchDevice(usize),
}

struct Slots {
    devices: [Option<Box<dyn Device>>; MAX_DEVICES],
    next_update_time: i32,
}

/// Fixed-capacity registry of [`Device`] trait objects.
///
/// A single mutex guards the slot table and the aggregated next-update time
/// for the whole poll iteration, so device callbacks are serialized per
/// manager and only ever run on the engine's stepping thread.
pub struct DeviceManager {
    inner: Mutex<Slots>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Slots {
                devices: [const { None }; MAX_DEVICES],
                next_update_time: NO_UPDATE_SCHEDULED,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a device in the first free slot and returns its id.
    ///
    /// Arms the next-update time so the next engine step solicits the new
    /// device immediately.
    pub fn add(&self, device: Box<dyn Device>) -> Result<usize, DeviceError> {
        let mut slots = self.lock();
        let Some(id) = slots.devices.iter().position(|slot| slot.is_none()) else {
            return Err(DeviceError::CapacityExhausted);
        };

        slots.devices[id] = Some(device);
        slots.next_update_time = UPDATE_NEEDED_NOW;
        debug!("registered device {id}");
        Ok(id)
    }

    /// Frees the slot of the given device. The next-update time is left
    /// untouched.
    pub fn remove(&self, id: usize) -> Result<(), DeviceError> {
        if id >= MAX_DEVICES {
            return Err(DeviceError::NoSuchDevice(id));
        }

        let mut slots = self.lock();
        if slots.devices[id].take().is_none() {
            return Err(DeviceError::NoSuchDevice(id));
        }
        debug!("removed device {id}");
        Ok(())
    }

    /// Flags that some device changed state, forcing a poll on the next step.
    pub fn notify(&self) {
        self.lock().next_update_time = UPDATE_NEEDED_NOW;
    }

    /// Earliest virtual time any registered device wants to be polled at.
    pub fn next_update_time(&self) -> i32 {
        self.lock().next_update_time
    }

    /// Polls every registered device with a zeroed response, aggregates the
    /// returned currents into a bias and stores the minimum of the returned
    /// wake-up times.
    pub fn update_devices(&self, info: &InfoForDevice) -> (CurrentBias, i32) {
        let mut slots = self.lock();
        let Slots {
            devices,
            next_update_time,
        } = &mut *slots;

        *next_update_time = NO_UPDATE_SCHEDULED;
        let mut bias = CurrentBias::default();

        for device in devices.iter_mut().flatten() {
            let mut response = DeviceResponse::default();
            device.on_tick(info, &mut response);

            *next_update_time = (*next_update_time).min(response.next_update_time);
            calculator::accumulate_bias(&mut bias, &response);
        }

        (bias, *next_update_time)
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}
