//! Mapping of monotonic wall time onto virtual seconds.

use std::time::{Duration, Instant};

/// Sentinel: no pause is scheduled.
pub const PAUSE_NOT_SCHEDULED: i32 = i32::MAX;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Converts elapsed monotonic time to virtual seconds with an integer
/// speed-up, clamped so virtual time never passes a scheduled stop.
///
/// A fresh machine is stopped at virtual zero; [`TimeMachine::start`] anchors
/// it to a virtual instant and lets time flow.
#[derive(Debug)]
pub struct TimeMachine {
    /// Virtual time at the last rate or anchor switch (s).
    last_switch: i32,
    /// Monotonic instant of that switch.
    last_switch_real: Instant,
    speedup: u16,
    stop_time: i32,
}

impl TimeMachine {
    pub fn new(speedup: u16) -> Self {
        Self {
            last_switch: 0,
            last_switch_real: Instant::now(),
            speedup,
            stop_time: 0,
        }
    }

    fn elapsed_virtual(&self) -> i32 {
        let nanos = self.last_switch_real.elapsed().as_nanos() as i64;
        let seconds = nanos * self.speedup as i64 / NANOS_PER_SEC;
        seconds.min(i32::MAX as i64) as i32
    }

    /// Current virtual time, clamped to the scheduled stop.
    pub fn now(&self) -> i32 {
        self.last_switch
            .saturating_add(self.elapsed_virtual())
            .min(self.stop_time)
    }

    /// Converts a future virtual instant to an absolute monotonic deadline,
    /// for use with a condition-variable timed wait.
    pub fn wait_until(&self, wakeup: i32) -> Instant {
        let seconds = wakeup - self.now();
        debug_assert!(seconds >= 0);
        let nanos = seconds.max(0) as u64 * NANOS_PER_SEC as u64 / self.speedup as u64;
        Instant::now() + Duration::from_nanos(nanos)
    }

    /// Switches the rate. The virtual time reached under the old rate is
    /// captured first, so the new rate applies forward only.
    pub fn set_speedup(&mut self, speedup: u16) {
        let virtual_now = self.last_switch.saturating_add(self.elapsed_virtual());
        self.last_switch = virtual_now.min(self.stop_time);
        self.last_switch_real = Instant::now();
        self.speedup = speedup;
    }

    /// Anchors virtual time to `now` and lets it flow again. A stop that is
    /// already in the past is cleared; one scheduled for the future survives.
    pub fn start(&mut self, now: i32) {
        self.last_switch = now;
        self.last_switch_real = Instant::now();
        if self.stop_time <= now {
            self.stop_time = PAUSE_NOT_SCHEDULED;
        }
    }

    /// Schedules a stop. A stop cannot lie in the virtual past; the effective
    /// stop time is returned.
    pub fn set_stop(&mut self, stop_time: i32) -> i32 {
        self.stop_time = stop_time.max(self.now());
        self.stop_time
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_time == self.now()
    }
}
