//! Simulation engine: owns the meter state and advances virtual time from
//! event to event.

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::warn;

use crate::devices::{DeviceManager, InfoForDevice};
use crate::scenario::{Scenario, UpdateStream};
use crate::sim::calculator::{self, CurrentBias};
use crate::sim::types::{
    Energy, Instant, MeterState, Power, Thd, Update, Vector, MAX_PHASE_COUNT,
    NO_UPDATE_SCHEDULED,
};

struct EngineInner {
    state: MeterState,
    /// Virtual seconds since simulation start.
    now: i32,
    curr_update: Update,
    next_update: Update,
    /// Timestamp of `next_update`, or [`NO_UPDATE_SCHEDULED`].
    next_config_update_time: i32,
    /// Device current bias from the last poll.
    bias: CurrentBias,
    updates: UpdateStream,
}

impl EngineInner {
    /// Pulls the next usable update from the scenario stream, skipping
    /// malformed lines, stale timestamps and out-of-range tariffs. Parks the
    /// schedule at the sentinel once the stream is exhausted.
    fn refill_next_update(&mut self) {
        loop {
            match self.updates.next() {
                None => {
                    self.next_config_update_time = NO_UPDATE_SCHEDULED;
                    return;
                }
                Some(Err(err)) => {
                    warn!("skipping scenario update: {err}");
                }
                Some(Ok(upd)) => {
                    if upd.timestamp > self.now && upd.tariff < self.state.cfg.tariff_count {
                        self.next_config_update_time = upd.timestamp;
                        self.next_update = upd;
                        return;
                    }
                }
            }
        }
    }
}

/// The virtual-time simulation engine.
///
/// All meter state lives behind one mutex held for the duration of a
/// [`Engine::step_forward`] call and of each query, so queries always observe
/// a state integrated up to a single virtual instant. The device registry
/// keeps its own lock and is only ever polled from inside a step.
pub struct Engine {
    inner: Mutex<EngineInner>,
    devices: DeviceManager,
}

impl Engine {
    /// Builds the engine from a parsed scenario and its update stream, then
    /// applies the update scheduled for virtual second zero.
    pub fn new(scenario: Scenario, updates: UpdateStream) -> Self {
        let Scenario { config, energy } = scenario;
        let mut state = MeterState::new(config, energy);
        calculator::seed_apparent_registers(&mut state);

        let engine = Self {
            inner: Mutex::new(EngineInner {
                state,
                now: -1,
                curr_update: Update::default(),
                next_update: Update::default(),
                next_config_update_time: 0,
                bias: CurrentBias::default(),
                updates,
            }),
            devices: DeviceManager::new(),
        };

        {
            let mut inner = engine.lock();
            inner.refill_next_update();
            inner.now = 0;
        }
        engine.step_forward(0);

        engine
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    /// Advances virtual time by `seconds`, integrating energy between events
    /// and polling devices at scenario updates and at their requested wake-up
    /// times.
    pub fn step_forward(&self, seconds: i32) {
        debug_assert!(seconds >= 0);

        let mut inner = self.lock();
        let end = inner.now.saturating_add(seconds.max(0));

        loop {
            let device_next = self.devices.next_update_time();
            let next = device_next
                .min(inner.next_config_update_time)
                .max(inner.now)
                .min(end);

            let dt = next - inner.now;
            calculator::accumulate_energy(&mut inner.state, dt);
            inner.now = next;

            if inner.now == inner.next_config_update_time {
                inner.curr_update = inner.next_update;
                let mut info = InfoForDevice::default();
                calculator::prepare_info_for_device(&inner.curr_update, &mut info);
                inner.refill_next_update();

                self.poll_devices(&mut inner, &mut info);
                let (upd, bias) = (inner.curr_update, inner.bias);
                calculator::handle_update(&mut inner.state, &upd, &bias);
            } else if device_next != NO_UPDATE_SCHEDULED && inner.now >= device_next {
                let mut info = InfoForDevice::default();
                calculator::prepare_info_for_device(&inner.curr_update, &mut info);

                self.poll_devices(&mut inner, &mut info);
                let (upd, bias) = (inner.curr_update, inner.bias);
                calculator::handle_update(&mut inner.state, &upd, &bias);
            } else {
                debug_assert!(inner.now == end);
            }

            if inner.now >= end {
                break;
            }
        }
    }

    fn poll_devices(&self, inner: &mut EngineInner, info: &mut InfoForDevice) {
        info.now = inner.now;
        info.now_utc = inner.now as i64 + inner.state.cfg.start_time;
        let (bias, _) = self.devices.update_devices(info);
        inner.bias = bias;
    }

    /// Earliest upcoming event: the sooner of the next scenario update and the
    /// next device wake-up, clamped to the current virtual time.
    pub fn next_update_time(&self) -> i32 {
        let inner = self.lock();
        self.devices
            .next_update_time()
            .min(inner.next_config_update_time)
            .max(inner.now)
    }

    pub fn uptime(&self) -> i32 {
        self.lock().now
    }

    pub fn tariff_count(&self) -> u8 {
        self.lock().state.cfg.tariff_count
    }

    pub fn current_tariff(&self) -> u8 {
        self.lock().state.current_tariff
    }

    pub fn serial_number(&self) -> String {
        self.lock().state.cfg.serial_number.clone()
    }

    pub fn phase_count(&self) -> u8 {
        self.lock().state.cfg.phase_count
    }

    pub fn frequency(&self) -> f32 {
        self.lock().state.instant.frequency
    }

    pub fn meter_constant(&self) -> u32 {
        self.lock().state.cfg.meter_constant
    }

    pub fn speedup(&self) -> u16 {
        self.lock().state.cfg.speedup
    }

    pub fn start_time(&self) -> i64 {
        self.lock().state.cfg.start_time
    }

    pub fn set_start_time(&self, start_time: i64) {
        self.lock().state.cfg.start_time = start_time;
    }

    pub fn instant(&self) -> Instant {
        self.lock().state.instant
    }

    pub fn power(&self) -> Power {
        self.lock().state.power
    }

    pub fn vector(&self) -> Vector {
        self.lock().state.vector
    }

    pub fn thd(&self) -> Thd {
        self.lock().state.thd
    }

    /// Sum of the integer register totals over every (tariff, phase) cell.
    pub fn energy_total(&self) -> Energy {
        let inner = self.lock();
        let mut total = Energy::default();

        for tariff in 0..inner.state.cfg.tariff_count as usize {
            for phase in 0..inner.state.cfg.phase_count as usize {
                let cell = &inner.state.energy[tariff][phase];
                total.active_plus.value += cell.active_plus.value;
                total.active_minus.value += cell.active_minus.value;
                total.apparent_plus.value += cell.apparent_plus.value;
                total.apparent_minus.value += cell.apparent_minus.value;
                for i in 0..4 {
                    total.reactive[i].value += cell.reactive[i].value;
                }
            }
        }
        total
    }

    /// Per-phase registers of one tariff, zero-padded to three phases.
    /// Returns `None` for a tariff index out of range.
    pub fn energy_tariff(&self, tariff: usize) -> Option<[Energy; MAX_PHASE_COUNT]> {
        let inner = self.lock();
        if tariff >= inner.state.cfg.tariff_count as usize {
            return None;
        }

        let mut ret = [Energy::default(); MAX_PHASE_COUNT];
        let phases = inner.state.cfg.phase_count as usize;
        ret[..phases].copy_from_slice(&inner.state.energy[tariff][..phases]);
        Some(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceResponse;
    use crate::scenario::UpdateError;
    use crate::sim::types::{EnergyGrid, MeterConfig, Thd, UPDATE_NEEDED_NOW};
    use num_complex::Complex64;

    fn stream(updates: Vec<Update>) -> UpdateStream {
        Box::new(updates.into_iter().map(Ok::<_, UpdateError>))
    }

    fn scenario(tariff_count: u8) -> Scenario {
        let config = MeterConfig {
            tariff_count,
            ..MeterConfig::default()
        };
        let energy: EnergyGrid = vec![Default::default(); tariff_count as usize];
        Scenario { config, energy }
    }

    fn update_at(timestamp: i32, tariff: u8, voltage: f64, current: f64, angle: f64) -> Update {
        Update {
            timestamp,
            tariff,
            instant: crate::sim::types::Instant {
                voltage: [voltage; 3],
                current: [current; 3],
                ui_angle: [angle; 3],
                ..Default::default()
            },
            thd: Thd::default(),
        }
    }

    /// Integer registers are taken by truncation, so they may sit 1 Ws below
    /// the analytic value.
    fn assert_register(expected: i64, actual: i64) {
        assert!(
            actual >= expected - 1 && actual <= expected,
            "expected {expected} (tolerance 1), got {actual}"
        );
    }

    #[test]
    fn constant_load_integrates_rectangles() {
        let engine = Engine::new(scenario(1), stream(vec![update_at(0, 0, 220.0, 50.0, 0.0)]));

        engine.step_forward(3);

        let per_tariff = engine.energy_tariff(0).expect("tariff 0 exists");
        for phase in 0..3 {
            assert_register(3 * 50 * 220, per_tariff[phase].active_plus.value);
        }
        let total = engine.energy_total().active_plus.value;
        assert!(total >= 3 * 3 * 50 * 220 - 3 && total <= 3 * 3 * 50 * 220);
        assert_eq!(engine.uptime(), 3);
    }

    #[test]
    fn uptime_is_monotone_and_zero_step_is_allowed() {
        let engine = Engine::new(scenario(1), stream(vec![update_at(0, 0, 230.0, 10.0, 0.0)]));
        let mut last = engine.uptime();
        for seconds in [0, 1, 0, 5, 2, 0] {
            engine.step_forward(seconds);
            let now = engine.uptime();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 8);
    }

    #[test]
    fn scheduled_update_switches_tariff_and_instant() {
        let updates = vec![
            update_at(0, 0, 220.0, 50.0, 0.0),
            update_at(10, 4, 240.0, 20.0, 0.0),
        ];
        let engine = Engine::new(scenario(5), stream(updates));

        engine.step_forward(5);
        assert_eq!(engine.current_tariff(), 0);
        assert_eq!(engine.instant().voltage[0], 220.0);

        engine.step_forward(5);
        assert_eq!(engine.current_tariff(), 4);
        assert_eq!(engine.instant().voltage[0], 240.0);

        // Energy before the switch went to tariff 0, at the old instant.
        let t0 = engine.energy_tariff(0).expect("tariff 0");
        assert_register(10 * 50 * 220, t0[0].active_plus.value);
        let t4 = engine.energy_tariff(4).expect("tariff 4");
        assert_eq!(t4[0].active_plus.value, 0);
    }

    #[test]
    fn stale_and_out_of_range_updates_are_skipped() {
        let updates = vec![
            update_at(0, 0, 220.0, 50.0, 0.0),
            // Tariff out of range for a single-tariff meter.
            update_at(3, 3, 100.0, 1.0, 0.0),
            update_at(8, 0, 300.0, 1.0, 0.0),
            // Behind virtual time once the cursor reaches it.
            update_at(5, 0, 110.0, 1.0, 0.0),
        ];
        let engine = Engine::new(scenario(1), stream(updates));

        engine.step_forward(6);
        assert_eq!(engine.instant().voltage[0], 220.0);

        engine.step_forward(4);
        assert_eq!(engine.instant().voltage[0], 300.0);
        assert_eq!(engine.next_update_time(), NO_UPDATE_SCHEDULED);
    }

    #[test]
    fn malformed_stream_entries_are_skipped() {
        let entries: Vec<Result<Update, UpdateError>> = vec![
            Ok(update_at(0, 0, 220.0, 50.0, 0.0)),
            Err(UpdateError::NotARecord { line: 2 }),
            Ok(update_at(4, 0, 330.0, 5.0, 0.0)),
        ];
        let engine = Engine::new(scenario(1), Box::new(entries.into_iter()));

        engine.step_forward(4);
        assert_eq!(engine.instant().voltage[0], 330.0);
    }

    #[test]
    fn exhausted_stream_parks_the_schedule() {
        let engine = Engine::new(scenario(1), stream(vec![update_at(0, 0, 220.0, 50.0, 0.0)]));
        assert_eq!(engine.next_update_time(), NO_UPDATE_SCHEDULED);
        engine.step_forward(100);
        assert_eq!(engine.uptime(), 100);
    }

    #[test]
    fn energy_tariff_rejects_out_of_range_index() {
        let engine = Engine::new(scenario(2), stream(vec![update_at(0, 0, 220.0, 50.0, 0.0)]));
        assert!(engine.energy_tariff(1).is_some());
        assert!(engine.energy_tariff(2).is_none());
    }

    #[test]
    fn per_tariff_energy_sums_to_total() {
        let updates = vec![
            update_at(0, 0, 220.0, 50.0, 30.0),
            update_at(7, 1, 230.0, 40.0, 290.0),
        ];
        let engine = Engine::new(scenario(2), stream(updates));
        engine.step_forward(20);

        let total = engine.energy_total();
        let mut summed = Energy::default();
        for tariff in 0..2 {
            let per_phase = engine.energy_tariff(tariff).expect("tariff exists");
            for cell in &per_phase {
                summed.active_plus.value += cell.active_plus.value;
                summed.active_minus.value += cell.active_minus.value;
                summed.apparent_plus.value += cell.apparent_plus.value;
                summed.apparent_minus.value += cell.apparent_minus.value;
                for i in 0..4 {
                    summed.reactive[i].value += cell.reactive[i].value;
                }
            }
        }
        assert_eq!(summed, total);
    }

    #[test]
    fn device_poll_runs_at_requested_wakeup() {
        let engine = Engine::new(scenario(1), stream(vec![update_at(0, 0, 230.0, 10.0, 0.0)]));

        // Current grows with virtual time until t = 60, then drops out.
        engine
            .devices()
            .add(Box::new(
                |info: &InfoForDevice, response: &mut DeviceResponse| {
                    if info.now < 60 {
                        response.current[0] = Complex64::new(info.now as f64, 0.0);
                        response.next_update_time = info.now + 1;
                    } else {
                        response.next_update_time = NO_UPDATE_SCHEDULED;
                    }
                },
            ))
            .expect("slot available");

        engine.step_forward(59);
        assert!((engine.instant().current[0] - 69.0).abs() < 1e-9);

        engine.step_forward(1);
        assert!((engine.instant().current[0] - 10.0).abs() < 1e-9);

        engine.step_forward(1000);
        assert!((engine.instant().current[0] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn notify_triggers_a_poll_on_a_zero_step() {
        let engine = Engine::new(scenario(1), stream(vec![update_at(0, 0, 230.0, 10.0, 0.0)]));

        let mut on = true;
        engine
            .devices()
            .add(Box::new(
                move |_: &InfoForDevice, response: &mut DeviceResponse| {
                    response.current[0] = if on {
                        Complex64::new(10.0, 0.0)
                    } else {
                        Complex64::new(-15.0, 0.0)
                    };
                    on = !on;
                    response.next_update_time = NO_UPDATE_SCHEDULED;
                },
            ))
            .expect("slot available");
        assert_eq!(engine.devices().next_update_time(), UPDATE_NEEDED_NOW);

        engine.step_forward(0);
        assert!((engine.instant().current[0] - 20.0).abs() < 1e-9);

        engine.devices().notify();
        engine.step_forward(0);
        assert!((engine.instant().current[0] - 5.0).abs() < 1e-9);
        let vector = engine.vector();
        assert!((vector.phase_current[0].re - (-5.0)).abs() < 1e-9);
        assert!(vector.phase_current[0].im.abs() < 1e-9);
    }
}
