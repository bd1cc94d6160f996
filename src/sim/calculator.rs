//! Pure meter calculations.
//!
//! Everything here is a plain function over [`MeterState`]: deriving the
//! complex vector plane and power triangle from a scenario update plus the
//! aggregated device current, and integrating energy into the per-tariff,
//! per-phase registers. The instant is held constant between updates, so each
//! accumulation is an exact rectangle `dt * power`.

use num_complex::Complex64;

use crate::devices::{DeviceResponse, InfoForDevice};
use crate::sim::types::{EnergyRegister, MeterState, Power, Update, Vector};

/// Aggregated complex phase-current contribution of all registered devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentBias {
    pub current: [Complex64; 3],
}

/// Threshold below which a phase current is treated as zero.
const CURRENT_EPSILON: f64 = 1e-10;

fn phasor(magnitude: f64, angle_deg: f64) -> Complex64 {
    Complex64::from_polar(magnitude, angle_deg.to_radians())
}

fn apparent_magnitude(active: i64, reactive: i64) -> i64 {
    ((active as f64).powi(2) + (reactive as f64).powi(2)).sqrt() as i64
}

/// Seeds the apparent registers from the configured active and reactive
/// register values: quadrants I+IV feed the import side, II+III the export
/// side.
pub fn seed_apparent_registers(state: &mut MeterState) {
    for tariff in 0..state.cfg.tariff_count as usize {
        for phase in 0..state.cfg.phase_count as usize {
            let cell = &mut state.energy[tariff][phase];
            cell.apparent_plus.value = apparent_magnitude(
                cell.active_plus.value,
                cell.reactive[0].value + cell.reactive[3].value,
            );
            cell.apparent_minus.value = apparent_magnitude(
                cell.active_minus.value,
                cell.reactive[1].value + cell.reactive[2].value,
            );
        }
    }
}

/// Fills the complex phase voltages of `info` from an update, assuming the
/// phase-voltage angles sit at 0, 120 and 240 degrees.
pub fn prepare_info_for_device(upd: &Update, info: &mut InfoForDevice) {
    for i in 0..3 {
        info.voltage[i] = phasor(upd.instant.voltage[i], 120.0 * i as f64);
    }
}

/// Sums a device response into the running current bias.
pub fn accumulate_bias(bias: &mut CurrentBias, response: &DeviceResponse) {
    for i in 0..3 {
        bias.current[i] += response.current[i];
    }
}

/// Derives instant, power and vector data from a raw update and the device
/// current bias, and stores them into `state` together with the new tariff
/// and ThD snapshot.
pub fn handle_update(state: &mut MeterState, upd: &Update, bias: &CurrentBias) {
    let phases = state.cfg.phase_count as usize;

    let mut instant = upd.instant;
    let mut power = Power::default();
    let mut vector = Vector::default();

    // Phase-phase angles are fixed at 120 degrees.
    instant.pp_angle = [120.0, 120.0];

    for i in 0..phases {
        vector.phase_voltage[i] = phasor(instant.voltage[i], 120.0 * i as f64);

        let i_angle = 120.0 * i as f64 + instant.ui_angle[i];
        vector.phase_current[i] = phasor(instant.current[i], i_angle) + bias.current[i];

        vector.complex_neutral -= vector.phase_current[i];
    }

    for i in 0..phases {
        instant.current[i] = vector.phase_current[i].norm();

        if instant.current[i] < CURRENT_EPSILON {
            instant.current[i] = 0.0;
            instant.ui_angle[i] = 0.0;
        } else {
            // Bring the ui angle back into [0, 360) degrees.
            instant.ui_angle[i] = vector.phase_current[i].arg().to_degrees() - 120.0 * i as f64;
            while instant.ui_angle[i] < 0.0 {
                instant.ui_angle[i] += 360.0;
            }
        }
    }
    instant.current_neutral = vector.complex_neutral.norm();

    for i in 0..phases {
        power.apparent_power[i] = instant.voltage[i] * instant.current[i];
        power.true_power[i] = instant.ui_angle[i].to_radians().cos() * power.apparent_power[i];
        power.reactive_power[i] = instant.ui_angle[i].to_radians().sin() * power.apparent_power[i];
        power.phi[i] = instant.ui_angle[i];
    }

    for i in 0..phases {
        vector.complex_power[i] = phasor(power.apparent_power[i], instant.ui_angle[i]);
    }

    state.current_tariff = upd.tariff;
    state.instant = instant;
    state.thd = upd.thd;
    state.power = power;
    state.vector = vector;
}

/// Integrates `dt` seconds of the current power triangle into the energy
/// registers of the active tariff.
///
/// Register routing: negative active energy credits the export registers,
/// non-negative the import ones; the reactive quadrant follows the sign pair
/// (active, reactive) as I..IV; apparent registers only ever take the
/// magnitude.
pub fn accumulate_energy(state: &mut MeterState, dt: i32) {
    let tariff = state.current_tariff as usize;

    for i in 0..state.cfg.phase_count as usize {
        let eapparent = EnergyRegister::from_f64(dt as f64 * state.power.apparent_power[i]);
        let ereactive = EnergyRegister::from_f64(dt as f64 * state.power.reactive_power[i]);
        let eactive = EnergyRegister::from_f64(dt as f64 * state.power.true_power[i]);

        let reactive_positive = ereactive.value >= 0;
        let cell = &mut state.energy[tariff][i];

        let quadrant = if eactive.value < 0 {
            cell.active_minus.add_signed(&eactive, -1);
            cell.apparent_minus.add_signed(&eapparent, 1);
            if reactive_positive { 1 } else { 2 }
        } else {
            cell.active_plus.add_signed(&eactive, 1);
            cell.apparent_plus.add_signed(&eapparent, 1);
            if reactive_positive { 0 } else { 3 }
        };

        cell.reactive[quadrant].add_signed(&ereactive, if reactive_positive { 1 } else { -1 });
    }
}
