//! Protection subsystem: thresholds, fault classification, latch and LCL
//! semantics.
//!
//! One bit layout is shared by the fault/warning status words, the latch,
//! the enable mask and the CLEAR-FAULT mask. Bits 0–3 are hard faults:
//! latched, current zeroed, and the low two also trip the LCL. Bits 4–7 are
//! warnings: recomputed every tick, never latched, no effect on actuation.

use num_traits::float::FloatCore;

use crate::state::WheelState;

pub const FAULT_OVERVOLTAGE: u32 = 1 << 0;
pub const FAULT_OVERSPEED: u32 = 1 << 1;
pub const FAULT_OVERDUTY: u32 = 1 << 2;
pub const FAULT_OVERPOWER: u32 = 1 << 3;
pub const WARN_SOFT_OVERCURRENT: u32 = 1 << 4;
pub const WARN_SOFT_OVERSPEED: u32 = 1 << 5;
pub const WARN_EDAC_SCRUB: u32 = 1 << 6;
pub const WARN_BRAKING_LOAD: u32 = 1 << 7;

pub const HARD_FAULT_MASK: u32 = FAULT_OVERVOLTAGE | FAULT_OVERSPEED | FAULT_OVERDUTY | FAULT_OVERPOWER;
/// Hard faults that also trip the latching current limiter.
pub const LCL_FAULT_MASK: u32 = FAULT_OVERVOLTAGE | FAULT_OVERSPEED;
pub const PROTECTION_ALL: u32 = 0xFF;

/// Latch-word bit mirroring the tripped LCL. CLEAR-FAULT cannot touch it;
/// only a hardware-reset event can.
pub const LATCH_LCL_BIT: u32 = 1 << 31;

/// Protection thresholds. All writable over the wire; restored to these
/// defaults by a hardware reset.
#[derive(Clone, Copy)]
pub struct Thresholds {
    pub overvoltage_v: f32,
    /// Latched, trips the LCL.
    pub overspeed_fault_rpm: f32,
    /// Warning only.
    pub overspeed_soft_rpm: f32,
    pub overpower_w: f32,
    pub soft_overcurrent_a: f32,
    pub max_duty_pct: f32,
    pub braking_load_v: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            overvoltage_v: 36.,
            overspeed_fault_rpm: 6_000.,
            overspeed_soft_rpm: 5_000.,
            overpower_w: 100.,
            soft_overcurrent_a: 6.,
            max_duty_pct: 97.85,
            braking_load_v: 31.,
        }
    }
}

/// One protection pass over the tick's measurements. Hard faults accumulate
/// in `fault_status` until cleared; the latch is a superset of every hard
/// fault seen. Warnings are rebuilt from scratch each call.
pub fn evaluate(state: &mut WheelState) {
    let t = &state.thresholds;
    let mask = state.protection_mask;
    let rpm = state.speed_rpm().abs();

    let mut faults = 0;
    let mut warnings = 0;

    if mask & FAULT_OVERVOLTAGE != 0 && state.bus_voltage_v > t.overvoltage_v {
        faults |= FAULT_OVERVOLTAGE;
    }
    if mask & FAULT_OVERSPEED != 0 && rpm > t.overspeed_fault_rpm {
        faults |= FAULT_OVERSPEED;
    }
    if mask & FAULT_OVERDUTY != 0 && state.duty_cmd_pct > t.max_duty_pct {
        faults |= FAULT_OVERDUTY;
    }
    if mask & FAULT_OVERPOWER != 0 && state.power_w.abs() > t.overpower_w {
        faults |= FAULT_OVERPOWER;
    }

    // Keyed on the request, not the output: the duty clamp caps the output
    // just under the soft limit, which would otherwise mask the saturation.
    if mask & WARN_SOFT_OVERCURRENT != 0 && state.current_req_a.abs() >= t.soft_overcurrent_a {
        warnings |= WARN_SOFT_OVERCURRENT;
    }
    if mask & WARN_SOFT_OVERSPEED != 0 && rpm > t.overspeed_soft_rpm {
        warnings |= WARN_SOFT_OVERSPEED;
    }
    if mask & WARN_BRAKING_LOAD != 0 && state.bus_voltage_v > t.braking_load_v {
        warnings |= WARN_BRAKING_LOAD;
    }

    state.fault_status |= faults;
    state.warning_status = warnings;

    if state.fault_status & LCL_FAULT_MASK != 0 {
        state.lcl_tripped = true;
    }

    state.fault_latch |= state.fault_status & HARD_FAULT_MASK;
    if state.lcl_tripped {
        state.fault_latch |= LATCH_LCL_BIT;
        state.fault_status |= LATCH_LCL_BIT;
    }
}

/// Apply a CLEAR-FAULT mask. The LCL latch bit is exempt; everything else
/// clears from both the active word and the latch.
pub fn clear_faults(state: &mut WheelState, mask: u32) {
    let mask = mask & !LATCH_LCL_BIT;
    state.fault_status &= !mask;
    state.fault_latch &= !mask;
}
