//! Authoritative wheel state. One value of [`WheelState`] exists per device;
//! after boot it is owned exclusively by the physics worker, and everything
//! the I/O side learns about it comes from published snapshots.

use num_enum::TryFromPrimitive;

use crate::pid::SpeedPi;
use crate::protection::Thresholds;

// Plant constants for the emulated wheel.
pub const WHEEL_INERTIA: f32 = 5.35e-5; // kg·m²
pub const TORQUE_CONSTANT: f32 = 0.0534; // N·m/A

// Loss torque model: viscous + Coulomb + ohmic, in N·m before the mN·m
// scaling in the integrator.
pub const LOSS_VISCOUS: f32 = 1e-5;
pub const LOSS_COULOMB: f32 = 5e-4;
pub const LOSS_OHMIC: f32 = 1e-4;

pub const BUS_VOLTAGE_NOMINAL: f32 = 28.;
/// Bus rise per watt of regenerated power while braking.
pub const BUS_REGEN_RISE_V_PER_W: f32 = 0.05;

pub const RPM_PER_RAD_S: f32 = 30. / core::f32::consts::PI;
pub const RAD_S_PER_RPM: f32 = core::f32::consts::PI / 30.;

/// Control law selector. The discriminants are the one-hot mode byte of the
/// APPLICATION-COMMAND payload.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ControlMode {
    Current = 0x01,
    Speed = 0x02,
    Torque = 0x04,
    Pwm = 0x08,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    #[default]
    Positive,
    Negative,
}

/// Synthetic housekeeping sources behind the TEMPERATURES, VOLTAGES and
/// CURRENTS telemetry blocks. Temperatures follow electrical power with a
/// first-order lag; the secondary rails are stiff.
#[derive(Clone, Copy)]
pub struct Housekeeping {
    pub temp_dcdc_c: f32,
    pub temp_enclosure_c: f32,
    pub temp_driver_c: f32,
    pub temp_motor_c: f32,
    pub rail_1v5_ma: f32,
    pub rail_3v3_ma: f32,
    pub rail_5va_ma: f32,
    pub rail_5vd_ma: f32,
    pub rail_12v_ma: f32,
    /// Signed: negative while regenerating into the bus.
    pub bus_current_a: f32,
}

pub const AMBIENT_C: f32 = 25.;

impl Default for Housekeeping {
    fn default() -> Self {
        Self {
            temp_dcdc_c: AMBIENT_C,
            temp_enclosure_c: AMBIENT_C,
            temp_driver_c: AMBIENT_C,
            temp_motor_c: AMBIENT_C,
            rail_1v5_ma: 120.,
            rail_3v3_ma: 85.,
            rail_5va_ma: 40.,
            rail_5vd_ma: 65.,
            rail_12v_ma: 30.,
            bus_current_a: 0.,
        }
    }
}

pub struct WheelState {
    /// Angular velocity, rad/s.
    pub omega: f32,
    /// Angular momentum, N·m·s. Held at `WHEEL_INERTIA * omega` after every
    /// integration step.
    pub momentum: f32,

    // Command inputs, engineering units.
    pub current_cmd_a: f32,
    pub speed_cmd_rpm: f32,
    pub torque_cmd_mnm: f32,
    pub duty_cmd_pct: f32,

    // Outputs of the last tick. `current_req_a` is the control law's ask
    // before the limiter chain; the soft-overcurrent warning keys on it.
    pub current_req_a: f32,
    pub current_out_a: f32,
    pub torque_out_mnm: f32,
    pub power_w: f32,
    pub bus_voltage_v: f32,

    pub mode: ControlMode,
    pub direction: Direction,
    pub pi: SpeedPi,

    pub thresholds: Thresholds,
    /// Protection enable mask, `protection` bit layout.
    pub protection_mask: u32,
    pub fault_status: u32,
    pub fault_latch: u32,
    pub warning_status: u32,
    pub lcl_tripped: bool,

    pub tick_count: u32,
    pub revolutions: u32,
    rev_frac: f32,

    pub housekeeping: Housekeeping,

    pub jitter_last_us: u32,
    pub jitter_max_us: u32,
}

impl WheelState {
    /// Power-on state: CURRENT mode, zero setpoints, default thresholds,
    /// all protections enabled, wheel at rest.
    pub fn boot() -> Self {
        Self {
            omega: 0.,
            momentum: 0.,
            current_cmd_a: 0.,
            speed_cmd_rpm: 0.,
            torque_cmd_mnm: 0.,
            duty_cmd_pct: 0.,
            current_req_a: 0.,
            current_out_a: 0.,
            torque_out_mnm: 0.,
            power_w: 0.,
            bus_voltage_v: BUS_VOLTAGE_NOMINAL,
            mode: ControlMode::Current,
            direction: Direction::Positive,
            pi: SpeedPi::default(),
            thresholds: Thresholds::default(),
            protection_mask: crate::protection::PROTECTION_ALL,
            fault_status: 0,
            fault_latch: 0,
            warning_status: 0,
            lcl_tripped: false,
            tick_count: 0,
            revolutions: 0,
            rev_frac: 0.,
            housekeeping: Housekeeping::default(),
            jitter_last_us: 0,
            jitter_max_us: 0,
        }
    }

    /// Hardware-reset event (reset line, or the scenario hook): everything
    /// returns to power-on defaults, including thresholds and the LCL, but
    /// the wheel keeps spinning: ω and H carry over.
    pub fn hardware_reset(&mut self) {
        let omega = self.omega;
        let momentum = self.momentum;
        let revolutions = self.revolutions;
        let rev_frac = self.rev_frac;
        *self = Self::boot();
        self.omega = omega;
        self.momentum = momentum;
        self.revolutions = revolutions;
        self.rev_frac = rev_frac;
    }

    /// Soft reset (SOFT_RESET register): command inputs, mode and PI scratch
    /// reinitialize and non-LCL latched faults clear; thresholds, the
    /// protection mask, counters and the LCL survive. ω and H carry over.
    pub fn soft_reset(&mut self) {
        self.current_cmd_a = 0.;
        self.speed_cmd_rpm = 0.;
        self.torque_cmd_mnm = 0.;
        self.duty_cmd_pct = 0.;
        self.mode = ControlMode::Current;
        self.direction = Direction::Positive;
        self.pi.reset();
        self.fault_status &= crate::protection::LATCH_LCL_BIT;
        self.fault_latch &= crate::protection::LATCH_LCL_BIT;
    }

    pub fn speed_rpm(&self) -> f32 {
        self.omega * RPM_PER_RAD_S
    }

    pub fn uptime_s(&self) -> u32 {
        (self.tick_count as f32 / crate::TICK_RATE) as u32
    }

    /// Fold one tick's worth of rotation into the revolution counter.
    pub(crate) fn accumulate_revolutions(&mut self, d_angle_rad: f32) {
        self.rev_frac += d_angle_rad / core::f32::consts::TAU;
        if self.rev_frac >= 1. {
            let whole = self.rev_frac as u32;
            self.revolutions = self.revolutions.wrapping_add(whole);
            self.rev_frac -= whole as f32;
        }
    }

    /// Record the measured duration of the previous tick. Fed by the
    /// firmware's cycle counter; the published max lags one tick.
    pub fn record_tick_time(&mut self, us: u32) {
        self.jitter_last_us = us;
        self.jitter_max_us = self.jitter_max_us.max(us);
    }
}
