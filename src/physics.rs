//! The 100 Hz physics and control kernel.
//!
//! [`run_tick`] is the whole real-time path: drain the mailbox, run the
//! active control law, clamp, integrate, evaluate protections, publish the
//! snapshot. It performs arithmetic only (no I/O, no logging, no waiting),
//! so it fits the tick's latency floor from a timer interrupt.

use num_traits::float::FloatCore;

use crate::exchange::{Exchange, KernelCommand, ThresholdId};
use crate::protection;
use crate::state::{
    ControlMode, Direction, WheelState, AMBIENT_C, BUS_REGEN_RISE_V_PER_W, BUS_VOLTAGE_NOMINAL,
    LOSS_COULOMB, LOSS_OHMIC, LOSS_VISCOUS, RAD_S_PER_RPM, TORQUE_CONSTANT, WHEEL_INERTIA,
};
use crate::telemetry::TelemetrySnapshot;

use crate::DT;

/// Below this speed the power limit is meaningless (divide-by-near-zero) and
/// is skipped.
const POWER_LIMIT_MIN_OMEGA: f32 = 1e-3;

/// The power clamp sits a hair under the protection threshold so the
/// comparator never sees the clamp's own float rounding as an overpower.
const POWER_LIMIT_MARGIN: f32 = 0.999;

// Thermal model: first-order lag toward ambient plus a power-coupled rise.
const THERMAL_LAG: f32 = 0.0005; // per tick fraction, ~20 s time constant
const RISE_DCDC_C_PER_W: f32 = 0.10;
const RISE_ENCLOSURE_C_PER_W: f32 = 0.05;
const RISE_DRIVER_C_PER_W: f32 = 0.20;
const RISE_MOTOR_C_PER_W: f32 = 0.35;

/// One physics tick. The only function that mutates wheel state after boot.
pub fn run_tick(state: &mut WheelState, exchange: &Exchange) {
    if exchange.take_hardware_reset() {
        state.hardware_reset();
    }
    if let Some(envelope) = exchange.take_command() {
        apply_command(state, envelope.command);
    }

    // A latched fault or a tripped LCL holds the drive at zero; the control
    // law is skipped entirely so the PI can't wind up against a dead output.
    let inhibited = state.lcl_tripped || state.fault_latch != 0;
    let requested = if inhibited { 0. } else { control_law(state) };
    state.current_req_a = requested;
    state.current_out_a = apply_limits(state, requested);

    integrate(state);
    update_housekeeping(state);
    protection::evaluate(state);

    if state.lcl_tripped || state.fault_latch != 0 {
        state.current_out_a = 0.;
    }
    debug_assert!(!state.lcl_tripped || state.current_out_a == 0.);

    state.tick_count = state.tick_count.wrapping_add(1);
    exchange.publish_snapshot(TelemetrySnapshot::capture(state));
}

fn apply_command(state: &mut WheelState, command: KernelCommand) {
    match command {
        KernelCommand::SetMode(mode, setpoint) => {
            state.mode = mode;
            match mode {
                ControlMode::Current => state.current_cmd_a = setpoint,
                ControlMode::Speed => {
                    state.speed_cmd_rpm = setpoint;
                    state.pi.reset();
                }
                ControlMode::Torque => state.torque_cmd_mnm = setpoint,
                ControlMode::Pwm => set_duty(state, setpoint),
            }
        }
        KernelCommand::SetCurrentSetpoint(amps) => state.current_cmd_a = amps,
        KernelCommand::SetSpeedSetpoint(rpm) => state.speed_cmd_rpm = rpm,
        KernelCommand::SetTorqueSetpoint(mnm) => state.torque_cmd_mnm = mnm,
        KernelCommand::SetDutySetpoint(duty) => set_duty(state, duty),
        KernelCommand::SetDirection(direction) => state.direction = direction,
        KernelCommand::SetThreshold(id, value) => {
            let t = &mut state.thresholds;
            match id {
                ThresholdId::Overvoltage => t.overvoltage_v = value,
                ThresholdId::OverspeedFault => t.overspeed_fault_rpm = value,
                ThresholdId::OverspeedSoft => t.overspeed_soft_rpm = value,
                ThresholdId::Overpower => t.overpower_w = value,
                ThresholdId::SoftOvercurrent => t.soft_overcurrent_a = value,
                ThresholdId::MaxDuty => t.max_duty_pct = value,
                ThresholdId::BrakingLoad => t.braking_load_v = value,
            }
        }
        KernelCommand::ClearFault(mask) => protection::clear_faults(state, mask),
        KernelCommand::ConfigureProtection(mask) => state.protection_mask = mask,
        KernelCommand::TripLcl => {
            state.lcl_tripped = true;
            state.fault_latch = 0xFFFF_FFFF;
            state.current_out_a = 0.;
        }
        KernelCommand::SoftReset => state.soft_reset(),
    }
}

/// Signed duty setpoint: magnitude drives the duty command, sign selects
/// direction, same as the wire encoding it came from.
fn set_duty(state: &mut WheelState, duty: f32) {
    state.duty_cmd_pct = duty.abs();
    state.direction = if duty < 0. {
        Direction::Negative
    } else {
        Direction::Positive
    };
}

/// The active control law's commanded current, amps, before limits.
fn control_law(state: &mut WheelState) -> f32 {
    match state.mode {
        ControlMode::Current => state.current_cmd_a,
        ControlMode::Speed => {
            let setpoint = state.speed_cmd_rpm * RAD_S_PER_RPM;
            state.pi.update(setpoint, state.omega, DT)
        }
        ControlMode::Torque => (state.torque_cmd_mnm / 1_000.) / TORQUE_CONSTANT,
        ControlMode::Pwm => (state.duty_cmd_pct / 100.) * state.thresholds.soft_overcurrent_a,
    }
}

/// Saturating clamps, in the ICD's order: power, soft overcurrent, duty.
fn apply_limits(state: &WheelState, mut current: f32) -> f32 {
    let t = &state.thresholds;

    if state.omega.abs() > POWER_LIMIT_MIN_OMEGA {
        let limit = (t.overpower_w * POWER_LIMIT_MARGIN / state.omega.abs()) / TORQUE_CONSTANT;
        current = current.clamp(-limit, limit);
    }

    current = current.clamp(-t.soft_overcurrent_a, t.soft_overcurrent_a);

    let duty_limit = t.soft_overcurrent_a * (t.max_duty_pct / 100.);
    current.clamp(-duty_limit, duty_limit)
}

/// Explicit-Euler step of the rotational dynamics, plus the derived outputs.
fn integrate(state: &mut WheelState) {
    let current = state.current_out_a;

    let mut torque_motor_mnm = 1_000. * TORQUE_CONSTANT * current;
    if state.direction == Direction::Negative {
        torque_motor_mnm = -torque_motor_mnm;
    }

    let torque_loss_mnm = 1_000.
        * (LOSS_VISCOUS * state.omega
            + LOSS_COULOMB * sign_of(state.omega)
            + LOSS_OHMIC * current * current);

    let torque_net_mnm = torque_motor_mnm - torque_loss_mnm;
    let alpha = (torque_net_mnm / 1_000.) / WHEEL_INERTIA;

    // Electrical power at the speed the limiter saw. Using the post-step ω
    // would let the integrator's own Δω push a fully-clamped drive past the
    // overpower threshold.
    state.power_w = (torque_motor_mnm / 1_000.) * state.omega;

    state.omega += alpha * DT;
    state.momentum = WHEEL_INERTIA * state.omega;
    state.torque_out_mnm = torque_motor_mnm;

    state.accumulate_revolutions(state.omega.abs() * DT);
}

/// `sign(0) = 0`, so the Coulomb term vanishes at rest instead of kicking
/// the wheel.
fn sign_of(x: f32) -> f32 {
    if x > 0. {
        1.
    } else if x < 0. {
        -1.
    } else {
        0.
    }
}

fn update_housekeeping(state: &mut WheelState) {
    let power = state.power_w;

    // Regenerated power lifts the bus; driving holds it at nominal.
    let bus_v = if power < 0. {
        BUS_VOLTAGE_NOMINAL + BUS_REGEN_RISE_V_PER_W * power.abs()
    } else {
        BUS_VOLTAGE_NOMINAL
    };
    state.bus_voltage_v = bus_v;

    let hk = &mut state.housekeeping;
    let pull = |temp: &mut f32, rise_per_w: f32| {
        let target = AMBIENT_C + rise_per_w * power.abs();
        *temp += (target - *temp) * THERMAL_LAG;
    };
    pull(&mut hk.temp_dcdc_c, RISE_DCDC_C_PER_W);
    pull(&mut hk.temp_enclosure_c, RISE_ENCLOSURE_C_PER_W);
    pull(&mut hk.temp_driver_c, RISE_DRIVER_C_PER_W);
    pull(&mut hk.temp_motor_c, RISE_MOTOR_C_PER_W);
    hk.bus_current_a = power / bus_v;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MAILBOX_RETRY_ATTEMPTS;
    use crate::protection::{
        FAULT_OVERSPEED, LATCH_LCL_BIT, WARN_SOFT_OVERCURRENT, WARN_SOFT_OVERSPEED,
    };

    fn run_ticks(state: &mut WheelState, exchange: &Exchange, n: u32) {
        for _ in 0..n {
            run_tick(state, exchange);
        }
    }

    fn no_pause() {}

    #[test]
    fn momentum_tracks_omega_every_tick() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        exchange
            .submit(KernelCommand::SetMode(ControlMode::Speed, 4_000.))
            .unwrap();

        for _ in 0..1_000 {
            run_tick(&mut state, &exchange);
            assert!((state.momentum - WHEEL_INERTIA * state.omega).abs() < 1e-9);
        }
    }

    #[test]
    fn command_applied_within_two_ticks() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        exchange
            .submit(KernelCommand::SetCurrentSetpoint(2.))
            .unwrap();

        run_ticks(&mut state, &exchange, 2);
        assert_eq!(state.current_cmd_a, 2.);
        assert!(exchange.mailbox_is_empty());
    }

    #[test]
    fn speed_mode_converges() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        exchange
            .submit(KernelCommand::SetMode(ControlMode::Speed, 3_000.))
            .unwrap();

        // 5 s of simulated time.
        run_ticks(&mut state, &exchange, 500);
        assert!(
            (state.speed_rpm() - 3_000.).abs() < 50.,
            "converged to {} RPM",
            state.speed_rpm()
        );
        assert!(!state.lcl_tripped);
        assert_eq!(state.fault_latch, 0);
    }

    #[test]
    fn overspeed_command_trips_lcl_quickly() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        exchange
            .submit(KernelCommand::SetMode(ControlMode::Speed, 6_001.))
            .unwrap();

        run_ticks(&mut state, &exchange, 30);
        assert!(state.lcl_tripped);
        assert_ne!(state.fault_latch & FAULT_OVERSPEED, 0);
        assert_eq!(state.current_out_a, 0.);
    }

    #[test]
    fn lcl_holds_through_clear_fault() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        exchange
            .submit(KernelCommand::SetMode(ControlMode::Speed, 6_500.))
            .unwrap();
        run_ticks(&mut state, &exchange, 200);
        assert!(state.lcl_tripped);

        exchange
            .submit(KernelCommand::ClearFault(0xFFFF_FFFF))
            .unwrap();
        run_ticks(&mut state, &exchange, 50);

        assert!(state.lcl_tripped);
        assert_ne!(state.fault_latch & LATCH_LCL_BIT, 0);
        assert_eq!(state.current_out_a, 0.);
    }

    #[test]
    fn hardware_reset_releases_lcl_but_keeps_spin() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        exchange
            .submit(KernelCommand::SetMode(ControlMode::Speed, 6_500.))
            .unwrap();
        run_ticks(&mut state, &exchange, 200);
        assert!(state.lcl_tripped);
        let omega = state.omega;
        assert!(omega != 0.);

        exchange.request_hardware_reset();
        run_tick(&mut state, &exchange);

        assert!(!state.lcl_tripped);
        // ω carried over, minus one tick of coast-down losses.
        assert!((state.omega - omega).abs() < 2.);
        assert!((state.momentum - WHEEL_INERTIA * state.omega).abs() < 1e-9);
    }

    #[test]
    fn current_saturates_at_soft_limit() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        exchange
            .submit(KernelCommand::SetMode(ControlMode::Current, 7.))
            .unwrap();

        run_ticks(&mut state, &exchange, 2);
        assert!(state.current_out_a <= 6.);
        assert_ne!(state.warning_status & WARN_SOFT_OVERCURRENT, 0);
    }

    #[test]
    fn coulomb_loss_vanishes_at_rest() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();

        // No drive, no rotation: the wheel must stay exactly at rest rather
        // than being walked backward by the Coulomb term.
        run_ticks(&mut state, &exchange, 100);
        assert_eq!(state.omega, 0.);
        assert_eq!(state.momentum, 0.);
    }

    #[test]
    fn wheel_coasts_down_through_losses() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        state.omega = 3_000. * RAD_S_PER_RPM;

        run_ticks(&mut state, &exchange, 100);
        assert!(state.omega < 3_000. * RAD_S_PER_RPM);
        assert!(state.omega > 0.);
    }

    #[test]
    fn power_limit_caps_output() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        state.omega = 4_000. * RAD_S_PER_RPM; // 418.9 rad/s
        exchange
            .submit(KernelCommand::SetMode(ControlMode::Current, 6.))
            .unwrap();

        run_ticks(&mut state, &exchange, 2);
        // (100 W / ω) / k_t ≈ 4.47 A at 4000 RPM.
        assert!(state.current_out_a < 4.5);
        assert!(state.power_w.abs() <= 100.);
        assert_eq!(state.fault_latch, 0, "power clamp must not trip overpower");
    }

    #[test]
    fn pwm_mode_scales_soft_limit_and_direction() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        exchange
            .submit(KernelCommand::SetMode(ControlMode::Pwm, -50.))
            .unwrap();

        run_ticks(&mut state, &exchange, 2);
        assert_eq!(state.direction, Direction::Negative);
        assert!((state.current_out_a - 3.).abs() < 1e-6);
        assert!(state.omega < 0.);
    }

    #[test]
    fn torque_mode_tracks_setpoint() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        exchange
            .submit(KernelCommand::SetMode(ControlMode::Torque, 53.4))
            .unwrap();

        run_ticks(&mut state, &exchange, 2);
        assert!((state.current_out_a - 1.).abs() < 1e-3);
        assert!((state.torque_out_mnm - 53.4).abs() < 0.1);
    }

    #[test]
    fn trip_lcl_command_zeroes_output() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        exchange
            .submit(KernelCommand::SetMode(ControlMode::Current, 3.))
            .unwrap();
        run_ticks(&mut state, &exchange, 5);
        assert!(state.current_out_a > 0.);

        exchange.submit(KernelCommand::TripLcl).unwrap();
        run_ticks(&mut state, &exchange, 1);
        assert!(state.lcl_tripped);
        assert_eq!(state.current_out_a, 0.);
        assert_eq!(state.fault_latch, 0xFFFF_FFFF);
    }

    #[test]
    fn entering_speed_mode_resets_pi() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        exchange
            .submit(KernelCommand::SetMode(ControlMode::Speed, 2_000.))
            .unwrap();
        run_ticks(&mut state, &exchange, 100);
        assert!(state.pi.integral != 0.);

        exchange
            .submit_with_retry(
                KernelCommand::SetMode(ControlMode::Speed, 1_000.),
                MAILBOX_RETRY_ATTEMPTS,
                no_pause,
            )
            .unwrap();
        run_tick(&mut state, &exchange);
        // The scratch was cleared when the command landed, then exactly one
        // update ran: the wheel is above the new setpoint, so the single
        // accumulated error term is negative and small.
        assert!(state.pi.integral < 0.);
        assert!(state.pi.integral.abs() < 3.);
    }

    #[test]
    fn soft_overspeed_warns_without_latch() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        exchange
            .submit(KernelCommand::SetMode(ControlMode::Speed, 5_500.))
            .unwrap();
        run_ticks(&mut state, &exchange, 300);

        assert_ne!(state.warning_status & WARN_SOFT_OVERSPEED, 0);
        assert_eq!(state.fault_latch, 0);
        assert!(!state.lcl_tripped);
        assert!((state.speed_rpm() - 5_500.).abs() < 50.);
    }

    #[test]
    fn uptime_and_revolutions_advance() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        state.omega = 600. * RAD_S_PER_RPM; // 10 rev/s

        run_ticks(&mut state, &exchange, 100);
        assert_eq!(state.tick_count, 100);
        assert_eq!(state.uptime_s(), 1);
        // 10 rev/s at entry, less what friction takes back over the second.
        assert!(state.revolutions >= 8 && state.revolutions <= 10);
    }

    #[test]
    fn snapshot_published_every_tick() {
        let mut state = WheelState::boot();
        let exchange = Exchange::new();
        assert!(exchange.snapshot().is_none());

        run_tick(&mut state, &exchange);
        let snap = exchange.snapshot().unwrap();
        assert_eq!(snap.tick_count, 1);
        assert_eq!(exchange.ticks(), 1);
    }
}
