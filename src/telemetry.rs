//! Telemetry snapshot and the five wire block shapes.
//!
//! The snapshot is the value-typed copy of wheel state the physics worker
//! publishes at the end of every tick; block builders serialize it field by
//! field, little-endian, to the exact ICD layouts. Nothing here reads wheel
//! state directly.

use heapless::Vec;
use num_enum::TryFromPrimitive;
use num_traits::float::FloatCore;

use crate::fixed::{to_signed_fixed, to_unsigned_fixed};
use crate::protection::{Thresholds, HARD_FAULT_MASK};
use crate::state::{ControlMode, Direction, Housekeeping, WheelState, RPM_PER_RAD_S};

/// Status-word bits (STANDARD block, first field).
pub const STATUS_OPERATIONAL: u32 = 1 << 0;
pub const STATUS_LCL_TRIPPED: u32 = 1 << 31;

#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BlockId {
    Standard = 0x00,
    Temperatures = 0x01,
    Voltages = 0x02,
    Currents = 0x03,
    Diagnostics = 0x04,
}

/// Largest block is STANDARD at 25 bytes.
pub const MAX_BLOCK: usize = 25;
pub type Block = Vec<u8, MAX_BLOCK>;

/// Everything a telemetry or register reader may need, frozen at one tick.
#[derive(Clone, Copy)]
pub struct TelemetrySnapshot {
    pub tick_count: u32,
    pub mode: ControlMode,
    pub direction: Direction,

    pub current_setpoint_a: f32,
    pub speed_setpoint_rpm: f32,
    pub torque_setpoint_mnm: f32,
    pub duty_pct: f32,

    pub current_out_a: f32,
    pub torque_out_mnm: f32,
    pub power_w: f32,
    pub bus_voltage_v: f32,
    /// Signed; negative for reverse rotation.
    pub speed_rpm: f32,
    pub momentum_nms: f32,

    pub fault_status: u32,
    pub fault_latch: u32,
    pub warning_status: u32,
    pub protection_mask: u32,
    pub lcl_tripped: bool,
    pub thresholds: Thresholds,

    pub revolutions: u32,
    pub hall_invalid: u32,
    pub drive_fault: u32,
    pub drive_overtemp: u32,

    pub housekeeping: Housekeeping,

    pub jitter_last_us: u32,
    pub jitter_max_us: u32,
}

impl TelemetrySnapshot {
    pub fn capture(state: &WheelState) -> Self {
        Self {
            tick_count: state.tick_count,
            mode: state.mode,
            direction: state.direction,
            current_setpoint_a: state.current_cmd_a,
            speed_setpoint_rpm: state.speed_cmd_rpm,
            torque_setpoint_mnm: state.torque_cmd_mnm,
            duty_pct: state.duty_cmd_pct,
            current_out_a: state.current_out_a,
            torque_out_mnm: state.torque_out_mnm,
            power_w: state.power_w,
            bus_voltage_v: state.bus_voltage_v,
            speed_rpm: state.omega * RPM_PER_RAD_S,
            momentum_nms: state.momentum,
            fault_status: state.fault_status,
            fault_latch: state.fault_latch,
            warning_status: state.warning_status,
            protection_mask: state.protection_mask,
            lcl_tripped: state.lcl_tripped,
            thresholds: state.thresholds,
            revolutions: state.revolutions,
            hall_invalid: 0,
            drive_fault: 0,
            drive_overtemp: 0,
            housekeeping: state.housekeeping,
            jitter_last_us: state.jitter_last_us,
            jitter_max_us: state.jitter_max_us,
        }
    }

    pub fn uptime_s(&self) -> f32 {
        self.tick_count as f32 / crate::TICK_RATE
    }

    pub fn status_word(&self) -> u32 {
        let mut status = 0;
        if !self.lcl_tripped && self.fault_latch & HARD_FAULT_MASK == 0 {
            status |= STATUS_OPERATIONAL;
        }
        if self.lcl_tripped {
            status |= STATUS_LCL_TRIPPED;
        }
        status
    }

    /// The active setpoint in the wire encoding of the active mode.
    pub fn setpoint_raw(&self) -> u32 {
        match self.mode {
            ControlMode::Current => to_unsigned_fixed(self.current_setpoint_a * 1_000., 14, 18),
            ControlMode::Speed => to_unsigned_fixed(self.speed_setpoint_rpm, 14, 18),
            ControlMode::Torque => to_signed_fixed(self.torque_setpoint_mnm, 10, 22) as u32,
            ControlMode::Pwm => {
                let magnitude = to_unsigned_fixed(self.duty_pct * 511. / 100., 9, 0) & 0x1FF;
                match self.direction {
                    Direction::Positive => magnitude,
                    Direction::Negative => magnitude | 0x8000_0000,
                }
            }
        }
    }
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self::capture(&WheelState::boot())
    }
}

/// Serialize the requested block. `None` for an unknown ID, which the
/// dispatcher answers with NACK.
pub fn build_block(id: u8, snap: &TelemetrySnapshot) -> Option<Block> {
    let mut out = Block::new();
    match BlockId::try_from(id).ok()? {
        BlockId::Standard => {
            let duty_signed = match snap.direction {
                Direction::Positive => snap.duty_pct,
                Direction::Negative => -snap.duty_pct,
            };
            out.extend_from_slice(&snap.status_word().to_le_bytes()).ok()?;
            out.extend_from_slice(&(snap.fault_status | snap.fault_latch).to_le_bytes())
                .ok()?;
            out.push(snap.mode as u8).ok()?;
            out.extend_from_slice(&snap.setpoint_raw().to_le_bytes()).ok()?;
            out.extend_from_slice(&((duty_signed * 5.12).round() as i16).to_le_bytes())
                .ok()?;
            out.extend_from_slice(
                &(to_unsigned_fixed(snap.current_out_a.abs() * 1_000., 14, 2) as u16)
                    .to_le_bytes(),
            )
            .ok()?;
            out.extend_from_slice(
                &to_unsigned_fixed(snap.current_out_a.abs() * 1_000., 20, 12).to_le_bytes(),
            )
            .ok()?;
            out.extend_from_slice(&to_unsigned_fixed(snap.speed_rpm.abs(), 24, 8).to_le_bytes())
                .ok()?;
        }
        BlockId::Temperatures => {
            let hk = &snap.housekeeping;
            for temp in [
                hk.temp_dcdc_c,
                hk.temp_enclosure_c,
                hk.temp_driver_c,
                hk.temp_motor_c,
            ] {
                out.extend_from_slice(&(to_unsigned_fixed(temp, 16, 0) as u16).to_le_bytes())
                    .ok()?;
            }
        }
        BlockId::Voltages => {
            for volts in [1.5, 3.3, 5.0, 12.0, snap.bus_voltage_v, 2.5] {
                out.extend_from_slice(&to_unsigned_fixed(volts, 16, 16).to_le_bytes())
                    .ok()?;
            }
        }
        BlockId::Currents => {
            let hk = &snap.housekeeping;
            for ma in [
                hk.rail_1v5_ma,
                hk.rail_3v3_ma,
                hk.rail_5va_ma,
                hk.rail_5vd_ma,
                hk.rail_12v_ma,
            ] {
                out.extend_from_slice(&to_unsigned_fixed(ma, 16, 16).to_le_bytes())
                    .ok()?;
            }
            out.extend_from_slice(
                &to_signed_fixed(hk.bus_current_a, 16, 16).to_le_bytes(),
            )
            .ok()?;
        }
        BlockId::Diagnostics => {
            out.extend_from_slice(&to_unsigned_fixed(snap.uptime_s(), 30, 2).to_le_bytes())
                .ok()?;
            out.extend_from_slice(&snap.revolutions.to_le_bytes()).ok()?;
            out.extend_from_slice(&snap.hall_invalid.to_le_bytes()).ok()?;
            out.extend_from_slice(&snap.drive_fault.to_le_bytes()).ok()?;
            out.extend_from_slice(&snap.drive_overtemp.to_le_bytes()).ok()?;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(block: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(block[offset..offset + 4].try_into().unwrap())
    }

    fn u16_at(block: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes(block[offset..offset + 2].try_into().unwrap())
    }

    #[test]
    fn block_sizes() {
        let snap = TelemetrySnapshot::default();
        assert_eq!(build_block(0x00, &snap).unwrap().len(), 25);
        assert_eq!(build_block(0x01, &snap).unwrap().len(), 8);
        assert_eq!(build_block(0x02, &snap).unwrap().len(), 24);
        assert_eq!(build_block(0x03, &snap).unwrap().len(), 24);
        assert_eq!(build_block(0x04, &snap).unwrap().len(), 20);
        assert!(build_block(0x05, &snap).is_none());
        assert!(build_block(0xFF, &snap).is_none());
    }

    #[test]
    fn standard_block_layout() {
        let mut snap = TelemetrySnapshot::default();
        snap.mode = ControlMode::Speed;
        snap.speed_setpoint_rpm = 3_000.;
        snap.speed_rpm = 2_987.5;
        snap.current_out_a = 1.25;
        snap.duty_pct = 50.;

        let block = build_block(0x00, &snap).unwrap();
        // Operational, no faults, no LCL.
        assert_eq!(u32_at(&block, 0), STATUS_OPERATIONAL);
        assert_eq!(u32_at(&block, 4), 0);
        assert_eq!(block[8], 0x02);
        // Speed setpoint rides in UQ14.18 RPM.
        assert_eq!(u32_at(&block, 9), 0x2EE0_0000);
        assert_eq!(u16_at(&block, 13) as i16, 256); // 50 % × 5.12
        assert_eq!(u16_at(&block, 15), 1_250 << 2); // Q14.2 mA
        assert_eq!(u32_at(&block, 17), 1_250 << 12); // Q20.12 mA
        assert_eq!(u32_at(&block, 21), (2_987 << 8) + 128); // Q24.8 RPM
    }

    #[test]
    fn standard_block_reports_lcl() {
        let mut snap = TelemetrySnapshot::default();
        snap.lcl_tripped = true;
        snap.fault_latch = 0xFFFF_FFFF;

        let block = build_block(0x00, &snap).unwrap();
        let status = u32_at(&block, 0);
        assert_ne!(status & STATUS_LCL_TRIPPED, 0);
        assert_eq!(status & STATUS_OPERATIONAL, 0);
        assert_eq!(u32_at(&block, 4), 0xFFFF_FFFF);
    }

    #[test]
    fn pwm_setpoint_encoding() {
        let mut snap = TelemetrySnapshot::default();
        snap.mode = ControlMode::Pwm;
        snap.duty_pct = 100.;
        snap.direction = Direction::Negative;

        assert_eq!(snap.setpoint_raw(), 0x8000_0000 | 511);

        snap.direction = Direction::Positive;
        snap.duty_pct = 0.;
        assert_eq!(snap.setpoint_raw(), 0);
    }

    #[test]
    fn voltages_block_uq16_16() {
        let snap = TelemetrySnapshot::default();
        let block = build_block(0x02, &snap).unwrap();
        assert_eq!(u32_at(&block, 0), (3 << 16) / 2); // 1.5 V
        assert_eq!(u32_at(&block, 16), 28 << 16); // nominal bus
        assert_eq!(u32_at(&block, 20), (5 << 16) / 2); // 2.5 V ref
    }

    #[test]
    fn temperatures_block_rounds_to_whole_degrees() {
        let mut snap = TelemetrySnapshot::default();
        snap.housekeeping.temp_dcdc_c = 25.2;
        snap.housekeeping.temp_enclosure_c = 25.7;
        snap.housekeeping.temp_driver_c = 31.49;
        snap.housekeeping.temp_motor_c = 44.5;

        let block = build_block(0x01, &snap).unwrap();
        assert_eq!(u16_at(&block, 0), 25);
        assert_eq!(u16_at(&block, 2), 26);
        assert_eq!(u16_at(&block, 4), 31);
        assert_eq!(u16_at(&block, 6), 45);
    }

    #[test]
    fn currents_block_signs_the_bus_rail() {
        let mut snap = TelemetrySnapshot::default();
        snap.housekeeping.rail_1v5_ma = 120.;
        snap.housekeeping.bus_current_a = -1.25; // regenerating

        let block = build_block(0x03, &snap).unwrap();
        assert_eq!(u32_at(&block, 0), 120 << 16);
        let bus = u32_at(&block, 20) as i32;
        assert_eq!(bus, -(5 << 16) / 4); // Q16.16 of -1.25
    }

    #[test]
    fn standard_block_setpoint_follows_mode() {
        let mut snap = TelemetrySnapshot::default();
        snap.current_setpoint_a = 1.5;
        snap.torque_setpoint_mnm = -10.;

        snap.mode = ControlMode::Current;
        // 1500 mA in UQ14.18.
        assert_eq!(snap.setpoint_raw(), 1_500 << 18);

        snap.mode = ControlMode::Torque;
        assert_eq!(snap.setpoint_raw() as i32, -10 << 22);
    }

    #[test]
    fn diagnostics_uptime_uq30_2() {
        let mut snap = TelemetrySnapshot::default();
        snap.tick_count = 12_345; // 123.45 s
        let block = build_block(0x04, &snap).unwrap();
        // 123.45 × 4 = 493.8, rounds to 494.
        assert_eq!(u32_at(&block, 0), 494);
        snap.revolutions = 77;
        let block = build_block(0x04, &snap).unwrap();
        assert_eq!(u32_at(&block, 4), 77);
    }
}
