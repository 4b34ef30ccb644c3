//! The 8-bit ICD register space behind PEEK and POKE (0x00–0x30).
//!
//! The map is a compile-time table: an address enum plus one `match` per
//! direction. Reads are served from the latest telemetry snapshot and the
//! link counters, never from live wheel state. Writes never touch state
//! either; each one translates to a [`KernelCommand`] for the mailbox, so
//! every mutation goes through the physics worker.

use num_enum::TryFromPrimitive;
use num_traits::float::FloatCore;

use crate::exchange::{KernelCommand, ThresholdId};
use crate::fixed::{from_signed_fixed, from_unsigned_fixed, to_signed_fixed, to_unsigned_fixed};
use crate::protocol::link::LinkCounters;
use crate::state::Direction;
use crate::telemetry::TelemetrySnapshot;

#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum Register {
    // Identity and lifetime.
    DeviceType = 0x00,
    SerialNumber = 0x01,
    FwVersion = 0x02,
    BusAddress = 0x03,
    TickCount = 0x04,
    Uptime = 0x05,
    /// Write-only; any value triggers a soft reset.
    SoftReset = 0x06,

    // Control.
    Mode = 0x10,
    Direction = 0x11,
    CurrentSetpoint = 0x12,
    SpeedSetpoint = 0x13,
    TorqueSetpoint = 0x14,
    PwmDuty = 0x15,

    // Measurements.
    CurrentMeasured = 0x16,
    SpeedMeasured = 0x17,
    Momentum = 0x18,
    TorqueMeasured = 0x19,
    Power = 0x1A,
    BusVoltage = 0x1B,

    // Protection.
    FaultStatus = 0x20,
    FaultLatch = 0x21,
    WarningStatus = 0x22,
    ProtectionMask = 0x23,
    OvervoltageLimit = 0x24,
    OverspeedFaultLimit = 0x25,
    OverspeedSoftLimit = 0x26,
    OverpowerLimit = 0x27,
    SoftOvercurrentLimit = 0x28,
    MaxDutyLimit = 0x29,
    BrakingLoadLimit = 0x2A,
    LclState = 0x2B,

    // Link diagnostics.
    FramingErrors = 0x2C,
    LengthErrors = 0x2D,
    CrcErrors = 0x2E,
    AddressDrops = 0x2F,

    Revolutions = 0x30,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteError {
    Unknown,
    ReadOnly,
    OutOfRange,
}

/// What a register read draws from: all of it lives on the I/O side.
pub struct RegisterContext<'a> {
    pub snapshot: &'a TelemetrySnapshot,
    pub counters: &'a LinkCounters,
    pub address: u8,
}

/// PEEK. `None` for unmapped addresses and the write-only reset register.
pub fn read(addr: u8, ctx: &RegisterContext) -> Option<u32> {
    let snap = ctx.snapshot;
    let value = match Register::try_from(addr).ok()? {
        Register::DeviceType => crate::DEVICE_TYPE as u32,
        Register::SerialNumber => crate::SERIAL_NUMBER as u32,
        Register::FwVersion => {
            let (major, minor, patch) = crate::FW_VERSION;
            ((major as u32) << 16) | ((minor as u32) << 8) | patch as u32
        }
        Register::BusAddress => ctx.address as u32,
        Register::TickCount => snap.tick_count,
        Register::Uptime => snap.uptime_s() as u32,
        Register::SoftReset => return None,

        Register::Mode => snap.mode as u32,
        Register::Direction => match snap.direction {
            Direction::Positive => 0,
            Direction::Negative => 1,
        },
        Register::CurrentSetpoint => to_unsigned_fixed(snap.current_setpoint_a * 1_000., 14, 18),
        Register::SpeedSetpoint => to_unsigned_fixed(snap.speed_setpoint_rpm, 14, 18),
        Register::TorqueSetpoint => to_signed_fixed(snap.torque_setpoint_mnm, 10, 22) as u32,
        Register::PwmDuty => {
            let magnitude = to_unsigned_fixed(snap.duty_pct * 511. / 100., 9, 0) & 0x1FF;
            match snap.direction {
                Direction::Positive => magnitude,
                Direction::Negative => magnitude | 0x8000_0000,
            }
        }

        Register::CurrentMeasured => to_unsigned_fixed(snap.current_out_a.abs() * 1_000., 20, 12),
        Register::SpeedMeasured => to_unsigned_fixed(snap.speed_rpm.abs(), 24, 8),
        Register::Momentum => to_signed_fixed(snap.momentum_nms * 1_000., 10, 22) as u32,
        Register::TorqueMeasured => to_signed_fixed(snap.torque_out_mnm, 10, 22) as u32,
        Register::Power => to_signed_fixed(snap.power_w, 16, 16) as u32,
        Register::BusVoltage => to_unsigned_fixed(snap.bus_voltage_v, 16, 16),

        Register::FaultStatus => snap.fault_status,
        Register::FaultLatch => snap.fault_latch,
        Register::WarningStatus => snap.warning_status,
        Register::ProtectionMask => snap.protection_mask,
        Register::OvervoltageLimit => to_unsigned_fixed(snap.thresholds.overvoltage_v, 16, 16),
        Register::OverspeedFaultLimit => {
            to_unsigned_fixed(snap.thresholds.overspeed_fault_rpm, 14, 18)
        }
        Register::OverspeedSoftLimit => {
            to_unsigned_fixed(snap.thresholds.overspeed_soft_rpm, 14, 18)
        }
        Register::OverpowerLimit => to_unsigned_fixed(snap.thresholds.overpower_w, 16, 16),
        Register::SoftOvercurrentLimit => {
            to_unsigned_fixed(snap.thresholds.soft_overcurrent_a * 1_000., 14, 18)
        }
        Register::MaxDutyLimit => to_unsigned_fixed(snap.thresholds.max_duty_pct, 16, 16),
        Register::BrakingLoadLimit => to_unsigned_fixed(snap.thresholds.braking_load_v, 16, 16),
        Register::LclState => snap.lcl_tripped as u32,

        Register::FramingErrors => ctx.counters.framing_errors,
        Register::LengthErrors => ctx.counters.length_errors,
        Register::CrcErrors => ctx.counters.crc_errors,
        Register::AddressDrops => ctx.counters.address_drops,

        Register::Revolutions => snap.revolutions,
    };
    Some(value)
}

/// POKE. Returns the kernel command that realizes the write.
pub fn write(addr: u8, raw: u32) -> Result<KernelCommand, WriteError> {
    let register = Register::try_from(addr).map_err(|_| WriteError::Unknown)?;
    let command = match register {
        Register::SoftReset => KernelCommand::SoftReset,

        Register::Direction => match raw {
            0 => KernelCommand::SetDirection(Direction::Positive),
            1 => KernelCommand::SetDirection(Direction::Negative),
            _ => return Err(WriteError::OutOfRange),
        },
        Register::CurrentSetpoint => {
            KernelCommand::SetCurrentSetpoint(from_unsigned_fixed(raw, 18) / 1_000.)
        }
        Register::SpeedSetpoint => KernelCommand::SetSpeedSetpoint(from_unsigned_fixed(raw, 18)),
        Register::TorqueSetpoint => {
            KernelCommand::SetTorqueSetpoint(from_signed_fixed(raw as i32, 22))
        }
        Register::PwmDuty => KernelCommand::SetDutySetpoint(decode_pwm_setpoint(raw)),

        Register::ProtectionMask => {
            KernelCommand::ConfigureProtection(raw & crate::protection::PROTECTION_ALL)
        }
        Register::OvervoltageLimit => {
            KernelCommand::SetThreshold(ThresholdId::Overvoltage, from_unsigned_fixed(raw, 16))
        }
        Register::OverspeedFaultLimit => {
            KernelCommand::SetThreshold(ThresholdId::OverspeedFault, from_unsigned_fixed(raw, 18))
        }
        Register::OverspeedSoftLimit => {
            KernelCommand::SetThreshold(ThresholdId::OverspeedSoft, from_unsigned_fixed(raw, 18))
        }
        Register::OverpowerLimit => {
            KernelCommand::SetThreshold(ThresholdId::Overpower, from_unsigned_fixed(raw, 16))
        }
        Register::SoftOvercurrentLimit => KernelCommand::SetThreshold(
            ThresholdId::SoftOvercurrent,
            from_unsigned_fixed(raw, 18) / 1_000.,
        ),
        Register::MaxDutyLimit => {
            KernelCommand::SetThreshold(ThresholdId::MaxDuty, from_unsigned_fixed(raw, 16))
        }
        Register::BrakingLoadLimit => {
            KernelCommand::SetThreshold(ThresholdId::BrakingLoad, from_unsigned_fixed(raw, 16))
        }

        _ => return Err(WriteError::ReadOnly),
    };
    Ok(command)
}

/// Decode the 9-bit-magnitude-plus-sign PWM setpoint into a signed duty
/// percentage.
pub fn decode_pwm_setpoint(raw: u32) -> f32 {
    let magnitude = (raw & 0x1FF) as f32 * 100. / 511.;
    if raw & 0x8000_0000 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        snapshot: &'a TelemetrySnapshot,
        counters: &'a LinkCounters,
    ) -> RegisterContext<'a> {
        RegisterContext {
            snapshot,
            counters,
            address: 0x01,
        }
    }

    #[test]
    fn identity_reads() {
        let snap = TelemetrySnapshot::default();
        let counters = LinkCounters::default();
        let ctx = ctx(&snap, &counters);

        assert_eq!(read(0x00, &ctx), Some(0x06));
        assert_eq!(read(0x01, &ctx), Some(0x01));
        assert_eq!(read(0x02, &ctx), Some(0x0001_0000));
        assert_eq!(read(0x03, &ctx), Some(0x01));
    }

    #[test]
    fn unmapped_and_write_only_reads_fail() {
        let snap = TelemetrySnapshot::default();
        let counters = LinkCounters::default();
        let ctx = ctx(&snap, &counters);

        assert_eq!(read(0x07, &ctx), None);
        assert_eq!(read(0x0F, &ctx), None);
        assert_eq!(read(0x31, &ctx), None);
        assert_eq!(read(0x06, &ctx), None); // SOFT_RESET is write-only
    }

    #[test]
    fn counter_reads() {
        let snap = TelemetrySnapshot::default();
        let mut counters = LinkCounters::default();
        counters.crc_errors = 3;
        counters.framing_errors = 1;
        let ctx = ctx(&snap, &counters);

        assert_eq!(read(0x2E, &ctx), Some(3));
        assert_eq!(read(0x2C, &ctx), Some(1));
        assert_eq!(read(0x2D, &ctx), Some(0));
    }

    #[test]
    fn setpoint_write_decodes_units() {
        // 3000 RPM in UQ14.18.
        match write(0x13, 0x2EE0_0000) {
            Ok(KernelCommand::SetSpeedSetpoint(rpm)) => assert_eq!(rpm, 3_000.),
            other => panic!("{other:?}"),
        }
        // 1500 mA in UQ14.18 lands as 1.5 A.
        match write(0x12, 1_500 << 18) {
            Ok(KernelCommand::SetCurrentSetpoint(a)) => assert!((a - 1.5).abs() < 1e-6),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn pwm_write_decodes_sign_and_magnitude() {
        match write(0x15, 0x8000_0000 | 511) {
            Ok(KernelCommand::SetDutySetpoint(duty)) => assert_eq!(duty, -100.),
            other => panic!("{other:?}"),
        }
        match write(0x15, 255) {
            Ok(KernelCommand::SetDutySetpoint(duty)) => {
                assert!((duty - 255. * 100. / 511.).abs() < 1e-4)
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn threshold_write_round_trips() {
        let raw = to_unsigned_fixed(33., 16, 16);
        match write(0x24, raw) {
            Ok(KernelCommand::SetThreshold(ThresholdId::Overvoltage, v)) => {
                assert!((v - 33.).abs() < 1e-4)
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn read_only_writes_rejected() {
        assert_eq!(write(0x00, 1), Err(WriteError::ReadOnly));
        assert_eq!(write(0x16, 1), Err(WriteError::ReadOnly));
        assert_eq!(write(0x20, 1), Err(WriteError::ReadOnly));
        assert_eq!(write(0x2E, 0), Err(WriteError::ReadOnly));
        assert_eq!(write(0x40, 1), Err(WriteError::Unknown));
        assert_eq!(write(0x11, 2), Err(WriteError::OutOfRange));
    }

    #[test]
    fn mode_register_mirrors_one_hot() {
        let mut snap = TelemetrySnapshot::default();
        snap.mode = crate::state::ControlMode::Torque;
        let counters = LinkCounters::default();
        let ctx = ctx(&snap, &counters);
        assert_eq!(read(0x10, &ctx), Some(0x04));
        // Mode itself is commanded through APPLICATION-COMMAND, not POKE.
        assert_eq!(write(0x10, 0x02), Err(WriteError::ReadOnly));
    }
}
