//! Device kernel for the NRWA-T6 reaction-wheel emulator.
//!
//! The emulator stands in for a real reaction wheel on a half-duplex serial
//! bus: it acknowledges the same commands, returns the same telemetry with
//! the same fixed-point encodings, trips the same protections, and shows
//! plausible rotational dynamics. Flight software under test cannot tell the
//! difference at the connector.
//!
//! Everything in this library is hardware-independent. The physics kernel
//! (`physics`) runs from a 100 Hz timer interrupt on target, or from a plain
//! loop in tests; the wire protocol engine (`protocol`) consumes bus bytes
//! one at a time from whatever receiver feeds it. The only paths between the
//! two are the slots in `exchange`. The firmware binary (`main.rs`, behind
//! the `h7`/`g4` features) wires these to an STM32 USART and timer.

#![cfg_attr(not(test), no_std)]

pub mod exchange;
pub mod fixed;
pub mod physics;
pub mod pid;
pub mod protection;
pub mod protocol;
pub mod registers;
pub mod state;
pub mod telemetry;

/// Physics tick rate. The tick period is the integration step.
pub const TICK_RATE: f32 = 100.;
pub const DT: f32 = 1. / TICK_RATE;

/// Identity returned by PING and readable from the info registers.
pub const DEVICE_TYPE: u8 = 0x06;
pub const SERIAL_NUMBER: u8 = 0x01;
pub const FW_VERSION: (u8, u8, u8) = (1, 0, 0);
