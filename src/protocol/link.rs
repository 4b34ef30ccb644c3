//! Packet validation, command dispatch and reply marshalling.
//!
//! The engine consumes bus bytes one at a time and hands back fully framed
//! replies for the transmitter. Read-only commands answer straight from the
//! latest telemetry snapshot; anything that would change wheel state turns
//! into a mailbox command for the physics worker. Every failure mode lands
//! in a counter, a NACK, or silence, never in a panic or a wait on the
//! kernel.

use heapless::Vec;
use num_enum::TryFromPrimitive;

use crate::exchange::{Exchange, KernelCommand, MAILBOX_RETRY_ATTEMPTS};
use crate::fixed::{from_signed_fixed, from_unsigned_fixed};
use crate::protection::PROTECTION_ALL;
use crate::protocol::{crc, framing};
use crate::registers::{self, RegisterContext};
use crate::state::ControlMode;
use crate::telemetry;

pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// Four header bytes plus the trailing CRC: the smallest legal packet.
pub const MIN_PACKET: usize = 6;

/// A NACK echoes the command code with this bit set and carries no payload.
pub const NACK_FLAG: u8 = 0x80;

pub const MAX_REPLY_PAYLOAD: usize = 32;
pub type ReplyPayload = Vec<u8, MAX_REPLY_PAYLOAD>;

/// Worst-case framed reply: every packet byte escaped, plus two sentinels.
pub const MAX_REPLY_FRAME: usize = 2 * (MIN_PACKET + MAX_REPLY_PAYLOAD) + 2;
pub type ReplyFrame = Vec<u8, MAX_REPLY_FRAME>;

#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CommandCode {
    Ping = 0x00,
    Peek = 0x02,
    Poke = 0x03,
    ApplicationTelemetry = 0x07,
    ApplicationCommand = 0x08,
    ClearFault = 0x09,
    ConfigureProtection = 0x0A,
    TripLcl = 0x0B,
}

/// Wire-visible error counters, all readable through PEEK.
#[derive(Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkCounters {
    pub framing_errors: u32,
    pub length_errors: u32,
    pub crc_errors: u32,
    pub address_drops: u32,
    pub packets_accepted: u32,
    pub nacks_sent: u32,
}

/// What a handler decided. NACKs and silence are explicit outcomes, not
/// error paths.
enum Disposition {
    Ack(ReplyPayload),
    Nack,
    NoReply,
}

fn no_pause() {}

pub struct LinkEngine<'a> {
    address: u8,
    exchange: &'a Exchange,
    deframer: framing::Deframer,
    pub counters: LinkCounters,
    /// Runs between mailbox retry attempts, outside any critical section.
    /// The firmware points this at a short busy-wait; tests leave it inert.
    pub pause: fn(),
}

impl<'a> LinkEngine<'a> {
    pub fn new(address: u8, exchange: &'a Exchange) -> Self {
        Self {
            address,
            exchange,
            deframer: framing::Deframer::new(),
            counters: LinkCounters::default(),
            pause: no_pause,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Feed one received byte; returns a framed reply when one is due.
    pub fn process_byte(&mut self, byte: u8) -> Option<ReplyFrame> {
        match self.deframer.push_byte(byte) {
            Ok(Some(frame)) => self.handle_frame(&frame),
            Ok(None) => None,
            Err(_) => {
                self.counters.framing_errors += 1;
                None
            }
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) -> Option<ReplyFrame> {
        if frame.len() < MIN_PACKET {
            self.counters.framing_errors += 1;
            return None;
        }

        let address = frame[0];
        if address != self.address && address != BROADCAST_ADDRESS {
            self.counters.address_drops += 1;
            return None;
        }

        let payload_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        if MIN_PACKET + payload_len != frame.len() {
            self.counters.length_errors += 1;
            return None;
        }

        if !crc::verify(frame) {
            self.counters.crc_errors += 1;
            return None;
        }

        self.counters.packets_accepted += 1;

        let command = frame[1];
        let payload = &frame[4..frame.len() - 2];
        let disposition = self.dispatch(command, payload);

        // Broadcast commands execute but are never answered.
        if address == BROADCAST_ADDRESS {
            return None;
        }

        match disposition {
            Disposition::Ack(reply) => self.build_reply(command, &reply),
            Disposition::Nack => {
                self.counters.nacks_sent += 1;
                self.build_reply(command | NACK_FLAG, &[])
            }
            Disposition::NoReply => None,
        }
    }

    fn dispatch(&mut self, command: u8, payload: &[u8]) -> Disposition {
        let Ok(code) = CommandCode::try_from(command) else {
            return Disposition::Nack;
        };

        match code {
            CommandCode::Ping => self.handle_ping(payload),
            CommandCode::Peek => self.handle_peek(payload),
            CommandCode::Poke => self.handle_poke(payload),
            CommandCode::ApplicationTelemetry => self.handle_telemetry(payload),
            CommandCode::ApplicationCommand => self.handle_application_command(payload),
            CommandCode::ClearFault => self.handle_clear_fault(payload),
            CommandCode::ConfigureProtection => self.handle_configure_protection(payload),
            CommandCode::TripLcl => self.handle_trip_lcl(payload),
        }
    }

    fn handle_ping(&mut self, payload: &[u8]) -> Disposition {
        if !payload.is_empty() {
            return Disposition::Nack;
        }
        let (fw_major, fw_minor, fw_patch) = crate::FW_VERSION;
        let identity = [
            crate::DEVICE_TYPE,
            crate::SERIAL_NUMBER,
            fw_major,
            fw_minor,
            fw_patch,
        ];
        match ReplyPayload::from_slice(&identity) {
            Ok(reply) => Disposition::Ack(reply),
            Err(_) => Disposition::Nack,
        }
    }

    fn handle_peek(&mut self, payload: &[u8]) -> Disposition {
        let [addr] = *payload else {
            return Disposition::Nack;
        };
        let snapshot = self.exchange.snapshot().unwrap_or_default();
        let ctx = RegisterContext {
            snapshot: &snapshot,
            counters: &self.counters,
            address: self.address,
        };
        match registers::read(addr, &ctx) {
            Some(value) => match ReplyPayload::from_slice(&value.to_le_bytes()) {
                Ok(reply) => Disposition::Ack(reply),
                Err(_) => Disposition::Nack,
            },
            None => Disposition::Nack,
        }
    }

    fn handle_poke(&mut self, payload: &[u8]) -> Disposition {
        let [addr, v0, v1, v2, v3] = *payload else {
            return Disposition::Nack;
        };
        let value = u32::from_le_bytes([v0, v1, v2, v3]);
        match registers::write(addr, value) {
            Ok(command) => self.submit(command),
            Err(_) => Disposition::Nack,
        }
    }

    fn handle_telemetry(&mut self, payload: &[u8]) -> Disposition {
        let [block_id] = *payload else {
            return Disposition::Nack;
        };
        let snapshot = self.exchange.snapshot().unwrap_or_default();
        match telemetry::build_block(block_id, &snapshot) {
            Some(block) => match ReplyPayload::from_slice(&block) {
                Ok(reply) => Disposition::Ack(reply),
                Err(_) => Disposition::Nack,
            },
            None => Disposition::Nack,
        }
    }

    fn handle_application_command(&mut self, payload: &[u8]) -> Disposition {
        let [mode_byte, v0, v1, v2, v3] = *payload else {
            return Disposition::Nack;
        };
        // Mode 0x00 is IDLE: a valid command that changes nothing.
        if mode_byte == 0x00 {
            return Disposition::Ack(ReplyPayload::new());
        }
        let Ok(mode) = ControlMode::try_from(mode_byte) else {
            return Disposition::Nack;
        };

        let raw = u32::from_le_bytes([v0, v1, v2, v3]);
        let setpoint = match mode {
            ControlMode::Current => from_unsigned_fixed(raw, 18) / 1_000., // mA on the wire
            ControlMode::Speed => from_unsigned_fixed(raw, 18),
            ControlMode::Torque => from_signed_fixed(raw as i32, 22),
            ControlMode::Pwm => registers::decode_pwm_setpoint(raw),
        };
        self.submit(KernelCommand::SetMode(mode, setpoint))
    }

    fn handle_clear_fault(&mut self, payload: &[u8]) -> Disposition {
        let [m0, m1, m2, m3] = *payload else {
            return Disposition::Nack;
        };
        self.submit(KernelCommand::ClearFault(u32::from_le_bytes([m0, m1, m2, m3])))
    }

    fn handle_configure_protection(&mut self, payload: &[u8]) -> Disposition {
        let [m0, m1, m2, m3] = *payload else {
            return Disposition::Nack;
        };
        // The wire carries a disable mask; the kernel stores enables.
        let disable = u32::from_le_bytes([m0, m1, m2, m3]);
        self.submit(KernelCommand::ConfigureProtection(!disable & PROTECTION_ALL))
    }

    fn handle_trip_lcl(&mut self, payload: &[u8]) -> Disposition {
        if !payload.is_empty() {
            return Disposition::Nack;
        }
        // Acknowledged by silence either way; the retry is the only recourse.
        let _ = self.exchange.submit_with_retry(
            KernelCommand::TripLcl,
            MAILBOX_RETRY_ATTEMPTS,
            self.pause,
        );
        Disposition::NoReply
    }

    /// Hand a command to the physics worker; a mailbox that stays busy
    /// through the bounded retry is a NACK, not a wait.
    fn submit(&mut self, command: KernelCommand) -> Disposition {
        match self
            .exchange
            .submit_with_retry(command, MAILBOX_RETRY_ATTEMPTS, self.pause)
        {
            Ok(()) => Disposition::Ack(ReplyPayload::new()),
            Err(_) => Disposition::Nack,
        }
    }

    fn build_reply(&mut self, command: u8, payload: &[u8]) -> Option<ReplyFrame> {
        let mut packet: Vec<u8, { MIN_PACKET + MAX_REPLY_PAYLOAD }> = Vec::new();
        packet.push(self.address).ok()?;
        packet.push(command).ok()?;
        packet
            .extend_from_slice(&(payload.len() as u16).to_le_bytes())
            .ok()?;
        packet.extend_from_slice(payload).ok()?;
        let checksum = crc::crc16(&packet);
        packet.extend_from_slice(&checksum.to_le_bytes()).ok()?;

        let mut framed = ReplyFrame::new();
        framing::encode(&packet, &mut framed).ok()?;
        Some(framed)
    }
}
