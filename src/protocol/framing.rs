//! SLIP-style byte-stuffed framing.
//!
//! A frame is the bytes between two SENTINELs. Payload bytes that collide
//! with the two literals are escaped: SENTINEL becomes ESCAPE,ESC_SENTINEL
//! and ESCAPE becomes ESCAPE,ESC_ESCAPE. The decoder is a streaming state
//! machine fed one byte at a time, so a partial frame simply waits for the
//! next SENTINEL; there is no timeout at this layer.

use heapless::Vec;

pub const SENTINEL: u8 = 0xC0;
pub const ESCAPE: u8 = 0xDB;
pub const ESC_SENTINEL: u8 = 0xDC;
pub const ESC_ESCAPE: u8 = 0xDD;

/// Largest unescaped frame the deframer accumulates. The longest legal
/// packet is a 6-byte header+CRC plus a 25-byte telemetry block; the rest is
/// headroom for future block shapes.
pub const MAX_FRAME: usize = 64;

pub type Frame = Vec<u8, MAX_FRAME>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FramingError {
    /// A byte other than ESC_SENTINEL/ESC_ESCAPE followed ESCAPE.
    BadEscape,
    /// The frame outgrew the accumulator.
    Overrun,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    InFrame,
    AfterEscape,
}

pub struct Deframer {
    state: State,
    buf: Frame,
}

impl Deframer {
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            buf: Vec::new(),
        }
    }

    /// Feed one received byte. Returns a complete frame when the closing
    /// SENTINEL arrives; a framing error drops the in-progress frame and
    /// returns the machine to idle.
    pub fn push_byte(&mut self, byte: u8) -> Result<Option<Frame>, FramingError> {
        match self.state {
            State::Idle => {
                if byte == SENTINEL {
                    self.buf.clear();
                    self.state = State::InFrame;
                }
                // Inter-frame noise is ignored, not an error.
                Ok(None)
            }
            State::InFrame => match byte {
                SENTINEL => {
                    self.state = State::Idle;
                    Ok(Some(core::mem::take(&mut self.buf)))
                }
                ESCAPE => {
                    self.state = State::AfterEscape;
                    Ok(None)
                }
                _ => self.accumulate(byte),
            },
            State::AfterEscape => {
                let literal = match byte {
                    ESC_SENTINEL => SENTINEL,
                    ESC_ESCAPE => ESCAPE,
                    _ => {
                        self.reset();
                        return Err(FramingError::BadEscape);
                    }
                };
                self.state = State::InFrame;
                self.accumulate(literal)
            }
        }
    }

    fn accumulate(&mut self, byte: u8) -> Result<Option<Frame>, FramingError> {
        if self.buf.push(byte).is_err() {
            self.reset();
            return Err(FramingError::Overrun);
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.state = State::Idle;
        self.buf.clear();
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame `payload` into `out`. Total output is bounded by 2N + 2 bytes.
pub fn encode<const N: usize>(payload: &[u8], out: &mut Vec<u8, N>) -> Result<(), ()> {
    out.push(SENTINEL).map_err(|_| ())?;
    for &byte in payload {
        match byte {
            SENTINEL => {
                out.push(ESCAPE).map_err(|_| ())?;
                out.push(ESC_SENTINEL).map_err(|_| ())?;
            }
            ESCAPE => {
                out.push(ESCAPE).map_err(|_| ())?;
                out.push(ESC_ESCAPE).map_err(|_| ())?;
            }
            _ => out.push(byte).map_err(|_| ())?,
        }
    }
    out.push(SENTINEL).map_err(|_| ())
}
