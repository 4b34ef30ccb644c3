//! The only shared state between the physics worker and the I/O worker:
//! a one-slot command mailbox in, a one-slot telemetry snapshot out, a
//! monotonic tick counter, and the hardware-reset event flag.
//!
//! Both slots hold small value types and are guarded by interrupt-safe
//! critical sections whose hold time is the copy, nothing else. The physics
//! worker is the sole writer of the snapshot and sole reader of the mailbox;
//! the I/O worker is the opposite. Neither side ever holds a reference into
//! the other's data.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use critical_section::Mutex;

use crate::state::{ControlMode, Direction};
use crate::telemetry::TelemetrySnapshot;

/// Bounded retry for mailbox writers: up to five attempts with a short
/// pause between them, then the handler gives up and NACKs.
pub const MAILBOX_RETRY_ATTEMPTS: u32 = 5;

/// Which threshold a POKE is updating.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThresholdId {
    Overvoltage,
    OverspeedFault,
    OverspeedSoft,
    Overpower,
    SoftOvercurrent,
    MaxDuty,
    BrakingLoad,
}

/// Everything the I/O side may ask the physics kernel to do. Values are in
/// engineering units; the wire layer owns all fixed-point decoding.
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KernelCommand {
    /// Mode change plus its setpoint, applied atomically. For PWM the value
    /// is a signed duty percentage; its sign selects the direction.
    SetMode(ControlMode, f32),
    /// Setpoint-only updates from the register path; the mode is untouched.
    SetCurrentSetpoint(f32),
    SetSpeedSetpoint(f32),
    SetTorqueSetpoint(f32),
    SetDutySetpoint(f32),
    SetDirection(Direction),
    SetThreshold(ThresholdId, f32),
    /// Latch/status clear mask; the LCL latch bit is exempt.
    ClearFault(u32),
    /// New protection enable mask (already inverted from the wire's
    /// disable mask).
    ConfigureProtection(u32),
    TripLcl,
    SoftReset,
}

/// A mailbox entry: the command plus the tick it was accepted on.
#[derive(Clone, Copy, Debug)]
pub struct Envelope {
    pub command: KernelCommand,
    pub accepted_tick: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MailboxBusy;

/// The full cross-worker exchange. The firmware owns one as a `static`;
/// tests build their own so they stay hermetic.
pub struct Exchange {
    mailbox: Mutex<RefCell<Option<Envelope>>>,
    snapshot: Mutex<RefCell<Option<TelemetrySnapshot>>>,
    ticks: AtomicU32,
    reset_pending: AtomicBool,
}

impl Exchange {
    pub const fn new() -> Self {
        Self {
            mailbox: Mutex::new(RefCell::new(None)),
            snapshot: Mutex::new(RefCell::new(None)),
            ticks: AtomicU32::new(0),
            reset_pending: AtomicBool::new(false),
        }
    }

    /// Try once to hand a command to the physics worker. Fails if the
    /// previous command hasn't been drained yet.
    pub fn submit(&self, command: KernelCommand) -> Result<(), MailboxBusy> {
        let accepted_tick = self.ticks();
        critical_section::with(|cs| {
            let mut slot = self.mailbox.borrow_ref_mut(cs);
            if slot.is_some() {
                return Err(MailboxBusy);
            }
            *slot = Some(Envelope {
                command,
                accepted_tick,
            });
            Ok(())
        })
    }

    /// Submit with the bounded retry the wire handlers use. `pause` runs
    /// between attempts, outside the critical section.
    pub fn submit_with_retry(
        &self,
        command: KernelCommand,
        attempts: u32,
        pause: fn(),
    ) -> Result<(), MailboxBusy> {
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                pause();
            }
            if self.submit(command).is_ok() {
                return Ok(());
            }
        }
        Err(MailboxBusy)
    }

    /// Drain the mailbox. Physics-worker side, once per tick.
    pub fn take_command(&self) -> Option<Envelope> {
        critical_section::with(|cs| self.mailbox.borrow_ref_mut(cs).take())
    }

    pub fn mailbox_is_empty(&self) -> bool {
        critical_section::with(|cs| self.mailbox.borrow_ref(cs).is_none())
    }

    /// Publish the tick's snapshot; last writer wins. Also advances the
    /// shared tick counter, which is what mailbox timestamps come from.
    pub fn publish_snapshot(&self, snapshot: TelemetrySnapshot) {
        self.ticks.store(snapshot.tick_count, Ordering::Release);
        critical_section::with(|cs| {
            *self.snapshot.borrow_ref_mut(cs) = Some(snapshot);
        });
    }

    /// Latest published snapshot, or `None` before the first tick.
    pub fn snapshot(&self) -> Option<TelemetrySnapshot> {
        critical_section::with(|cs| *self.snapshot.borrow_ref(cs))
    }

    /// Monotonic tick count, readable from any context.
    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Assert the hardware-reset event. Called from the reset-line ISR and
    /// from the scenario engine's reset hook.
    pub fn request_hardware_reset(&self) {
        self.reset_pending.store(true, Ordering::Release);
    }

    /// Consume a pending reset event. Physics-worker side, at tick start.
    pub fn take_hardware_reset(&self) -> bool {
        self.reset_pending.swap(false, Ordering::AcqRel)
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}
