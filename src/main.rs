//! Firmware entry for the NRWA-T6 reaction-wheel emulator.
//!
//! Two priority levels stand in for the two cores of the device: the physics
//! kernel runs from a 100 Hz timer interrupt at high priority, and the wire
//! protocol engine runs from the USART interrupt below it. The `exchange`
//! slots are the only data paths between them, so the kernel's deadline
//! never depends on bus traffic.

#![no_main]
#![no_std]

use cfg_if::cfg_if;
use cortex_m::asm;
use defmt::println;
use defmt_rtt as _;
use panic_probe as _;

use hal::{
    clocks::Clocks,
    gpio::{self, Edge, Pin, PinMode, Port},
    pac,
    timer::{Timer, TimerInterrupt},
    usart::{Usart, UsartConfig, UsartInterrupt},
};

use nrwa_emu::{
    exchange::Exchange, physics, protocol::link::LinkEngine, state::WheelState, TICK_RATE,
};

/// Bus rate per the ICD: 460 800 baud, 8-N-1.
const BAUD: u32 = 460_800;

/// Active-low hardware reset line.
const RESET_LINE_PIN: u8 = 12;

// The ADDR[2:0] strap lines land on different ports per board layout.
cfg_if! {
    if #[cfg(feature = "h7")] {
        const STRAP_PORT: Port = Port::C;
        const STRAP_PINS: [u8; 3] = [13, 14, 15];
    } else {
        const STRAP_PORT: Port = Port::B;
        const STRAP_PINS: [u8; 3] = [0, 1, 2];
    }
}

/// Rough 1 ms busy-wait between mailbox retry attempts in the bus ISR. The
/// physics task preempts it, so the mailbox drains underneath.
const MAILBOX_PAUSE_CYCLES: u32 = 170_000;

/// The only cross-priority state: mailbox in, snapshot out, tick counter,
/// reset event.
static EXCHANGE: Exchange = Exchange::new();

fn mailbox_pause() {
    asm::delay(MAILBOX_PAUSE_CYCLES);
}

/// Sample the ADDR[2:0] strap lines, once at boot. Grounding a line clears
/// its bit.
fn read_strap_address() -> u8 {
    let mut address = 0;
    for (bit, &pin) in STRAP_PINS.iter().enumerate() {
        if Pin::new(STRAP_PORT, pin, PinMode::Input).is_high() {
            address |= 1 << bit;
        }
    }
    address
}

/// Tick body shared by the per-board interrupt bindings.
fn run_physics_tick(
    timer: &mut Timer<pac::TIM15>,
    state: &mut WheelState,
    tick_us: &mut Option<u32>,
    cycles_per_us: u32,
) {
    timer.clear_interrupt(TimerInterrupt::Update);

    // Feed back the previous tick's measured duration before this one runs;
    // the published running max is at most one tick stale.
    if let Some(us) = tick_us.take() {
        state.record_tick_time(us);
    }

    let start = cortex_m::peripheral::DWT::cycle_count();
    physics::run_tick(state, &EXCHANGE);
    let elapsed = cortex_m::peripheral::DWT::cycle_count().wrapping_sub(start);

    *tick_us = Some(elapsed / cycles_per_us.max(1));
}

#[rtic::app(device = pac, peripherals = false, dispatchers = [EXTI9_5])]
mod app {
    use super::*;

    #[shared]
    struct Shared {}

    #[local]
    struct Local {
        physics_timer: Timer<pac::TIM15>,
        state: WheelState,
        tick_us: Option<u32>,
        cycles_per_us: u32,
        bus: Usart<pac::USART2>,
        engine: LinkEngine<'static>,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local) {
        let mut cp = cx.core;
        let dp = pac::Peripherals::take().unwrap();

        let clock_cfg = Clocks::default();
        clock_cfg.setup().unwrap();

        // Cycle counter for per-tick jitter measurement.
        cp.DCB.enable_trace();
        cp.DWT.enable_cycle_counter();
        let cycles_per_us = clock_cfg.sysclk() / 1_000_000;

        let address = read_strap_address();

        let mut reset_line = Pin::new(Port::B, RESET_LINE_PIN, PinMode::Input);
        reset_line.enable_interrupt(Edge::Falling);

        let mut bus = Usart::new(dp.USART2, BAUD, UsartConfig::default(), &clock_cfg);
        bus.enable_interrupt(UsartInterrupt::ReadNotEmpty);

        let mut physics_timer =
            Timer::new_tim15(dp.TIM15, TICK_RATE, Default::default(), &clock_cfg);
        physics_timer.enable_interrupt(TimerInterrupt::Update);
        physics_timer.enable();

        let mut engine = LinkEngine::new(address, &EXCHANGE);
        engine.pause = mailbox_pause;

        println!(
            "NRWA-T6 emulator up; address {=u8}, {=u32} baud",
            address, BAUD
        );

        (
            Shared {},
            Local {
                physics_timer,
                state: WheelState::boot(),
                tick_us: None,
                cycles_per_us,
                bus,
                engine,
            },
        )
    }

    // The physics core. Nothing in here blocks, logs, or touches the bus.
    // TIM15 lands on a different vector name per family.
    #[cfg(feature = "h7")]
    #[task(binds = TIM15, local = [physics_timer, state, tick_us, cycles_per_us], priority = 7)]
    fn physics_tick(cx: physics_tick::Context) {
        run_physics_tick(
            cx.local.physics_timer,
            cx.local.state,
            cx.local.tick_us,
            *cx.local.cycles_per_us,
        );
    }

    #[cfg(not(feature = "h7"))]
    #[task(binds = TIM1_BRK_TIM15, local = [physics_timer, state, tick_us, cycles_per_us], priority = 7)]
    fn physics_tick(cx: physics_tick::Context) {
        run_physics_tick(
            cx.local.physics_timer,
            cx.local.state,
            cx.local.tick_us,
            *cx.local.cycles_per_us,
        );
    }

    /// The I/O core: drain the receiver into the protocol engine, transmit
    /// whatever reply falls out.
    #[task(binds = USART2, local = [bus, engine], priority = 3)]
    fn bus_io(cx: bus_io::Context) {
        let bus = cx.local.bus;
        bus.clear_interrupt(UsartInterrupt::ReadNotEmpty);

        let byte = bus.read_one();
        if let Some(reply) = cx.local.engine.process_byte(byte) {
            let _ = bus.write(&reply);
        }
    }

    /// Hardware reset line. The event is latched for the physics worker;
    /// state changes happen only there.
    #[task(binds = EXTI15_10, priority = 8)]
    fn reset_line_isr(_cx: reset_line_isr::Context) {
        gpio::clear_exti_interrupt(RESET_LINE_PIN);
        EXCHANGE.request_hardware_reset();
        println!("reset line asserted");
    }

    #[idle]
    fn idle(_cx: idle::Context) -> ! {
        loop {
            asm::nop();
        }
    }
}
