//! Time sources: a free-running microsecond counter read straight off the
//! RP2040 TIMER peripheral, and a tick counter advanced by the SysTick
//! exception the application wires up (grounded in the teacher's
//! `port::use_systick_tickful!`/`SysTickOptions::FREQUENCY = 1_000_000`,
//! which also assumes a 1 MHz reference -- here supplied by TIMER itself
//! rather than SysTick's own reload count, since TIMER survives sleep modes
//! SysTick doesn't).
use core::sync::atomic::{AtomicU32, Ordering};

static TICKS: AtomicU32 = AtomicU32::new(0);

#[inline]
fn timer() -> &'static rp2040_pac::timer::RegisterBlock {
    unsafe { &*rp2040_pac::TIMER::ptr() }
}

/// Monotonic microsecond counter (§4.1). TIMER free-runs at 1 MHz once
/// `crate::boot::init_clocks` has routed the watchdog tick generator to
/// `clk_ref / 48`, per the teacher's `clock::init_clock`.
pub fn now_us() -> u64 {
    let timer = timer();
    loop {
        let hi = timer.timerawh.read().bits();
        let lo = timer.timerawl.read().bits();
        let hi2 = timer.timerawh.read().bits();
        if hi == hi2 {
            return ((hi as u64) << 32) | lo as u64;
        }
    }
}

pub fn tick_count() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Called from the application's SysTick exception handler, once per tick.
pub fn on_systick_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}
