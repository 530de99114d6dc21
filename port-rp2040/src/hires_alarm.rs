//! The high-resolution alarm backing `rtk_kernel::hirestimer`'s wheel.
//! RP2040's TIMER block has four independent 32-bit alarms; this port only
//! ever uses ALARM0. Arming writes the low 32 bits of the absolute
//! deadline; the hardware compares against `TIMERAWL` and fires
//! `TIMER_IRQ_0` when they match, same one-shot-per-arm model
//! `rtk_kernel::hirestimer` already assumes (it re-arms for the next
//! deadline from its own IRQ handler).
#![cfg(feature = "hires_timers")]

#[inline]
fn timer() -> &'static rp2040_pac::timer::RegisterBlock {
    unsafe { &*rp2040_pac::TIMER::ptr() }
}

/// # Safety
/// Only `rtk_kernel::hirestimer` calls this, while holding CPU Lock.
pub unsafe fn arm(deadline_us: Option<u64>) {
    let timer = timer();
    match deadline_us {
        Some(us) => {
            timer.inte.modify(|_, w| w.alarm_0().set_bit());
            timer.alarm0.write(|w| unsafe { w.bits(us as u32) });
        }
        None => {
            timer.armed.write(|w| unsafe { w.bits(1) });
            timer.inte.modify(|_, w| w.alarm_0().clear_bit());
        }
    }
}

/// Acknowledges a fired ALARM0 so the IRQ doesn't immediately re-trigger.
/// Called at the top of the application's `TIMER_IRQ_0` handler before it
/// calls `Kernel::hires_alarm_irq`.
pub fn ack() {
    timer().intr.write(|w| unsafe { w.bits(1) });
}
