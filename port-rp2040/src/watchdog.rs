//! The RP2040 hardware watchdog backing `rtk_kernel::health`'s per-core
//! liveness checks. `WATCHDOG_LOAD` counts down once per watchdog tick
//! (configured to 1 us by `crate::boot::init_clocks`, same as the teacher's
//! `clock::init_clock`: "Supply clk_ref / 48 = 1MHz to SysTick and
//! watchdog"); writing it both reloads the timeout and feeds the dog, per
//! the RP2040 SDK's `watchdog_update`.
#[inline]
fn watchdog() -> &'static rp2040_pac::watchdog::RegisterBlock {
    unsafe { &*rp2040_pac::WATCHDOG::ptr() }
}

const MAX_LOAD: u32 = 0x00FF_FFFF;

pub fn configure_watchdog(timeout_us: Option<u64>) {
    let wdt = watchdog();
    match timeout_us {
        Some(us) => {
            let load = (us as u32).min(MAX_LOAD);
            wdt.load.write(|w| unsafe { w.bits(load) });
            wdt.ctrl.modify(|_, w| w.enable().set_bit());
        }
        None => {
            wdt.ctrl.modify(|_, w| w.enable().clear_bit());
        }
    }
}

pub fn feed_watchdog() {
    let wdt = watchdog();
    let load = wdt.ctrl.read().time().bits();
    wdt.load.write(|w| unsafe { w.bits(load) });
}

/// Whether the last reset was caused by the watchdog firing (as opposed to
/// power-on/brownout), per `WATCHDOG.REASON`.
pub fn reset_was_watchdog() -> bool {
    watchdog().reason.read().timer().bit_is_set()
}
