//! RP2040 (dual-core Cortex-M0+) port for `rtk`.
//!
//! Implements [`Hal`] once for the zero-sized [`BoardHal`] marker, the same
//! shape the teacher's `r3_support_rp2040` + `r3_port_arm_m` pair provides
//! for `r3_kernel`, collapsed into a single crate since this kernel targets
//! exactly one hardware family rather than a generic `arm_m` port plus a
//! board-support crate on top.
//!
//! What lives here: the `Hal` impl itself, the context-switch trampoline
//! (`threading`), time sources (`timebase`), the SIO FIFO (`fifo`) and
//! hardware spinlocks (`spinlock`), the watchdog (`watchdog`), the optional
//! hi-res alarm (`hires_alarm`), the reset-survives-reset region
//! (`reset_region`), and early bring-up (`boot`). What does *not* live
//! here: the application's `static KERNEL`, its interrupt vector bindings,
//! or its task bodies -- those belong to the demo binary, the same
//! division of labor as the teacher's `examples/smp_rp_pico` (board support
//! crate vs. `core0.rs`/`core1.rs`).
#![no_std]

pub mod boot;
pub mod fifo;
#[cfg(feature = "hires_timers")]
pub mod hires_alarm;
pub mod reset_region;
pub mod spinlock;
pub mod threading;
pub mod timebase;
pub mod watchdog;

use rtk_kernel::hal::{CoreId, Hal, RawFifoWord};
use rtk_kernel::task::TaskCb;

/// Zero-sized marker implementing [`Hal`] for the RP2040.
pub struct BoardHal;

// Safety: `enter_cpu_lock`/`leave_cpu_lock` are PRIMASK-only (armv6m has no
// BASEPRI, the same restriction `r3_port_arm_m` branches on via
// `cfg!(armv6m)`), correctly nest with interrupt state per core, `now_us`
// is a free-running 64-bit microsecond counter, and `context_switch` is the
// fiber-style swap documented in `threading`.
unsafe impl Hal for BoardHal {
    fn current_core() -> CoreId {
        let sio = unsafe { &*rp2040_pac::SIO::ptr() };
        if sio.cpuid.read().bits() == 0 {
            CoreId::Core0
        } else {
            CoreId::Core1
        }
    }

    unsafe fn enter_cpu_lock() {
        cortex_m::interrupt::disable();
    }

    unsafe fn leave_cpu_lock() {
        unsafe { cortex_m::interrupt::enable() };
    }

    fn is_cpu_lock_active() -> bool {
        cortex_m::register::primask::read().is_inactive()
    }

    unsafe fn try_acquire_hw_spinlock(index: u8, max_spins: u32) -> bool {
        unsafe { spinlock::try_acquire(index, max_spins) }
    }

    unsafe fn release_hw_spinlock(index: u8) {
        unsafe { spinlock::release(index) };
    }

    fn now_us() -> u64 {
        timebase::now_us()
    }

    fn tick_count() -> u32 {
        timebase::tick_count()
    }

    #[cfg(feature = "hires_timers")]
    unsafe fn arm_hires_alarm(deadline_us: Option<u64>) {
        unsafe { hires_alarm::arm(deadline_us) };
    }

    unsafe fn request_reschedule(core: CoreId) {
        unsafe { threading::request_reschedule(core) };
    }

    unsafe fn context_switch(prev: Option<&'static TaskCb<Self>>, next: &'static TaskCb<Self>) {
        unsafe { threading::context_switch(prev, next) };
    }

    unsafe fn prepare_task_stack(task: &'static TaskCb<Self>) {
        unsafe { threading::prepare_task_stack(task) };
    }

    #[cfg(feature = "multi_core")]
    fn fifo_try_send(word: RawFifoWord) -> bool {
        fifo::try_send(word)
    }

    #[cfg(feature = "multi_core")]
    fn fifo_try_recv() -> Option<RawFifoWord> {
        fifo::try_recv()
    }

    fn feed_watchdog() {
        watchdog::feed_watchdog();
    }

    fn configure_watchdog(timeout_us: Option<u64>) {
        watchdog::configure_watchdog(timeout_us);
    }
}
