//! A host-side mock [`Hal`] for exercising the scheduler, priority
//! inheritance, timeout engine, and SMP/health bookkeeping without real
//! hardware. Grounded in `r3_kernel`'s host test setup (`r3_port_std`, a
//! full std-backed port used by its test suite), cut down to exactly what
//! this crate's unit tests need: every method here manipulates plain
//! statics rather than real interrupts or a real context switch, so the
//! "current task" is always whichever test thread is running and
//! `context_switch` is a no-op (`check_preemption` still does all its ready-
//! queue bookkeeping; it just never actually resumes a different call
//! stack). Safe for tests because `TEST_LOCK` below serializes every test
//! against every other, undoing `cargo test`'s default parallelism.
#![cfg(test)]

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::hal::{CoreId, Hal};
use crate::task::TaskCb;

pub struct MockHal;

static CPU_LOCK: AtomicBool = AtomicBool::new(false);
static SPINLOCK: AtomicBool = AtomicBool::new(false);
static NOW_US: AtomicU64 = AtomicU64::new(0);
static TICKS: AtomicU32 = AtomicU32::new(0);
static CURRENT_CORE: AtomicU32 = AtomicU32::new(0);

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serializes one test's access to `MockHal`'s statics and resets them to
/// a fresh boot-like state. Hold the returned guard for the test's duration.
pub fn lock_test() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    CPU_LOCK.store(false, Ordering::SeqCst);
    SPINLOCK.store(false, Ordering::SeqCst);
    NOW_US.store(0, Ordering::SeqCst);
    TICKS.store(0, Ordering::SeqCst);
    CURRENT_CORE.store(0, Ordering::SeqCst);
    guard
}

pub fn set_current_core(core: CoreId) {
    CURRENT_CORE.store(core.index() as u32, Ordering::SeqCst);
}

pub fn advance_us(delta: u64) {
    NOW_US.fetch_add(delta, Ordering::SeqCst);
}

pub fn advance_ticks(n: u32) {
    TICKS.fetch_add(n, Ordering::SeqCst);
}

unsafe impl Hal for MockHal {
    fn current_core() -> CoreId {
        CoreId::from_index(CURRENT_CORE.load(Ordering::SeqCst) as usize)
    }

    unsafe fn enter_cpu_lock() {
        CPU_LOCK.store(true, Ordering::SeqCst);
    }

    unsafe fn leave_cpu_lock() {
        CPU_LOCK.store(false, Ordering::SeqCst);
    }

    fn is_cpu_lock_active() -> bool {
        CPU_LOCK.load(Ordering::SeqCst)
    }

    unsafe fn try_acquire_hw_spinlock(_index: u8, _max_spins: u32) -> bool {
        SPINLOCK
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    unsafe fn release_hw_spinlock(_index: u8) {
        SPINLOCK.store(false, Ordering::SeqCst);
    }

    fn now_us() -> u64 {
        NOW_US.load(Ordering::SeqCst)
    }

    fn tick_count() -> u32 {
        TICKS.load(Ordering::SeqCst)
    }

    #[cfg(feature = "hires_timers")]
    unsafe fn arm_hires_alarm(_deadline_us: Option<u64>) {}

    unsafe fn request_reschedule(_core: CoreId) {}

    unsafe fn context_switch(_prev: Option<&'static TaskCb<Self>>, _next: &'static TaskCb<Self>) {}

    unsafe fn prepare_task_stack(_task: &'static TaskCb<Self>) {}

    #[cfg(feature = "multi_core")]
    fn fifo_try_send(_word: crate::hal::RawFifoWord) -> bool {
        true
    }

    #[cfg(feature = "multi_core")]
    fn fifo_try_recv() -> Option<crate::hal::RawFifoWord> {
        None
    }

    fn feed_watchdog() {}

    fn configure_watchdog(_timeout_us: Option<u64>) {}
}

/// A [`TaskAttr`](crate::task::TaskAttr) with a real (if unused by the
/// no-op `context_switch`/`prepare_task_stack` above) statically-allocated
/// stack, so tests don't need one per call site.
pub fn task_attr(name: &'static str, priority: u8, affinity: crate::task::Affinity) -> crate::task::TaskAttr {
    fn noop_entry(_: usize) {}
    // Leaked once per call; fine for short-lived test binaries, and keeps
    // every task's stack region distinct without a `static mut` per test.
    let stack: &'static mut [u8; 256] = Box::leak(Box::new([0u8; 256]));
    crate::task::TaskAttr {
        name,
        entry: noop_entry,
        entry_param: 0,
        stack_base: stack.as_mut_ptr(),
        stack_size: stack.len(),
        base_priority: priority,
        affinity,
    }
}
