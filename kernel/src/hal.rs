//! The boundary between the hardware-agnostic kernel and a concrete port.
//!
//! A port (e.g. `rtk-port-rp2040`) implements [`Hal`] once for a
//! zero-sized marker type and instantiates [`crate::Kernel`] with it. Every
//! method is an associated function, not a trait object method, the same
//! shape as `r3_kernel::{Port, PortThreading}` in the teacher, simplified by
//! dropping the const-generic-specialized `KernelCfg*` split since this
//! kernel targets one concrete hardware profile rather than a family of
//! ports.
//!
//! # Safety
//!
//! Every `unsafe fn` here is only meant to be called by the kernel itself,
//! under the preconditions documented per-method. Implementing this trait
//! is an assertion that the methods correctly reflect the target's actual
//! critical-section, context-switch, and multicore semantics.
use crate::task::TaskCb;

/// Which physical core we're asking about or acting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreId {
    Core0 = 0,
    Core1 = 1,
}

impl CoreId {
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn from_index(i: usize) -> Self {
        match i {
            0 => CoreId::Core0,
            _ => CoreId::Core1,
        }
    }

    #[inline]
    pub const fn other(self) -> Self {
        match self {
            CoreId::Core0 => CoreId::Core1,
            CoreId::Core1 => CoreId::Core0,
        }
    }
}

/// A message carried over the inter-core FIFO, sized to fit the RP2040 SIO
/// FIFO's 32-bit lanes two words at a time (see `crate::ipc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFifoWord(pub u32);

/// Hardware services the kernel needs from a port.
///
/// # Safety
///
/// Implementors must ensure `enter_cpu_lock`/`leave_cpu_lock` nest correctly
/// per core, that `now_us` is monotonic modulo the documented wraparound,
/// and that `context_switch` behaves as specified below.
pub unsafe trait Hal: 'static {
    /// Returns the identity of the core this code is currently running on.
    fn current_core() -> CoreId;

    /// Enters a per-core critical section (masks interrupts on the calling
    /// core only). Not necessarily recursive; the kernel itself never
    /// nests two per-core CPU Locks, only composes a CPU Lock with the
    /// recursive cross-core lock (see [`crate::klock`]).
    ///
    /// # Safety
    /// Only the kernel's locking code may call this.
    unsafe fn enter_cpu_lock();

    /// Leaves the per-core critical section entered by `enter_cpu_lock`.
    ///
    /// # Safety
    /// Must be paired with a preceding `enter_cpu_lock` on the same core.
    unsafe fn leave_cpu_lock();

    /// Whether a per-core CPU Lock is currently held on the calling core.
    fn is_cpu_lock_active() -> bool;

    /// Attempts to acquire one of a small set of hardware mutual-exclusion
    /// primitives (RP2040 SIO spinlocks) identified by `index`, spinning at
    /// most `max_spins` times. Returns `true` on success. Used only by
    /// [`crate::klock`] to build the recursive cross-core lock.
    ///
    /// # Safety
    /// Only the kernel's locking code may call this.
    unsafe fn try_acquire_hw_spinlock(index: u8, max_spins: u32) -> bool;

    /// Releases the hardware spinlock acquired by `try_acquire_hw_spinlock`.
    ///
    /// # Safety
    /// Must be paired with a preceding successful acquire of the same
    /// `index`, on the same core.
    unsafe fn release_hw_spinlock(index: u8);

    /// Monotonic microsecond counter. May wrap; callers compare with
    /// wrapping/signed-delta arithmetic, never direct `<`/`>` across long
    /// spans.
    fn now_us() -> u64;

    /// Monotonic tick counter (nominally incremented by the port's tick
    /// ISR at `KernelConfig::tick_rate_hz`). 32-bit and overflow-safe by
    /// unsigned-subtraction comparison (§4.1).
    fn tick_count() -> u32;

    /// Arms the hardware alarm used by the hi-res timer wheel to fire at
    /// `deadline_us` (absolute). Disarmed by passing `None`. Only called
    /// while holding CPU Lock.
    ///
    /// # Safety
    /// Only the hi-res timer wheel may call this.
    #[cfg(feature = "hires_timers")]
    unsafe fn arm_hires_alarm(deadline_us: Option<u64>);

    /// Wakes the *other* core so it re-evaluates which task should run
    /// there. `crate::task::Kernel::check_preemption` calls `context_switch`
    /// directly when the core needing a reschedule is the one already
    /// running this code; it only reaches for `request_reschedule` for the
    /// remote-core case, where the only channel available is an
    /// asynchronous doorbell (see `rtk-port-rp2040`'s FIFO-based
    /// implementation) rather than a real function call. Idempotent if a
    /// doorbell is already in flight.
    ///
    /// # Safety
    /// Only the scheduler may call this.
    unsafe fn request_reschedule(core: CoreId);

    /// Performs the context switch: saves `prev`'s (if any) callee-saved
    /// registers onto its own stack, records the resulting stack pointer
    /// into `prev`'s descriptor, then loads `next`'s saved stack pointer
    /// and callee-saved registers and resumes it. Does not return until
    /// `prev` (or whichever task eventually switches back to this point)
    /// is rescheduled.
    ///
    /// Called synchronously from `check_preemption`, wherever that was
    /// itself invoked from (a task calling `yield_now`, the tick ISR, an
    /// unblock that raises a higher-priority task) -- there is no separate
    /// pendable reschedule exception on this kernel's side of the
    /// boundary. A port built around a real hardware exception (PendSV and
    /// EXC_RETURN on a full Cortex-M port) would have to defer into that
    /// exception itself; see `rtk-port-rp2040`'s `threading` module for the
    /// fiber-style register/stack-pointer swap this port uses instead, and
    /// its documented limitation around mid-ISR switches.
    ///
    /// # Safety
    /// Must only be called by the kernel's scheduler, with `prev`/`next`
    /// both valid for the duration of the call and CPU Lock held.
    unsafe fn context_switch(prev: Option<&'static TaskCb<Self>>, next: &'static TaskCb<Self>);

    /// Initializes a freshly-created task's saved context so that the next
    /// `context_switch` into it begins executing `entry(arg)`.
    ///
    /// # Safety
    /// `task`'s stack region must be valid and not currently in use.
    unsafe fn prepare_task_stack(task: &'static TaskCb<Self>);

    /// Pushes one word onto this core's outgoing SIO-style FIFO to the
    /// other core. Returns `false` if the hardware FIFO is full (caller
    /// retries or reports drop per `crate::ipc`'s policy).
    #[cfg(feature = "multi_core")]
    fn fifo_try_send(word: RawFifoWord) -> bool;

    /// Pops one word from this core's incoming FIFO, if any is pending.
    #[cfg(feature = "multi_core")]
    fn fifo_try_recv() -> Option<RawFifoWord>;

    /// Feeds the hardware watchdog (resets its countdown). Self-reported by
    /// the idle task and any cooperating long-running task; see
    /// `crate::health`.
    fn feed_watchdog();

    /// Reconfigures the hardware watchdog's timeout, or disables it when
    /// `timeout_us` is `None`.
    fn configure_watchdog(timeout_us: Option<u64>);
}
