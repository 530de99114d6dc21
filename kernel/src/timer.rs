//! C4: tick-driven software timers.
//!
//! A singly-linked list of registered timers, walked once per tick; any
//! timer whose `now - start >= period` fires. Grounded in the general
//! "intrusive list through the arena" shape of `crate::task`/`crate::wait`,
//! but singly-linked and unsorted, matching §4.4's "walk the list" — unlike
//! the wait queues and ready queues, ordering doesn't matter here.
use crate::cfg::MAX_HIRES_TIMERS;
use crate::error::{KernelError, ParameterError, ResourceError};
use crate::hal::Hal;
use crate::klock::{CpuLockToken, KCell};

/// Number of software (tick-driven) timers a kernel instance can register.
/// Reuses the hi-res timer budget: both are bounded, infrequently-created
/// objects of the same rough cardinality in a typical application.
pub const MAX_SW_TIMERS: usize = MAX_HIRES_TIMERS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Running,
    Expired,
}

struct SwTimerCb<H: Hal> {
    in_use: KCell<H, bool>,
    name: KCell<H, &'static str>,
    callback: KCell<H, fn(usize)>,
    arg: KCell<H, usize>,
    period_ticks: KCell<H, u32>,
    start_tick: KCell<H, u32>,
    auto_reload: KCell<H, bool>,
    state: KCell<H, TimerState>,
    next: KCell<H, Option<u16>>,
}

impl<H: Hal> SwTimerCb<H> {
    const fn vacant() -> Self {
        Self {
            in_use: KCell::new(false),
            name: KCell::new(""),
            callback: KCell::new(noop),
            arg: KCell::new(0),
            period_ticks: KCell::new(0),
            start_tick: KCell::new(0),
            auto_reload: KCell::new(false),
            state: KCell::new(TimerState::Stopped),
            next: KCell::new(None),
        }
    }
}

fn noop(_: usize) {}

/// Handle returned by [`crate::Kernel::timer_init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u16);

pub struct SwTimerPool<H: Hal> {
    slots: [SwTimerCb<H>; MAX_SW_TIMERS],
    head: KCell<H, Option<u16>>,
}

impl<H: Hal> SwTimerPool<H> {
    pub const fn new() -> Self {
        Self {
            slots: [const { SwTimerCb::vacant() }; MAX_SW_TIMERS],
            head: KCell::new(None),
        }
    }
}

impl<H: Hal> crate::Kernel<H> {
    pub fn timer_init(
        &self,
        tok_outer: Option<&CpuLockToken<H>>,
        name: &'static str,
        callback: fn(usize),
        arg: usize,
        period_ms: u32,
        auto_reload: bool,
    ) -> Result<TimerHandle, KernelError> {
        if period_ms == 0 {
            return Err(ParameterError::BadTimeout.into());
        }
        let period_ticks = self.ms_to_ticks(period_ms).max(1);
        let guard;
        let tok = match tok_outer {
            Some(t) => t,
            None => {
                guard = crate::klock::lock_cpu::<H>();
                guard.token()
            }
        };

        let idx = self
            .sw_timers
            .slots
            .iter()
            .position(|t| !t.in_use.get(tok))
            .ok_or(KernelError::from(ResourceError::NoFreeTimerSlot))?;
        let cb = &self.sw_timers.slots[idx];
        cb.in_use.set(tok, true);
        cb.name.set(tok, name);
        cb.callback.set(tok, callback);
        cb.arg.set(tok, arg);
        cb.period_ticks.set(tok, period_ticks);
        cb.start_tick.set(tok, 0);
        cb.auto_reload.set(tok, auto_reload);
        cb.state.set(tok, TimerState::Stopped);
        cb.next.set(tok, self.sw_timers.head.get(tok));
        self.sw_timers.head.set(tok, Some(idx as u16));
        Ok(TimerHandle(idx as u16))
    }

    pub fn timer_start(&self, handle: TimerHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let cb = self.sw_timer(tok, handle)?;
        cb.start_tick.set(tok, H::tick_count());
        cb.state.set(tok, TimerState::Running);
        Ok(())
    }

    pub fn timer_stop(&self, handle: TimerHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let cb = self.sw_timer(tok, handle)?;
        cb.state.set(tok, TimerState::Stopped);
        Ok(())
    }

    pub fn timer_reset(&self, handle: TimerHandle) -> Result<(), KernelError> {
        self.timer_start(handle)
    }

    pub fn timer_change_period(&self, handle: TimerHandle, period_ms: u32) -> Result<(), KernelError> {
        if period_ms == 0 {
            return Err(ParameterError::BadTimeout.into());
        }
        let ticks = self.ms_to_ticks(period_ms).max(1);
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let cb = self.sw_timer(tok, handle)?;
        cb.period_ticks.set(tok, ticks);
        Ok(())
    }

    pub fn timer_query(&self, handle: TimerHandle) -> Result<TimerState, KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        Ok(self.sw_timer(tok, handle)?.state.get(tok))
    }

    fn sw_timer(&self, tok: &CpuLockToken<H>, handle: TimerHandle) -> Result<&SwTimerCb<H>, KernelError> {
        let cb = &self.sw_timers.slots[handle.0 as usize];
        if cb.in_use.get(tok) {
            Ok(cb)
        } else {
            Err(ParameterError::UnknownObjectId.into())
        }
    }

    fn ms_to_ticks(&self, ms: u32) -> u32 {
        ((ms as u64 * self.config.tick_rate_hz as u64) / 1000) as u32
    }

    /// Walks every registered software timer and fires any whose period has
    /// elapsed (§4.4), measured with wraparound-safe unsigned subtraction
    /// (§4.1). Called once per tick from [`crate::Kernel::tick_handler`].
    ///
    /// The source declared this handler's fire policy two different ways
    /// for a callback that itself restarts the timer; resolved here
    /// deterministically: an auto-reload timer's restart (`start_tick`
    /// advance) happens before its callback runs, and the callback itself
    /// always runs with the tick lock released, never under it, matching
    /// §5's "no user code runs under any kernel lock". That means scanning
    /// and rearming happens in one pass under CPU Lock, and firing happens
    /// in a second pass after the lock is dropped.
    pub(crate) fn sw_timers_tick(&self, now: u32) {
        let mut due: arrayvec::ArrayVec<(fn(usize), usize), MAX_SW_TIMERS> = arrayvec::ArrayVec::new();
        {
            let guard = crate::klock::lock_cpu::<H>();
            let tok = guard.token();
            let mut cursor = self.sw_timers.head.get(tok);
            while let Some(idx) = cursor {
                let cb = &self.sw_timers.slots[idx as usize];
                cursor = cb.next.get(tok);
                if cb.state.get(tok) != TimerState::Running {
                    continue;
                }
                let elapsed = now.wrapping_sub(cb.start_tick.get(tok));
                if elapsed >= cb.period_ticks.get(tok) {
                    if cb.auto_reload.get(tok) {
                        cb.start_tick.set(tok, now);
                    } else {
                        cb.state.set(tok, TimerState::Expired);
                    }
                    let _ = due.try_push((cb.callback.get(tok), cb.arg.get(tok)));
                }
            }
        }
        for (callback, arg) in due {
            callback(arg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{advance_ticks, lock_test, MockHal};
    use core::sync::atomic::{AtomicU32, Ordering};

    fn new_kernel() -> crate::Kernel<MockHal> {
        crate::Kernel::new(crate::cfg::KernelConfig::default())
    }

    static FIRE_COUNT: AtomicU32 = AtomicU32::new(0);

    fn record_fire(_: usize) {
        FIRE_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn zero_period_is_rejected() {
        let _g = lock_test();
        let kernel = new_kernel();
        assert!(matches!(kernel.timer_init(None, "t", record_fire, 0, 0, false), Err(_)));
    }

    #[test]
    fn one_shot_timer_fires_once_then_expires() {
        let _g = lock_test();
        let kernel = new_kernel();
        FIRE_COUNT.store(0, Ordering::SeqCst);

        let h = kernel.timer_init(None, "t", record_fire, 0, 10, false).unwrap();
        kernel.timer_start(h).unwrap();
        assert_eq!(kernel.timer_query(h).unwrap(), TimerState::Running);

        advance_ticks(10);
        kernel.sw_timers_tick(MockHal::tick_count());
        assert_eq!(FIRE_COUNT.load(Ordering::SeqCst), 1);
        assert_eq!(kernel.timer_query(h).unwrap(), TimerState::Expired);

        // Already expired; a further tick must not fire it again.
        advance_ticks(10);
        kernel.sw_timers_tick(MockHal::tick_count());
        assert_eq!(FIRE_COUNT.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn auto_reload_timer_keeps_firing_and_stays_running() {
        let _g = lock_test();
        let kernel = new_kernel();
        FIRE_COUNT.store(0, Ordering::SeqCst);

        let h = kernel.timer_init(None, "t", record_fire, 0, 5, true).unwrap();
        kernel.timer_start(h).unwrap();

        advance_ticks(5);
        kernel.sw_timers_tick(MockHal::tick_count());
        assert_eq!(FIRE_COUNT.load(Ordering::SeqCst), 1);
        assert_eq!(kernel.timer_query(h).unwrap(), TimerState::Running);

        advance_ticks(5);
        kernel.sw_timers_tick(MockHal::tick_count());
        assert_eq!(FIRE_COUNT.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stopped_timer_does_not_fire() {
        let _g = lock_test();
        let kernel = new_kernel();
        FIRE_COUNT.store(0, Ordering::SeqCst);

        let h = kernel.timer_init(None, "t", record_fire, 0, 5, false).unwrap();
        kernel.timer_start(h).unwrap();
        kernel.timer_stop(h).unwrap();

        advance_ticks(100);
        kernel.sw_timers_tick(MockHal::tick_count());
        assert_eq!(FIRE_COUNT.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handle_to_a_never_initialized_slot_is_rejected() {
        let _g = lock_test();
        let kernel = new_kernel();
        let h = kernel.timer_init(None, "t", record_fire, 0, 5, false).unwrap();
        assert!(kernel.timer_query(h).is_ok());

        // A handle into a slot nothing has ever created over (still `vacant`,
        // `in_use == false`) must be rejected rather than read garbage state.
        let never_created = TimerHandle((MAX_SW_TIMERS - 1) as u16);
        assert!(matches!(kernel.timer_query(never_created), Err(_)));
    }
}
