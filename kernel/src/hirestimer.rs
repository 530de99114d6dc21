//! C5: microsecond-resolution hi-res timer wheel, gated by the
//! `hires_timers` feature.
//!
//! Active timers live in a doubly-linked list sorted by next-expiry,
//! mirroring [`crate::timeout::TimeoutEngine`]'s shape but at µs
//! resolution and backed by a single hardware alarm rather than the tick.
//! Drift compensation follows §4.5's gain-1/4, ±period/4-clamped correction.
#![cfg(feature = "hires_timers")]

use crate::cfg::MAX_HIRES_TIMERS;
use crate::error::{KernelError, ParameterError, ResourceError};
use crate::hal::Hal;
use crate::klock::{CpuLockToken, KCell};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiresTimerState {
    Stopped,
    Running,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiresMode {
    OneShot,
    Periodic,
}

struct HiresTimerCb<H: Hal> {
    in_use: KCell<H, bool>,
    callback: KCell<H, fn(usize)>,
    arg: KCell<H, usize>,
    period_us: KCell<H, u32>,
    mode: KCell<H, HiresMode>,
    state: KCell<H, HiresTimerState>,
    next_expiry_us: KCell<H, u64>,
    /// Accumulated scheduling drift, applied with gain 1/4 and clamped to
    /// ±period/4 (§4.5): `next = now + period - accumulator`.
    drift_accumulator_us: KCell<H, i32>,
    min_drift_us: KCell<H, i32>,
    max_drift_us: KCell<H, i32>,
    /// Unused future hook (§9 Open Questions): the source never produces a
    /// value for these, so no calibration protocol is invented here.
    #[allow(dead_code)]
    frequency_correction: KCell<H, i32>,
    #[allow(dead_code)]
    calibration_offset_us: KCell<H, i32>,
    prev: KCell<H, Option<u16>>,
    next: KCell<H, Option<u16>>,
}

impl<H: Hal> HiresTimerCb<H> {
    const fn vacant() -> Self {
        Self {
            in_use: KCell::new(false),
            callback: KCell::new(noop),
            arg: KCell::new(0),
            period_us: KCell::new(0),
            mode: KCell::new(HiresMode::OneShot),
            state: KCell::new(HiresTimerState::Stopped),
            next_expiry_us: KCell::new(0),
            drift_accumulator_us: KCell::new(0),
            min_drift_us: KCell::new(0),
            max_drift_us: KCell::new(0),
            frequency_correction: KCell::new(0),
            calibration_offset_us: KCell::new(0),
            prev: KCell::new(None),
            next: KCell::new(None),
        }
    }
}

fn noop(_: usize) {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiresTimerHandle(u16);

pub struct HiresTimerPool<H: Hal> {
    slots: [HiresTimerCb<H>; MAX_HIRES_TIMERS],
    /// Head of the active list, sorted ascending by `next_expiry_us`. The
    /// hardware alarm is always armed for this entry's deadline.
    head: KCell<H, Option<u16>>,
}

impl<H: Hal> HiresTimerPool<H> {
    pub const fn new() -> Self {
        Self {
            slots: [const { HiresTimerCb::vacant() }; MAX_HIRES_TIMERS],
            head: KCell::new(None),
        }
    }
}

impl<H: Hal> crate::Kernel<H> {
    pub fn hires_timer_init(
        &self,
        callback: fn(usize),
        arg: usize,
        period_us: u32,
        mode: HiresMode,
    ) -> Result<HiresTimerHandle, KernelError> {
        if period_us == 0 {
            return Err(ParameterError::BadTimeout.into());
        }
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self
            .hires_timers
            .slots
            .iter()
            .position(|t| !t.in_use.get(tok))
            .ok_or(KernelError::from(ResourceError::NoFreeTimerSlot))?;
        let cb = &self.hires_timers.slots[idx];
        cb.in_use.set(tok, true);
        cb.callback.set(tok, callback);
        cb.arg.set(tok, arg);
        cb.period_us.set(tok, period_us);
        cb.mode.set(tok, mode);
        cb.state.set(tok, HiresTimerState::Stopped);
        cb.drift_accumulator_us.set(tok, 0);
        cb.min_drift_us.set(tok, 0);
        cb.max_drift_us.set(tok, 0);
        Ok(HiresTimerHandle(idx as u16))
    }

    pub fn hires_timer_start(&self, handle: HiresTimerHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self.check_hires_handle(tok, handle)?;
        let deadline = H::now_us() + self.hires_timers.slots[idx].period_us.get(tok) as u64;
        self.hires_timers.slots[idx].state.set(tok, HiresTimerState::Running);
        self.hires_insert(tok, idx as u16, deadline);
        Ok(())
    }

    pub fn hires_timer_stop(&self, handle: HiresTimerHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self.check_hires_handle(tok, handle)?;
        if self.hires_timers.slots[idx].state.get(tok) == HiresTimerState::Running {
            self.hires_remove(tok, idx as u16);
        }
        self.hires_timers.slots[idx].state.set(tok, HiresTimerState::Stopped);
        self.rearm_hires_alarm(tok);
        Ok(())
    }

    /// Restarts `handle` from now, as if freshly started (§6's "same surface
    /// as software timers"; see [`crate::timer::Kernel::timer_reset`]).
    /// Clears any accumulated drift correction along with the old schedule.
    pub fn hires_timer_reset(&self, handle: HiresTimerHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self.check_hires_handle(tok, handle)?;
        if self.hires_timers.slots[idx].state.get(tok) == HiresTimerState::Running {
            self.hires_remove(tok, idx as u16);
        }
        let deadline = H::now_us() + self.hires_timers.slots[idx].period_us.get(tok) as u64;
        self.hires_timers.slots[idx].drift_accumulator_us.set(tok, 0);
        self.hires_timers.slots[idx].state.set(tok, HiresTimerState::Running);
        self.hires_insert(tok, idx as u16, deadline);
        Ok(())
    }

    /// Changes `handle`'s period; takes effect from the next expiry onward,
    /// not retroactively on the currently-armed deadline (matching
    /// [`crate::timer::Kernel::timer_change_period`]'s software-timer
    /// counterpart).
    pub fn hires_timer_change_period(&self, handle: HiresTimerHandle, period_us: u32) -> Result<(), KernelError> {
        if period_us == 0 {
            return Err(ParameterError::BadTimeout.into());
        }
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self.check_hires_handle(tok, handle)?;
        self.hires_timers.slots[idx].period_us.set(tok, period_us);
        Ok(())
    }

    pub fn hires_timer_query(&self, handle: HiresTimerHandle) -> Result<HiresTimerState, KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self.check_hires_handle(tok, handle)?;
        Ok(self.hires_timers.slots[idx].state.get(tok))
    }

    fn check_hires_handle(&self, tok: &CpuLockToken<H>, handle: HiresTimerHandle) -> Result<usize, KernelError> {
        let idx = handle.0 as usize;
        if self.hires_timers.slots[idx].in_use.get(tok) {
            Ok(idx)
        } else {
            Err(ParameterError::UnknownObjectId.into())
        }
    }

    fn hires_insert(&self, tok: &CpuLockToken<H>, id: u16, deadline_us: u64) {
        let cb = &self.hires_timers.slots[id as usize];
        cb.next_expiry_us.set(tok, deadline_us);
        let mut cursor = self.hires_timers.head.get(tok);
        let mut prev = None;
        while let Some(cur) = cursor {
            if self.hires_timers.slots[cur as usize].next_expiry_us.get(tok) > deadline_us {
                break;
            }
            prev = Some(cur);
            cursor = self.hires_timers.slots[cur as usize].next.get(tok);
        }
        cb.prev.set(tok, prev);
        cb.next.set(tok, cursor);
        match prev {
            Some(p) => self.hires_timers.slots[p as usize].next.set(tok, Some(id)),
            None => self.hires_timers.head.set(tok, Some(id)),
        }
        if let Some(n) = cursor {
            self.hires_timers.slots[n as usize].prev.set(tok, Some(id));
        }
        self.rearm_hires_alarm(tok);
    }

    fn hires_remove(&self, tok: &CpuLockToken<H>, id: u16) {
        let cb = &self.hires_timers.slots[id as usize];
        let prev = cb.prev.get(tok);
        let next = cb.next.get(tok);
        match prev {
            Some(p) => self.hires_timers.slots[p as usize].next.set(tok, next),
            None => self.hires_timers.head.set(tok, next),
        }
        if let Some(n) = next {
            self.hires_timers.slots[n as usize].prev.set(tok, prev);
        }
    }

    fn rearm_hires_alarm(&self, tok: &CpuLockToken<H>) {
        let deadline = self
            .hires_timers
            .head
            .get(tok)
            .map(|id| self.hires_timers.slots[id as usize].next_expiry_us.get(tok));
        // Safety: called with CPU Lock held, as `arm_hires_alarm` requires.
        unsafe { H::arm_hires_alarm(deadline) };
    }

    /// The hi-res alarm IRQ handler: processes every timer with
    /// `expiry <= now` in expiry order, applying drift compensation to
    /// periodic timers, then rearms the alarm for the new head (§4.5).
    pub fn hires_alarm_handler(&self) {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let now = H::now_us();
        loop {
            let Some(id) = self.hires_timers.head.get(tok) else {
                break;
            };
            let cb = &self.hires_timers.slots[id as usize];
            if cb.next_expiry_us.get(tok) > now {
                break;
            }
            self.hires_remove(tok, id);

            let period = cb.period_us.get(tok) as i64;
            let expected = cb.next_expiry_us.get(tok) as i64;
            let actual = now as i64;
            let interval_error = (actual - expected) as i32;

            let callback = cb.callback.get(tok);
            let arg = cb.arg.get(tok);
            callback(arg);

            if cb.mode.get(tok) == HiresMode::Periodic && cb.state.get(tok) == HiresTimerState::Running {
                let acc = cb.drift_accumulator_us.get(tok);
                let clamp = period as i32 / 4;
                let new_acc = (acc + interval_error / 4).clamp(-clamp, clamp);
                cb.drift_accumulator_us.set(tok, new_acc);
                cb.min_drift_us.set(tok, cb.min_drift_us.get(tok).min(new_acc));
                cb.max_drift_us.set(tok, cb.max_drift_us.get(tok).max(new_acc));

                let next_expiry = (now as i64 + period - new_acc as i64).max(now as i64 + 1) as u64;
                self.hires_insert(tok, id, next_expiry);
            } else {
                cb.state.set(tok, HiresTimerState::Expired);
            }
        }
        self.rearm_hires_alarm(tok);
    }
}
