//! Event sets: a per-object 32-bit flag word, set/cleared by any task or
//! ISR, waited on with an AND/OR mask match (§4.7's event API). Grounded in
//! the same general shape as `crate::semaphore` but with a match predicate
//! instead of a plain counter, so waiters can't simply be popped FIFO — the
//! whole queue is rescanned on every `set` to find everyone whose mask now
//! matches. The predicate itself lives on the waiting task
//! (`crate::task::TaskCb::pending_event_wait`) rather than in the wait
//! queue, so `crate::wait::WaitQueue` stays primitive-agnostic.
use crate::cfg::MAX_EVENT_SETS;
use crate::error::{KernelError, ParameterError, ResourceError};
use crate::hal::Hal;
use crate::klock::{CpuLockToken, KCell};
use crate::task::{BlockReason, PendingEventWait, TaskId};
use crate::timeout::{TIMEOUT_IMMEDIATE, TIMEOUT_INFINITE};
use crate::wait::WaitQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSetHandle(u16);

/// Whether a wait is satisfied by any one bit in the mask, or requires
/// every bit in the mask to be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Any,
    All,
}

fn matches(bits: u32, mask: u32, require_all: bool) -> bool {
    if require_all {
        bits & mask == mask
    } else {
        bits & mask != 0
    }
}

struct EventSetCb<H: Hal> {
    in_use: KCell<H, bool>,
    bits: KCell<H, u32>,
    waiters: WaitQueue<H>,
}

impl<H: Hal> EventSetCb<H> {
    const fn vacant() -> Self {
        Self {
            in_use: KCell::new(false),
            bits: KCell::new(0),
            waiters: WaitQueue::new(),
        }
    }
}

pub struct EventSetPool<H: Hal> {
    slots: [EventSetCb<H>; MAX_EVENT_SETS],
}

impl<H: Hal> EventSetPool<H> {
    pub const fn new() -> Self {
        Self {
            slots: [const { EventSetCb::vacant() }; MAX_EVENT_SETS],
        }
    }
}

impl<H: Hal> crate::Kernel<H> {
    pub fn event_set_create(&self, initial_bits: u32) -> Result<EventSetHandle, KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self
            .event_sets
            .slots
            .iter()
            .position(|e| !e.in_use.get(tok))
            .ok_or(KernelError::from(ResourceError::NoFreeObjectSlot))?;
        let e = &self.event_sets.slots[idx];
        e.in_use.set(tok, true);
        e.bits.set(tok, initial_bits);
        Ok(EventSetHandle(idx as u16))
    }

    pub fn event_set_delete(&self, handle: EventSetHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let e = self.event_set(tok, handle)?;
        e.in_use.set(tok, false);
        Ok(())
    }

    /// ORs `bits` into the set, then wakes every waiter whose mask now
    /// matches (each independently, per its own `clear_on_exit`).
    pub fn event_set_set(&'static self, handle: EventSetHandle, bits: u32) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self.event_set_index(tok, handle)?;
        *self.event_sets.slots[idx].bits.write(tok) |= bits;
        self.wake_matching(tok, idx);
        drop(guard);
        self.check_preemption(H::current_core());
        Ok(())
    }

    pub fn event_set_clear(&self, handle: EventSetHandle, bits: u32) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let e = self.event_set(tok, handle)?;
        *e.bits.write(tok) &= !bits;
        Ok(())
    }

    pub fn event_set_get(&self, handle: EventSetHandle) -> Result<u32, KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        Ok(self.event_set(tok, handle)?.bits.get(tok))
    }

    /// Waits for `mask` to match under `mode`, returning the bits observed
    /// at the moment of match. If `clear_on_exit`, those matched bits (per
    /// `mode`: the whole mask for `All`, just the matching bits for `Any`)
    /// are cleared atomically with the wake (§4.7's "consume on read").
    pub fn event_set_wait(
        &'static self,
        handle: EventSetHandle,
        mask: u32,
        mode: MatchMode,
        clear_on_exit: bool,
        timeout_ms: u32,
    ) -> Result<u32, KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self.event_set_index(tok, handle)?;
        let require_all = mode == MatchMode::All;
        let e = &self.event_sets.slots[idx];
        let bits = e.bits.get(tok);
        if matches(bits, mask, require_all) {
            if clear_on_exit {
                let cleared = if require_all { mask } else { bits & mask };
                *e.bits.write(tok) &= !cleared;
            }
            return Ok(bits);
        }
        if timeout_ms == TIMEOUT_IMMEDIATE {
            return Err(crate::error::TimingError::TimedOut.into());
        }

        let core = H::current_core();
        let caller = self
            .core(core)
            .running
            .get(tok)
            .expect("event_set_wait called with no running task");
        self.tasks.get(caller).set_pending_event_wait(
            tok,
            Some(PendingEventWait {
                mask,
                require_all,
                clear_on_exit,
            }),
        );
        if timeout_ms != TIMEOUT_INFINITE {
            self.timeout_arm(tok, caller, timeout_ms, None);
        }
        self.block_on(tok, &e.waiters, BlockReason::EventSet);
        drop(guard);
        self.check_preemption(core);

        let guard2 = crate::klock::lock_cpu::<H>();
        let tok2 = guard2.token();
        let task = self.tasks.get(caller);
        let result = task.wait_result(tok2);
        let observed = task.event_wait_observed(tok2);
        task.set_pending_event_wait(tok2, None);
        result.map(|()| observed)
    }

    /// Rescans every waiter on event-set `idx`, waking each whose recorded
    /// predicate now matches the current bits; leaves the rest queued in
    /// their original relative order.
    fn wake_matching(&'static self, tok: &CpuLockToken<H>, idx: usize) {
        let e = &self.event_sets.slots[idx];
        let candidates: arrayvec::ArrayVec<TaskId, { crate::cfg::MAX_TASKS }> =
            e.waiters.iter(&self.tasks, tok).collect();

        for id in candidates {
            let Some(pending) = self.tasks.get(id).pending_event_wait(tok) else {
                continue;
            };
            let bits = e.bits.get(tok);
            if !matches(bits, pending.mask, pending.require_all) {
                continue;
            }
            e.waiters.remove(&self.tasks, tok, id);
            if pending.clear_on_exit {
                let cleared = if pending.require_all { pending.mask } else { bits & pending.mask };
                *e.bits.write(tok) &= !cleared;
            }
            self.tasks.get(id).set_event_wait_observed(tok, bits);
            self.finish_wait(tok, id, Ok(()));
        }
    }

    fn event_set_index(&self, tok: &CpuLockToken<H>, handle: EventSetHandle) -> Result<usize, KernelError> {
        let idx = handle.0 as usize;
        if self.event_sets.slots[idx].in_use.get(tok) {
            Ok(idx)
        } else {
            Err(ParameterError::UnknownObjectId.into())
        }
    }

    fn event_set(&self, tok: &CpuLockToken<H>, handle: EventSetHandle) -> Result<&EventSetCb<H>, KernelError> {
        let idx = self.event_set_index(tok, handle)?;
        Ok(&self.event_sets.slots[idx])
    }
}
