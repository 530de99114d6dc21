//! C6: the timeout discipline shared by every blocking API.
//!
//! A concrete (finite) timeout becomes one entry in a single microsecond-
//! deadline-ordered list, independent of the tick-driven software timers
//! (C4) and the hi-res hardware-timer wheel (C5) — those schedule
//! user-visible callbacks; this schedules "stop waiting" for a blocked task.
//! Processed from the tick handler (coarse, §4.4) so a finite timeout never
//! needs hardware-alarm precision to be useful; `hires_timers` builds additionally
//! process it from the hi-res IRQ for sub-tick responsiveness.
//!
//! Grounded in `r3_kernel::timeout`'s `TimeoutRef`/global sorted list, with
//! the pointer back-reference replaced by an arena index per Design Notes
//! §9, same departure as [`crate::wait`].
use crate::cfg::MAX_TASKS;
use crate::hal::Hal;
use crate::klock::{CpuLockToken, KCell};
use crate::task::TaskId;

/// The sentinel a caller passes to mean "never expire" (§6's external
/// millisecond API maps `UINT32_MAX` to this).
pub const TIMEOUT_INFINITE: u32 = u32::MAX;
/// The sentinel meaning "don't block at all, just probe" (external API's 0).
pub const TIMEOUT_IMMEDIATE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    Completed,
    Expired,
    Cancelled,
}

/// A timeout's optional on-expiry cleanup (§4.6, §9's "priority-inheritance
/// undo on timeout"): the primitive that armed the timeout supplies a
/// function and an opaque argument (its own object index, mirroring the
/// `fn(usize)` shape `crate::timer`/`crate::hirestimer` callbacks use),
/// invoked after the task is unlinked from its wait queue but before it's
/// marked `Ready`.
pub(crate) type TimeoutCleanup<H> = (fn(&'static crate::Kernel<H>, &CpuLockToken<H>, TaskId, usize), usize);

struct TimeoutEntry<H: Hal> {
    in_use: KCell<H, bool>,
    deadline_us: KCell<H, u64>,
    task: KCell<H, Option<TaskId>>,
    cleanup: KCell<H, Option<fn(&'static crate::Kernel<H>, &CpuLockToken<H>, TaskId, usize)>>,
    cleanup_arg: KCell<H, usize>,
    prev: KCell<H, Option<u16>>,
    next: KCell<H, Option<u16>>,
}

impl<H: Hal> TimeoutEntry<H> {
    const fn vacant() -> Self {
        Self {
            in_use: KCell::new(false),
            deadline_us: KCell::new(0),
            task: KCell::new(None),
            cleanup: KCell::new(None),
            cleanup_arg: KCell::new(0),
            prev: KCell::new(None),
            next: KCell::new(None),
        }
    }
}

/// The fixed pool of concrete timeouts, plus the sorted-by-deadline list of
/// currently-active ones. Sized to [`crate::cfg::MAX_TASKS`]: a task has at
/// most one outstanding blocking-call timeout at a time.
pub struct TimeoutEngine<H: Hal> {
    entries: [TimeoutEntry<H>; MAX_TASKS],
    head: KCell<H, Option<u16>>,
    completed_count: KCell<H, u32>,
    expired_count: KCell<H, u32>,
    cancelled_count: KCell<H, u32>,
}

impl<H: Hal> TimeoutEngine<H> {
    pub const fn new() -> Self {
        Self {
            entries: [const { TimeoutEntry::vacant() }; MAX_TASKS],
            head: KCell::new(None),
            completed_count: KCell::new(0),
            expired_count: KCell::new(0),
            cancelled_count: KCell::new(0),
        }
    }

    fn alloc(&self, tok: &CpuLockToken<H>) -> Option<u16> {
        self.entries
            .iter()
            .position(|e| !e.in_use.get(tok))
            .map(|i| {
                self.entries[i].in_use.set(tok, true);
                i as u16
            })
    }

    /// Inserts a new timeout for `task`, expiring at absolute `deadline_us`,
    /// keeping the list sorted ascending by deadline. `cleanup`, if given,
    /// runs once on expiry (not on a normal completion or cancellation) --
    /// see [`TimeoutCleanup`]. Returns `None` if the pool is exhausted --
    /// callers treat that as "block without a timeout" being unsafe, so in
    /// practice `MAX_TASKS` entries is always enough since at most one
    /// timeout exists per blocked task.
    pub fn start(
        &self,
        tok: &CpuLockToken<H>,
        task: TaskId,
        deadline_us: u64,
        cleanup: Option<TimeoutCleanup<H>>,
    ) -> Option<u16> {
        let id = self.alloc(tok)?;
        let entry = &self.entries[id as usize];
        entry.deadline_us.set(tok, deadline_us);
        entry.task.set(tok, Some(task));
        match cleanup {
            Some((f, arg)) => {
                entry.cleanup.set(tok, Some(f));
                entry.cleanup_arg.set(tok, arg);
            }
            None => entry.cleanup.set(tok, None),
        }
        entry.prev.set(tok, None);
        entry.next.set(tok, None);

        let mut cursor = self.head.get(tok);
        let mut prev = None;
        while let Some(cur) = cursor {
            if self.entries[cur as usize].deadline_us.get(tok) > deadline_us {
                break;
            }
            prev = Some(cur);
            cursor = self.entries[cur as usize].next.get(tok);
        }

        entry.prev.set(tok, prev);
        entry.next.set(tok, cursor);
        match prev {
            Some(p) => self.entries[p as usize].next.set(tok, Some(id)),
            None => self.head.set(tok, Some(id)),
        }
        if let Some(n) = cursor {
            self.entries[n as usize].prev.set(tok, Some(id));
        }
        Some(id)
    }

    /// Cancels timeout `id`, idempotently: a second cancel (or a cancel
    /// after expiry already freed the slot) is a no-op (§4.6, §8's
    /// round-trip law).
    pub fn cancel(&self, tok: &CpuLockToken<H>, id: u16) {
        let entry = &self.entries[id as usize];
        if !entry.in_use.get(tok) {
            return;
        }
        self.unlink(tok, id);
        entry.in_use.set(tok, false);
        *self.cancelled_count.write(tok) += 1;
    }

    fn unlink(&self, tok: &CpuLockToken<H>, id: u16) {
        let entry = &self.entries[id as usize];
        let prev = entry.prev.get(tok);
        let next = entry.next.get(tok);
        match prev {
            Some(p) => self.entries[p as usize].next.set(tok, next),
            None => self.head.set(tok, next),
        }
        if let Some(n) = next {
            self.entries[n as usize].prev.set(tok, prev);
        }
    }

    pub fn mark_completed(&self, tok: &CpuLockToken<H>) {
        *self.completed_count.write(tok) += 1;
    }

    /// Returns every timeout whose deadline has passed, removing them from
    /// the list and freeing their slots. Called from the tick handler (and,
    /// under `hires_timers`, the hi-res IRQ) with the current time.
    pub fn drain_expired(&self, tok: &CpuLockToken<H>, now_us: u64) -> ExpiredIter<'_, H> {
        ExpiredIter {
            engine: self,
            tok,
            now_us,
        }
    }
}

pub struct ExpiredIter<'a, H: Hal> {
    engine: &'a TimeoutEngine<H>,
    tok: &'a CpuLockToken<H>,
    now_us: u64,
}

impl<'a, H: Hal> Iterator for ExpiredIter<'a, H> {
    type Item = (TaskId, Option<TimeoutCleanup<H>>);
    fn next(&mut self) -> Option<Self::Item> {
        let head = self.engine.head.get(self.tok)?;
        if self.engine.entries[head as usize].deadline_us.get(self.tok) > self.now_us {
            return None;
        }
        self.engine.unlink(self.tok, head);
        let entry = &self.engine.entries[head as usize];
        let task = entry.task.get(self.tok)?;
        let cleanup = entry.cleanup.get(self.tok).map(|f| (f, entry.cleanup_arg.get(self.tok)));
        entry.in_use.set(self.tok, false);
        *self.engine.expired_count.write(self.tok) += 1;
        Some((task, cleanup))
    }
}

impl<H: Hal> crate::Kernel<H> {
    pub(crate) fn timeout_cancel(&self, tok: &CpuLockToken<H>, id: u16) {
        self.timeouts.cancel(tok, id);
    }

    /// Converts a millisecond timeout argument (§6) to an absolute µs
    /// deadline, installs it, and records the back-reference on `task`. Does
    /// nothing for [`TIMEOUT_INFINITE`]/[`TIMEOUT_IMMEDIATE`]: those are
    /// handled by the caller before ever reaching the blocking path.
    pub(crate) fn timeout_arm(
        &self,
        tok: &CpuLockToken<H>,
        task: TaskId,
        timeout_ms: u32,
        cleanup: Option<TimeoutCleanup<H>>,
    ) {
        debug_assert!(timeout_ms != TIMEOUT_INFINITE && timeout_ms != TIMEOUT_IMMEDIATE);
        let deadline_us = H::now_us() + (timeout_ms as u64) * 1000;
        if let Some(id) = self.timeouts.start(tok, task, deadline_us, cleanup) {
            self.tasks.get(task).set_current_timeout(tok, Some(id));
        }
    }

    /// Called from the tick handler (C4) and, under `hires_timers`, the
    /// hi-res IRQ, to release every task whose timeout has elapsed.
    pub(crate) fn timeout_tick(&'static self, tok: &CpuLockToken<H>, now_us: u64) {
        let expired: arrayvec::ArrayVec<(TaskId, Option<TimeoutCleanup<H>>), { crate::cfg::MAX_TASKS }> =
            self.timeouts.drain_expired(tok, now_us).collect();
        for (id, cleanup) in expired {
            self.wake_on_timeout(tok, id, cleanup);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{lock_test, MockHal};

    fn tid(i: u16) -> TaskId {
        TaskId::from_index(i as usize)
    }

    #[test]
    fn drains_in_deadline_order_regardless_of_insertion_order() {
        let _g = lock_test();
        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let engine: TimeoutEngine<MockHal> = TimeoutEngine::new();

        engine.start(tok, tid(2), 300, None);
        engine.start(tok, tid(0), 100, None);
        engine.start(tok, tid(1), 200, None);

        let expired: Vec<TaskId> = engine.drain_expired(tok, 250).map(|(id, _)| id).collect();
        assert_eq!(expired, vec![tid(0), tid(1)]);

        let rest: Vec<TaskId> = engine.drain_expired(tok, 1000).map(|(id, _)| id).collect();
        assert_eq!(rest, vec![tid(2)]);
    }

    #[test]
    fn cancel_is_idempotent_and_removes_from_list() {
        let _g = lock_test();
        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let engine: TimeoutEngine<MockHal> = TimeoutEngine::new();

        let id = engine.start(tok, tid(0), 100, None).unwrap();
        engine.start(tok, tid(1), 200, None);

        engine.cancel(tok, id);
        engine.cancel(tok, id); // second cancel: no-op, must not panic or double-count

        let expired: Vec<TaskId> = engine.drain_expired(tok, 1000).map(|(id, _)| id).collect();
        assert_eq!(expired, vec![tid(1)]);
    }

    #[test]
    fn exhausting_the_pool_returns_none() {
        let _g = lock_test();
        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let engine: TimeoutEngine<MockHal> = TimeoutEngine::new();

        for i in 0..crate::cfg::MAX_TASKS {
            assert!(engine.start(tok, tid(i as u16), i as u64, None).is_some());
        }
        assert!(engine.start(tok, tid(0), 0, None).is_none());
    }
}
