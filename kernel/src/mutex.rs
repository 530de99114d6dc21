//! C7: priority-inheritance mutexes.
//!
//! Grounded in `r3_kernel::mutex`'s lock/unlock state machine and its
//! per-task "list of mutexes currently held" used to undo a boost on
//! release, but the inheritance protocol itself differs: the teacher
//! implements priority *ceiling* (a mutex's ceiling is fixed at creation);
//! this kernel implements priority *inheritance* (a mutex's contributed
//! ceiling tracks the priority of whichever task is presently blocked on
//! it), per §4.7. Non-transitive by design (Open Question, resolved below):
//! a task inherits only from the tasks directly waiting on mutexes *it*
//! holds, not from tasks waiting transitively through a chain of mutexes
//! held by other tasks. A full transitive chase is the textbook extension
//! but adds unbounded-depth inheritance propagation for a case (nested lock
//! chains across more than two tasks) this kernel's target workloads don't
//! exhibit; document the simplification rather than implement it, and keep
//! it applied consistently everywhere effective priority is derived.
use crate::error::{KernelError, ParameterError, StateError};
use crate::hal::Hal;
use crate::klock::{CpuLockToken, KCell};
use crate::task::{BlockReason, TaskId};
use crate::timeout::{TIMEOUT_IMMEDIATE, TIMEOUT_INFINITE};
use crate::wait::WaitQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexHandle(u16);

struct MutexCb<H: Hal> {
    in_use: KCell<H, bool>,
    owner: KCell<H, Option<TaskId>>,
    lock_depth: KCell<H, u32>,
    /// Ceiling this mutex currently contributes to its owner's effective
    /// priority: the best (numerically lowest) base priority among tasks
    /// presently waiting on it, or `None` if nobody is waiting.
    contributed_ceiling: KCell<H, Option<u8>>,
    /// Next mutex in the owning task's `held_mutexes` list
    /// (`TaskCb::held_mutexes_head`).
    owned_link_next: KCell<H, Option<u16>>,
    waiters: WaitQueue<H>,
}

impl<H: Hal> MutexCb<H> {
    const fn vacant() -> Self {
        Self {
            in_use: KCell::new(false),
            owner: KCell::new(None),
            lock_depth: KCell::new(0),
            contributed_ceiling: KCell::new(None),
            owned_link_next: KCell::new(None),
            waiters: WaitQueue::new(),
        }
    }
}

pub struct MutexPool<H: Hal> {
    slots: [MutexCb<H>; crate::cfg::MAX_MUTEXES],
}

impl<H: Hal> MutexPool<H> {
    pub const fn new() -> Self {
        Self {
            slots: [const { MutexCb::vacant() }; crate::cfg::MAX_MUTEXES],
        }
    }
}

/// Derives the effective priority a task should have right now: the best
/// (numerically lowest) of its own `new_base_priority` and the ceilings
/// contributed by every mutex it currently holds (§4.7). Called both from
/// [`crate::task::Kernel::set_task_priority`] (a base-priority change) and
/// from this module's own lock/unlock paths (a waiter set change).
pub(crate) fn recompute_effective_priority<H: Hal>(
    kernel: &'static crate::Kernel<H>,
    tok: &CpuLockToken<H>,
    id: TaskId,
    new_base_priority: u8,
) -> u8 {
    let mut best = new_base_priority;
    let mut cursor = kernel.tasks.get(id).held_mutexes_head(tok);
    while let Some(idx) = cursor {
        let mtx = &kernel.mutexes.slots[idx as usize];
        if let Some(ceiling) = mtx.contributed_ceiling.get(tok) {
            if ceiling < best {
                best = ceiling;
            }
        }
        cursor = mtx.owned_link_next.get(tok);
    }
    best
}

/// Timeout-expiry cleanup for a task that was blocked on a mutex's wait
/// queue: recomputes the ceiling that mutex contributes now that the
/// timed-out task is no longer one of its waiters, and propagates the
/// change to the owner's effective priority (§4.6, §4.7). Installed as a
/// [`crate::timeout::TimeoutCleanup`] by [`crate::Kernel::mutex_lock`], with
/// `mutex_idx` carried as the opaque arg. Runs after the timed-out task has
/// already been unlinked from `mtx.waiters`, so `front` reflects whoever is
/// left.
fn undo_pi_on_timeout<H: Hal>(
    kernel: &'static crate::Kernel<H>,
    tok: &CpuLockToken<H>,
    _task: TaskId,
    mutex_idx: usize,
) {
    let mtx = &kernel.mutexes.slots[mutex_idx];
    let Some(owner) = mtx.owner.get(tok) else {
        return;
    };
    let new_ceiling = mtx.waiters.front(tok).map(|w| kernel.tasks.get(w).base_priority(tok));
    mtx.contributed_ceiling.set(tok, new_ceiling);
    let new_eff = recompute_effective_priority(kernel, tok, owner, kernel.tasks.get(owner).base_priority(tok));
    kernel.tasks.get(owner).set_effective_priority(tok, new_eff);
    if kernel.tasks.get(owner).state(tok) == crate::task::TaskSt::Ready {
        let owner_core = kernel.tasks.get(owner).assigned_core(tok);
        kernel.core(owner_core).ready.remove(&kernel.tasks, tok, owner);
        kernel.core(owner_core).ready.push(&kernel.tasks, tok, owner);
    } else if kernel.tasks.get(owner).state(tok) == crate::task::TaskSt::Blocked {
        kernel.reposition_in_wait_queue(tok, owner);
    }
}

impl<H: Hal> crate::Kernel<H> {
    pub fn mutex_create(&self) -> Result<MutexHandle, KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self
            .mutexes
            .slots
            .iter()
            .position(|m| !m.in_use.get(tok))
            .ok_or(KernelError::from(crate::error::ResourceError::NoFreeObjectSlot))?;
        let mtx = &self.mutexes.slots[idx];
        mtx.in_use.set(tok, true);
        mtx.owner.set(tok, None);
        mtx.lock_depth.set(tok, 0);
        mtx.contributed_ceiling.set(tok, None);
        mtx.owned_link_next.set(tok, None);
        Ok(MutexHandle(idx as u16))
    }

    pub fn mutex_delete(&self, handle: MutexHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let mtx = self.mutex(tok, handle)?;
        if mtx.owner.get(tok).is_some() {
            return Err(StateError::AlreadyLocked.into());
        }
        mtx.in_use.set(tok, false);
        Ok(())
    }

    /// Locks `handle`, recursively if the calling task already owns it,
    /// blocking up to `timeout_ms` otherwise. [`TIMEOUT_IMMEDIATE`] never
    /// blocks; [`TIMEOUT_INFINITE`] blocks forever (§6).
    pub fn mutex_lock(&'static self, handle: MutexHandle, timeout_ms: u32) -> Result<(), KernelError> {
        loop {
            let guard = crate::klock::lock_cpu::<H>();
            let tok = guard.token();
            let idx = self.mutex_index(tok, handle)?;
            let mtx = &self.mutexes.slots[idx];
            let core = H::current_core();
            let caller = self
                .core(core)
                .running
                .get(tok)
                .expect("mutex_lock called with no running task");

            match mtx.owner.get(tok) {
                None => {
                    self.mutex_assign(tok, idx, caller);
                    return Ok(());
                }
                Some(owner) if owner == caller => {
                    *mtx.lock_depth.write(tok) += 1;
                    return Ok(());
                }
                Some(owner) => {
                    if timeout_ms == TIMEOUT_IMMEDIATE {
                        return Err(crate::error::TimingError::TimedOut.into());
                    }
                    // Priority inheritance: the owner's effective priority
                    // rises to at least the blocking task's, non-
                    // transitively — we only touch `owner` here, never
                    // whatever `owner` might itself be blocked on.
                    let caller_prio = self.tasks.get(caller).base_priority(tok).min(self.tasks.get(caller).effective_priority(tok));
                    let cur_ceiling = mtx.contributed_ceiling.get(tok);
                    if cur_ceiling.is_none_or(|c| caller_prio < c) {
                        mtx.contributed_ceiling.set(tok, Some(caller_prio));
                        let new_eff = recompute_effective_priority(self, tok, owner, self.tasks.get(owner).base_priority(tok));
                        self.tasks.get(owner).set_effective_priority(tok, new_eff);
                        if self.tasks.get(owner).state(tok) == crate::task::TaskSt::Ready {
                            let owner_core = self.tasks.get(owner).assigned_core(tok);
                            self.core(owner_core).ready.remove(&self.tasks, tok, owner);
                            self.core(owner_core).ready.push(&self.tasks, tok, owner);
                        } else if self.tasks.get(owner).state(tok) == crate::task::TaskSt::Blocked {
                            self.reposition_in_wait_queue(tok, owner);
                        }
                    }

                    if timeout_ms != TIMEOUT_INFINITE {
                        self.timeout_arm(tok, caller, timeout_ms, Some((undo_pi_on_timeout::<H>, idx)));
                    }
                    self.block_on(tok, &mtx.waiters, BlockReason::Mutex);
                    drop(guard);
                    self.check_preemption(H::current_core());

                    let guard2 = crate::klock::lock_cpu::<H>();
                    let tok2 = guard2.token();
                    let result = self.tasks.get(caller).wait_result(tok2);
                    drop(guard2);
                    match result {
                        Ok(()) => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    pub fn mutex_try_lock(&'static self, handle: MutexHandle) -> Result<(), KernelError> {
        self.mutex_lock(handle, TIMEOUT_IMMEDIATE)
    }

    /// Unlocks `handle`. Errors with [`StateError::NotLockOwner`] if the
    /// caller doesn't hold it (§4.7's strict-ownership rule — unlike POSIX,
    /// there's no "unlock anyone's mutex").
    pub fn mutex_unlock(&'static self, handle: MutexHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self.mutex_index(tok, handle)?;
        let mtx = &self.mutexes.slots[idx];
        let core = H::current_core();
        let caller = self
            .core(core)
            .running
            .get(tok)
            .expect("mutex_unlock called with no running task");

        match mtx.owner.get(tok) {
            Some(owner) if owner == caller => {}
            _ => return Err(StateError::NotLockOwner.into()),
        }

        let depth = mtx.lock_depth.get(tok);
        if depth > 0 {
            mtx.lock_depth.set(tok, depth - 1);
            return Ok(());
        }

        self.mutex_unassign(tok, idx, caller);

        let eff = recompute_effective_priority(self, tok, caller, self.tasks.get(caller).base_priority(tok));
        self.tasks.get(caller).set_effective_priority(tok, eff);

        mtx.contributed_ceiling.set(tok, None);
        if let Some(next) = self.wake_one(tok, &mtx.waiters, Ok(())) {
            self.mutex_assign(tok, idx, next);
            // Hand the ceiling on to whichever task (if any) is still
            // waiting behind `next`, mirroring the priority this mutex
            // contributed to the previous owner.
            if let Some(still_waiting) = mtx.waiters.front(tok) {
                let ceiling = self.tasks.get(still_waiting).base_priority(tok);
                mtx.contributed_ceiling.set(tok, Some(ceiling));
                let new_eff = recompute_effective_priority(self, tok, next, self.tasks.get(next).base_priority(tok));
                self.tasks.get(next).set_effective_priority(tok, new_eff);
            }
        }

        drop(guard);
        self.check_preemption(core);
        Ok(())
    }

    fn mutex_assign(&self, tok: &CpuLockToken<H>, idx: usize, owner: TaskId) {
        let mtx = &self.mutexes.slots[idx];
        mtx.owner.set(tok, Some(owner));
        mtx.lock_depth.set(tok, 0);
        let task = self.tasks.get(owner);
        mtx.owned_link_next.set(tok, task.held_mutexes_head(tok));
        task.set_held_mutexes_head(tok, Some(idx as u16));
    }

    fn mutex_unassign(&self, tok: &CpuLockToken<H>, idx: usize, owner: TaskId) {
        let task = self.tasks.get(owner);
        let mut cursor = task.held_mutexes_head(tok);
        let mut prev: Option<usize> = None;
        while let Some(cur) = cursor {
            if cur as usize == idx {
                let next = self.mutexes.slots[cur as usize].owned_link_next.get(tok);
                match prev {
                    Some(p) => self.mutexes.slots[p].owned_link_next.set(tok, next),
                    None => task.set_held_mutexes_head(tok, next),
                }
                break;
            }
            prev = Some(cur as usize);
            cursor = self.mutexes.slots[cur as usize].owned_link_next.get(tok);
        }
        self.mutexes.slots[idx].owner.set(tok, None);
    }

    fn mutex_index(&self, tok: &CpuLockToken<H>, handle: MutexHandle) -> Result<usize, KernelError> {
        let idx = handle.0 as usize;
        if self.mutexes.slots[idx].in_use.get(tok) {
            Ok(idx)
        } else {
            Err(ParameterError::UnknownObjectId.into())
        }
    }

    fn mutex(&self, tok: &CpuLockToken<H>, handle: MutexHandle) -> Result<&MutexCb<H>, KernelError> {
        let idx = self.mutex_index(tok, handle)?;
        Ok(&self.mutexes.slots[idx])
    }
}

// These tests stick to paths that never reach `block_on`: `MockHal::context_switch`
// is a no-op, so a real block/unblock round trip can't be driven from a single
// test thread (the "blocked" task never actually yields its call stack). See
// `crate::test_support` and `DESIGN.md`.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Affinity;
    use crate::test_support::{lock_test, task_attr, MockHal};

    fn new_kernel() -> &'static crate::Kernel<MockHal> {
        Box::leak(Box::new(crate::Kernel::new(crate::cfg::KernelConfig::default())))
    }

    #[test]
    fn create_then_uncontested_lock_unlock_round_trips() {
        let _g = lock_test();
        let kernel = new_kernel();

        let t = kernel.create_task(task_attr("a", 10, Affinity::Core0)).unwrap();
        kernel.activate_task(t).unwrap();

        let m = kernel.mutex_create().unwrap();
        kernel.mutex_lock(m, TIMEOUT_INFINITE).unwrap();
        kernel.mutex_unlock(m).unwrap();
    }

    #[test]
    fn recursive_lock_requires_matching_number_of_unlocks() {
        let _g = lock_test();
        let kernel = new_kernel();

        let t = kernel.create_task(task_attr("a", 10, Affinity::Core0)).unwrap();
        kernel.activate_task(t).unwrap();

        let m = kernel.mutex_create().unwrap();
        kernel.mutex_lock(m, TIMEOUT_INFINITE).unwrap();
        kernel.mutex_lock(m, TIMEOUT_INFINITE).unwrap();
        kernel.mutex_lock(m, TIMEOUT_INFINITE).unwrap();

        // Three unlocks drain the three locks (the first two just decrement
        // `lock_depth`; the third actually releases ownership). A fourth
        // unlock has nothing left to release and must fail.
        kernel.mutex_unlock(m).unwrap();
        kernel.mutex_unlock(m).unwrap();
        kernel.mutex_unlock(m).unwrap();
        assert!(matches!(kernel.mutex_unlock(m), Err(_)));
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        let _g = lock_test();
        let kernel = new_kernel();

        let owner = kernel.create_task(task_attr("owner", 10, Affinity::Core0)).unwrap();
        kernel.activate_task(owner).unwrap();

        let m = kernel.mutex_create().unwrap();
        kernel.mutex_lock(m, TIMEOUT_INFINITE).unwrap();

        // A second, higher-priority task preempts `owner` and becomes the
        // core's running task without ever touching `m`.
        let other = kernel.create_task(task_attr("other", 1, Affinity::Core0)).unwrap();
        kernel.activate_task(other).unwrap();

        assert!(matches!(kernel.mutex_unlock(m), Err(_)));
    }

    #[test]
    fn try_lock_on_an_already_owned_mutex_times_out_immediately() {
        let _g = lock_test();
        let kernel = new_kernel();

        let owner = kernel.create_task(task_attr("owner", 20, Affinity::Core0)).unwrap();
        kernel.activate_task(owner).unwrap();

        let m = kernel.mutex_create().unwrap();
        kernel.mutex_lock(m, TIMEOUT_INFINITE).unwrap();

        // Higher-priority task preempts and becomes the running task; it is
        // not the owner, so `mutex_try_lock` must report `TimedOut` rather
        // than block (`TIMEOUT_IMMEDIATE` never reaches `block_on`).
        let other = kernel.create_task(task_attr("other", 1, Affinity::Core0)).unwrap();
        kernel.activate_task(other).unwrap();

        assert!(matches!(kernel.mutex_try_lock(m), Err(_)));
    }

    #[test]
    fn delete_while_still_owned_is_rejected() {
        let _g = lock_test();
        let kernel = new_kernel();

        let t = kernel.create_task(task_attr("a", 10, Affinity::Core0)).unwrap();
        kernel.activate_task(t).unwrap();

        let m = kernel.mutex_create().unwrap();
        kernel.mutex_lock(m, TIMEOUT_INFINITE).unwrap();
        assert!(matches!(kernel.mutex_delete(m), Err(_)));

        kernel.mutex_unlock(m).unwrap();
        assert!(kernel.mutex_delete(m).is_ok());
    }

    #[test]
    fn recompute_effective_priority_takes_best_ceiling_among_held_mutexes() {
        let _g = lock_test();
        let kernel = new_kernel();

        let t = kernel.create_task(task_attr("a", 15, Affinity::Core0)).unwrap();
        kernel.activate_task(t).unwrap();

        let m1 = kernel.mutex_create().unwrap();
        let m2 = kernel.mutex_create().unwrap();
        kernel.mutex_lock(m1, TIMEOUT_INFINITE).unwrap();
        kernel.mutex_lock(m2, TIMEOUT_INFINITE).unwrap();

        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let id = kernel.tasks.resolve(t, tok).unwrap();
        kernel.mutexes.slots[m1.0 as usize].contributed_ceiling.set(tok, Some(10));
        kernel.mutexes.slots[m2.0 as usize].contributed_ceiling.set(tok, Some(3));

        let eff = recompute_effective_priority(kernel, tok, id, 15);
        assert_eq!(eff, 3);
    }

    #[test]
    fn recompute_effective_priority_ignores_unheld_mutexes() {
        let _g = lock_test();
        let kernel = new_kernel();

        let t = kernel.create_task(task_attr("a", 15, Affinity::Core0)).unwrap();
        kernel.activate_task(t).unwrap();

        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let id = kernel.tasks.resolve(t, tok).unwrap();
        assert_eq!(recompute_effective_priority(kernel, tok, id, 15), 15);
    }
}
