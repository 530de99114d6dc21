//! C3: the blocking/wait-queue engine shared by every synchronization
//! primitive in [`crate::mutex`], [`crate::semaphore`], [`crate::queue`] and
//! [`crate::event`].
//!
//! Grounded in `r3_kernel::wait`, whose `Wait`/`WaitQueue` pair links a
//! waiting task into a pointer-based intrusive list headed by the object
//! being waited on. We keep the same two-piece shape (a queue owned by the
//! primitive, a per-task wait record) but thread it through
//! [`crate::utils::priolist`] over [`crate::task::TaskId`] instead of raw
//! pointers, consistent with the rest of this kernel's arena-indexed
//! approach (Design Notes §9).
use crate::cfg::NUM_CORES;
use crate::error::KernelError;
use crate::hal::{CoreId, Hal};
use crate::klock::CpuLockToken;
use crate::task::{BlockReason, TaskId, TaskRegistry, TaskSt};
use crate::utils::priolist::{PriorityListHead, PriorityListIter};

/// A priority-ordered queue of blocked tasks, owned by a synchronization
/// primitive (mutex, semaphore, queue, event set). Each task may be linked
/// into at most one such queue at a time, sharing the `link_prev`/
/// `link_next` fields also used by the per-core ready queue — a task is
/// never on both simultaneously, since `Blocked` and `Ready` are exclusive
/// states (§3).
pub struct WaitQueue<H: Hal> {
    list: PriorityListHead<H, TaskId>,
}

impl<H: Hal> WaitQueue<H> {
    pub const fn new() -> Self {
        Self {
            list: PriorityListHead::new(),
        }
    }

    pub fn is_empty(&self, tok: &CpuLockToken<H>) -> bool {
        self.list.is_empty(tok)
    }

    pub fn front(&self, tok: &CpuLockToken<H>) -> Option<TaskId> {
        self.list.front(tok)
    }

    /// Unlinks `id` from this queue without waking it. Used by callers that
    /// need to rescan every waiter (`crate::event`'s match predicate) rather
    /// than simply popping the highest-priority one.
    pub fn remove(&self, reg: &TaskRegistry<H>, tok: &CpuLockToken<H>, id: TaskId) {
        self.list.remove(reg, tok, id);
    }

    /// Reinserts `id`, e.g. after `remove` determined it still isn't
    /// satisfied and belongs back on the queue.
    pub fn reinsert(&self, reg: &TaskRegistry<H>, tok: &CpuLockToken<H>, id: TaskId) {
        self.list.insert(reg, tok, id);
    }

    pub fn iter<'a>(
        &'a self,
        reg: &'a TaskRegistry<H>,
        tok: &'a CpuLockToken<H>,
    ) -> PriorityListIter<'a, H, TaskId, TaskRegistry<H>> {
        self.list.iter(reg, tok)
    }
}

impl<H: Hal> crate::Kernel<H> {
    /// Blocks the calling task on `queue` with the given `reason`, releasing
    /// the caller-supplied object lock callback `unlock` at the correct
    /// point (after the task is queued and marked `Blocked`, before the
    /// actual context switch away, matching the teacher's "unlock happens
    /// inside the blocking primitive, never before" rule so no wakeup can be
    /// missed between unlock and enqueue).
    ///
    /// Returns the [`crate::task::TaskCb::wait_result`] recorded by whichever
    /// of [`Self::wake_one`]/[`Self::wake_all`]/the timeout engine ends the
    /// wait.
    pub fn block_on(
        &'static self,
        tok: &CpuLockToken<H>,
        queue: &'static WaitQueue<H>,
        reason: BlockReason,
    ) -> TaskId {
        let core = H::current_core();
        let id = self
            .core(core)
            .running
            .get(tok)
            .expect("block_on called with no running task");

        let task = self.tasks.get(id);
        task.set_state(tok, TaskSt::Blocked);
        task.set_block_reason(tok, Some(reason));
        task.set_current_wait_queue(tok, Some(queue));
        queue.list.insert(&self.tasks, tok, id);
        self.core(core).running.set(tok, None);
        id
    }

    /// Wakes the highest-priority waiter on `queue`, if any, recording
    /// `result` as its wait outcome. Returns the woken task, so callers that
    /// hand off a resource (e.g. mutex ownership, a queue slot) know exactly
    /// which task received it.
    pub fn wake_one(
        &'static self,
        tok: &CpuLockToken<H>,
        queue: &WaitQueue<H>,
        result: Result<(), KernelError>,
    ) -> Option<TaskId> {
        let id = queue.list.pop_front(&self.tasks, tok)?;
        self.finish_wait(tok, id, result);
        Some(id)
    }

    /// Wakes every waiter on `queue` with `result` (§4.7's event-set
    /// "release all matching waiters" and broadcast-style wakeups).
    pub fn wake_all(&'static self, tok: &CpuLockToken<H>, queue: &WaitQueue<H>, result: Result<(), KernelError>) {
        while let Some(id) = queue.list.pop_front(&self.tasks, tok) {
            self.finish_wait(tok, id, result);
        }
    }

    /// Unlinks `id` from whichever queue it's waiting on and wakes it with a
    /// [`crate::error::TimingError::TimedOut`] result; called by the
    /// timeout engine (§4.6) when a wait's deadline elapses before a normal
    /// wakeup. The timeout itself is already being retired by the caller, so
    /// unlike [`Self::finish_wait`] this doesn't cancel it again.
    pub(crate) fn wake_on_timeout(
        &'static self,
        tok: &CpuLockToken<H>,
        id: TaskId,
        cleanup: Option<crate::timeout::TimeoutCleanup<H>>,
    ) {
        let task = self.tasks.get(id);
        if let Some(queue) = task.current_wait_queue(tok) {
            queue.list.remove(&self.tasks, tok, id);
        }
        if let Some((f, arg)) = cleanup {
            f(self, tok, id, arg);
        }
        task.set_current_timeout(tok, None);
        task.set_current_wait_queue(tok, None);
        task.set_wait_result(tok, Err(crate::error::TimingError::TimedOut.into()));
        self.make_ready(tok, id);
    }

    /// Ends a task's wait: cancels any pending timeout, records the result,
    /// and re-queues it onto its core's ready queue. The caller must already
    /// have unlinked `id` from its wait queue (e.g. via `pop_front`).
    pub(crate) fn finish_wait(&'static self, tok: &CpuLockToken<H>, id: TaskId, result: Result<(), KernelError>) {
        let task = self.tasks.get(id);
        if let Some(timeout_id) = task.current_timeout(tok) {
            self.timeout_cancel(tok, timeout_id);
            task.set_current_timeout(tok, None);
        }
        task.set_current_wait_queue(tok, None);
        task.set_wait_result(tok, result);
        self.make_ready(tok, id);
    }

    /// Called by [`crate::task::Kernel::set_task_priority`] for a task found
    /// `Blocked`: re-threads it through whatever [`WaitQueue`] it's
    /// currently linked into (§4.8's "reposition on priority change"),
    /// found via [`crate::task::TaskCb::current_wait_queue`] rather than
    /// requiring the generic scheduler to know which primitive owns it.
    pub(crate) fn reposition_in_wait_queue(&self, tok: &CpuLockToken<H>, id: TaskId) {
        if let Some(queue) = self.tasks.get(id).current_wait_queue(tok) {
            queue.list.remove(&self.tasks, tok, id);
            queue.list.insert(&self.tasks, tok, id);
        }
    }

    /// Idle-task loop body: parks the calling core until its ready queue is
    /// nonempty, feeding the watchdog each pass (§4.11, §6's Health API
    /// "idle task cooperates with watchdog").
    pub fn idle_loop(&'static self) -> ! {
        loop {
            H::feed_watchdog();
            self.check_preemption(H::current_core());
        }
    }
}

const _: () = assert!(NUM_CORES <= 2, "CoreId only models two cores");
