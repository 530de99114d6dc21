//! C8 (scheduler core) and the task registry it schedules.
//!
//! Grounded in `r3_kernel::task`, with two deliberate departures: tasks are
//! addressed by an index into a fixed arena (`TaskId`) rather than a
//! `NonNull<TaskCb>`, per Design Notes §9, and every object lives behind a
//! [`KCell`] rather than `tokenlock`'s `CpuLockCell`.
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::cfg::{MAX_TASKS, NUM_CORES, NUM_PRIORITIES};
use crate::error::{KernelError, ParameterError, ResourceError, StateError};
use crate::hal::{CoreId, Hal};
use crate::klock::{CpuLockToken, KCell};
use crate::utils::prio_bitmap::PrioBitmap;
use crate::utils::priolist::{PriorityListHead, PriorityListOps};

/// An index into the fixed task arena. Not exposed to applications directly;
/// see [`TaskHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(u16);

impl TaskId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn from_index(i: usize) -> Self {
        TaskId(i as u16)
    }
}

/// A stable, application-facing reference to a task. Carries the slot's
/// creation [`TaskId::generation`] so a handle obtained before a `delete`
/// cannot silently alias a later, unrelated task created in the same slot
/// (§3's "stable identity", made concrete).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    id: TaskId,
    generation: u16,
}

/// Runtime lifecycle state (§3's Task states plus `Dormant`, the
/// not-yet-activated state every task starts and can return to).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    Dormant,
    Ready,
    Running,
    Blocked,
    /// Held off the ready/wait queues by at least one outstanding
    /// `task_suspend` (§3). A task can be suspended while `Ready`,
    /// `Running`, or `Blocked`; in the last case it stays linked on its wait
    /// queue and only the eventual unblock is redirected here instead of to
    /// `Ready` (see `Kernel::make_ready`).
    Suspended,
    Terminated,
}

/// Why a `Blocked` task is blocked. Carried alongside `TaskSt::Blocked`
/// rather than folded into it, since the wait queue and timeout engine need
/// to know which kind of wait to undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Delay,
    Semaphore,
    Mutex,
    Queue,
    EventSet,
    MemoryPool,
    Join,
}

/// Which core(s) a task may run on (§4.9's SMP placement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Core0,
    Core1,
    Any,
}

impl Affinity {
    pub fn allows(self, core: CoreId) -> bool {
        match self {
            Affinity::Core0 => core == CoreId::Core0,
            Affinity::Core1 => core == CoreId::Core1,
            Affinity::Any => true,
        }
    }
}

/// Parameters for [`crate::Kernel::create_task`].
pub struct TaskAttr {
    pub name: &'static str,
    pub entry: fn(usize),
    pub entry_param: usize,
    /// Raw, statically-allocated stack region. The caller (application code,
    /// usually via a macro reserving a `static mut` array) asserts this
    /// region is not aliased elsewhere.
    pub stack_base: *mut u8,
    pub stack_size: usize,
    pub base_priority: u8,
    pub affinity: Affinity,
}

// Safety: `TaskAttr` is only read during `create_task`, under CPU Lock, and
// the raw pointer it carries is asserted unaliased by the caller.
unsafe impl Send for TaskAttr {}

/// The saved-context slice a port's [`Hal::context_switch`]/
/// [`Hal::prepare_task_stack`] read and write directly. Not behind a
/// [`KCell`]: the assembly on the other side of `Hal` can't take a Rust
/// critical-section token, so this is a plain cell guarded instead by the
/// invariant that only the currently-scheduling core ever touches a given
/// task's `port_state`, and only while CPU Lock is held on that core.
pub struct PortTaskState {
    pub sp: core::cell::UnsafeCell<usize>,
}

// Safety: see the type's doc comment.
unsafe impl Sync for PortTaskState {}

impl PortTaskState {
    const fn new() -> Self {
        Self {
            sp: core::cell::UnsafeCell::new(0),
        }
    }
}

/// One slot of the fixed task arena.
pub struct TaskCb<H: Hal> {
    in_use: KCell<H, bool>,
    generation: KCell<H, u16>,
    name: KCell<H, &'static str>,
    entry: KCell<H, fn(usize)>,
    entry_param: KCell<H, usize>,
    stack_base: KCell<H, *mut u8>,
    stack_size: KCell<H, usize>,
    pub port_state: PortTaskState,

    state: KCell<H, TaskSt>,
    suspend_count: KCell<H, u8>,
    base_priority: KCell<H, u8>,
    effective_priority: KCell<H, u8>,
    block_reason: KCell<H, Option<BlockReason>>,
    affinity: KCell<H, Affinity>,
    assigned_core: KCell<H, CoreId>,

    link_prev: KCell<H, Option<TaskId>>,
    link_next: KCell<H, Option<TaskId>>,

    wait_result: KCell<H, Result<(), KernelError>>,
    current_timeout: KCell<H, Option<u16>>,
    /// The queue this task is linked into while `Blocked`, so a priority
    /// change can reposition it without the generic scheduler needing to
    /// know which primitive owns the queue (`crate::wait`).
    current_wait_queue: KCell<H, Option<&'static crate::wait::WaitQueue<H>>>,
    /// Head of this task's list of currently-owned mutexes, threaded through
    /// `crate::mutex::MutexCb::owned_link_next`; used to undo priority
    /// inheritance on abnormal task termination (§4.7).
    held_mutexes: KCell<H, Option<u16>>,
    /// Match predicate for a pending `crate::event::event_set_wait`, carried
    /// on the task (rather than in the event set's wait queue entries) so
    /// the generic [`crate::wait::WaitQueue`] doesn't need an event-set-
    /// specific payload. `None` whenever this task isn't blocked on an
    /// event set.
    pending_event_wait: KCell<H, Option<PendingEventWait>>,
    /// Bits observed at the moment a pending event wait was satisfied,
    /// valid once `wait_result` is `Ok(())` and `block_reason` was
    /// `EventSet`.
    event_wait_observed: KCell<H, u32>,

    #[cfg(feature = "runtime_stats")]
    cpu_time_us: KCell<H, u64>,
    #[cfg(feature = "runtime_stats")]
    switch_count: KCell<H, u32>,
    migration_count: KCell<H, u32>,
    time_slice_remaining: KCell<H, u32>,
}

impl<H: Hal> TaskCb<H> {
    const fn vacant() -> Self {
        Self {
            in_use: KCell::new(false),
            generation: KCell::new(0),
            name: KCell::new(""),
            entry: KCell::new(noop_entry),
            entry_param: KCell::new(0),
            stack_base: KCell::new(core::ptr::null_mut()),
            stack_size: KCell::new(0),
            port_state: PortTaskState::new(),
            state: KCell::new(TaskSt::Dormant),
            suspend_count: KCell::new(0),
            base_priority: KCell::new(0),
            effective_priority: KCell::new(0),
            block_reason: KCell::new(None),
            affinity: KCell::new(Affinity::Any),
            assigned_core: KCell::new(CoreId::Core0),
            link_prev: KCell::new(None),
            link_next: KCell::new(None),
            wait_result: KCell::new(Ok(())),
            current_timeout: KCell::new(None),
            current_wait_queue: KCell::new(None),
            held_mutexes: KCell::new(None),
            pending_event_wait: KCell::new(None),
            event_wait_observed: KCell::new(0),
            #[cfg(feature = "runtime_stats")]
            cpu_time_us: KCell::new(0),
            #[cfg(feature = "runtime_stats")]
            switch_count: KCell::new(0),
            migration_count: KCell::new(0),
            time_slice_remaining: KCell::new(0),
        }
    }

    pub fn state(&self, tok: &CpuLockToken<H>) -> TaskSt {
        *self.state.read(tok)
    }

    pub fn effective_priority(&self, tok: &CpuLockToken<H>) -> u8 {
        self.effective_priority.get(tok)
    }

    pub fn base_priority(&self, tok: &CpuLockToken<H>) -> u8 {
        self.base_priority.get(tok)
    }

    pub fn name(&self, tok: &CpuLockToken<H>) -> &'static str {
        self.name.get(tok)
    }

    /// The task's entry function, read by a port's `prepare_task_stack`.
    pub fn entry(&self, tok: &CpuLockToken<H>) -> fn(usize) {
        self.entry.get(tok)
    }

    pub fn entry_param(&self, tok: &CpuLockToken<H>) -> usize {
        self.entry_param.get(tok)
    }

    pub fn stack_base(&self, tok: &CpuLockToken<H>) -> *mut u8 {
        self.stack_base.get(tok)
    }

    pub fn stack_size(&self, tok: &CpuLockToken<H>) -> usize {
        self.stack_size.get(tok)
    }

    pub fn assigned_core(&self, tok: &CpuLockToken<H>) -> CoreId {
        self.assigned_core.get(tok)
    }

    pub fn set_assigned_core(&self, tok: &CpuLockToken<H>, core: CoreId) {
        self.assigned_core.set(tok, core);
    }

    pub fn affinity(&self, tok: &CpuLockToken<H>) -> Affinity {
        self.affinity.get(tok)
    }

    pub fn set_affinity_value(&self, tok: &CpuLockToken<H>, affinity: Affinity) {
        self.affinity.set(tok, affinity);
    }

    pub fn migration_count(&self, tok: &CpuLockToken<H>) -> u32 {
        self.migration_count.get(tok)
    }

    pub fn record_migration(&self, tok: &CpuLockToken<H>) {
        *self.migration_count.write(tok) += 1;
    }

    pub fn block_reason(&self, tok: &CpuLockToken<H>) -> Option<BlockReason> {
        self.block_reason.get(tok)
    }

    pub fn held_mutexes_head(&self, tok: &CpuLockToken<H>) -> Option<u16> {
        self.held_mutexes.get(tok)
    }

    pub fn set_held_mutexes_head(&self, tok: &CpuLockToken<H>, v: Option<u16>) {
        self.held_mutexes.set(tok, v);
    }

    pub fn current_timeout(&self, tok: &CpuLockToken<H>) -> Option<u16> {
        self.current_timeout.get(tok)
    }

    pub fn set_current_timeout(&self, tok: &CpuLockToken<H>, v: Option<u16>) {
        self.current_timeout.set(tok, v);
    }

    pub fn current_wait_queue(&self, tok: &CpuLockToken<H>) -> Option<&'static crate::wait::WaitQueue<H>> {
        self.current_wait_queue.get(tok)
    }

    pub fn set_current_wait_queue(&self, tok: &CpuLockToken<H>, v: Option<&'static crate::wait::WaitQueue<H>>) {
        self.current_wait_queue.set(tok, v);
    }

    pub fn wait_result(&self, tok: &CpuLockToken<H>) -> Result<(), KernelError> {
        self.wait_result.get(tok)
    }

    pub fn set_wait_result(&self, tok: &CpuLockToken<H>, v: Result<(), KernelError>) {
        self.wait_result.set(tok, v);
    }

    pub fn set_block_reason(&self, tok: &CpuLockToken<H>, v: Option<BlockReason>) {
        self.block_reason.set(tok, v);
    }

    pub fn pending_event_wait(&self, tok: &CpuLockToken<H>) -> Option<PendingEventWait> {
        self.pending_event_wait.get(tok)
    }

    pub fn set_pending_event_wait(&self, tok: &CpuLockToken<H>, v: Option<PendingEventWait>) {
        self.pending_event_wait.set(tok, v);
    }

    pub fn event_wait_observed(&self, tok: &CpuLockToken<H>) -> u32 {
        self.event_wait_observed.get(tok)
    }

    pub fn set_event_wait_observed(&self, tok: &CpuLockToken<H>, v: u32) {
        self.event_wait_observed.set(tok, v);
    }

    pub fn set_state(&self, tok: &CpuLockToken<H>, st: TaskSt) {
        self.state.set(tok, st);
    }

    pub fn suspend_count(&self, tok: &CpuLockToken<H>) -> u8 {
        self.suspend_count.get(tok)
    }

    /// Recomputes effective priority as the max (numerically *lowest*, i.e.
    /// most urgent) of base priority and whatever priority inheritance
    /// contributes; see `crate::mutex`. Returns the previous value so
    /// callers can tell whether a reschedule is warranted.
    pub fn set_effective_priority(&self, tok: &CpuLockToken<H>, prio: u8) -> u8 {
        self.effective_priority.replace(tok, prio)
    }

    #[cfg(feature = "runtime_stats")]
    pub fn record_run_time(&self, tok: &CpuLockToken<H>, delta_us: u64) {
        *self.cpu_time_us.write(tok) += delta_us;
        *self.switch_count.write(tok) += 1;
    }

    #[cfg(feature = "runtime_stats")]
    pub fn cpu_time_us(&self, tok: &CpuLockToken<H>) -> u64 {
        self.cpu_time_us.get(tok)
    }
}

// Safety: `stack_base` is a raw pointer (not `Send`, so the blanket `KCell`
// `Sync` impl doesn't cover it) but is only ever read/written while holding
// `CpuLockToken`, same justification as `mempool::MemPoolCb`'s `free_head`.
unsafe impl<H: Hal> Sync for TaskCb<H> {}

fn noop_entry(_: usize) {}

/// See [`TaskCb::pending_event_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEventWait {
    pub mask: u32,
    pub require_all: bool,
    pub clear_on_exit: bool,
}

/// The fixed arena of every task the kernel knows about, plus the
/// allocation bitmap and [`PriorityListOps`] glue shared by ready queues and
/// wait queues.
pub struct TaskRegistry<H: Hal> {
    slots: [TaskCb<H>; MAX_TASKS],
    next_free_hint: AtomicUsize,
}

impl<H: Hal> TaskRegistry<H> {
    pub const fn new() -> Self {
        Self {
            slots: [const { TaskCb::vacant() }; MAX_TASKS],
            next_free_hint: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, id: TaskId) -> &TaskCb<H> {
        &self.slots[id.index()]
    }

    pub fn handle_of(&self, id: TaskId, tok: &CpuLockToken<H>) -> TaskHandle {
        TaskHandle {
            id,
            generation: self.get(id).generation.get(tok),
        }
    }

    /// Resolves a [`TaskHandle`] back to its [`TaskId`], rejecting stale
    /// handles whose generation no longer matches the slot (the slot was
    /// deleted and possibly reused since the handle was obtained).
    pub fn resolve(&self, handle: TaskHandle, tok: &CpuLockToken<H>) -> Result<TaskId, KernelError> {
        let slot = self.get(handle.id);
        if slot.in_use.get(tok) && slot.generation.get(tok) == handle.generation {
            Ok(handle.id)
        } else {
            Err(ParameterError::UnknownTaskId.into())
        }
    }

    /// Allocates a fresh slot and initializes it from `attr`. Does not place
    /// the task on any ready queue; the caller (`Kernel::create_task`) does
    /// that only after the slot is fully initialized.
    pub fn create(&self, tok: &CpuLockToken<H>, attr: &TaskAttr) -> Result<TaskId, KernelError> {
        if attr.base_priority as usize >= NUM_PRIORITIES {
            return Err(ParameterError::BadPriority.into());
        }
        let start = self.next_free_hint.load(Ordering::Relaxed);
        for offset in 0..MAX_TASKS {
            let i = (start + offset) % MAX_TASKS;
            let slot = &self.slots[i];
            if !slot.in_use.get(tok) {
                slot.in_use.set(tok, true);
                let gen = slot.generation.get(tok).wrapping_add(1);
                slot.generation.set(tok, gen);
                slot.name.set(tok, attr.name);
                slot.entry.set(tok, attr.entry);
                slot.entry_param.set(tok, attr.entry_param);
                slot.stack_base.set(tok, attr.stack_base);
                slot.stack_size.set(tok, attr.stack_size);
                slot.state.set(tok, TaskSt::Dormant);
                slot.suspend_count.set(tok, 0);
                slot.base_priority.set(tok, attr.base_priority);
                slot.effective_priority.set(tok, attr.base_priority);
                slot.block_reason.set(tok, None);
                slot.affinity.set(tok, attr.affinity);
                slot.assigned_core.set(
                    tok,
                    match attr.affinity {
                        Affinity::Core1 => CoreId::Core1,
                        _ => CoreId::Core0,
                    },
                );
                slot.link_prev.set(tok, None);
                slot.link_next.set(tok, None);
                slot.wait_result.set(tok, Ok(()));
                slot.current_timeout.set(tok, None);
                slot.current_wait_queue.set(tok, None);
                slot.held_mutexes.set(tok, None);
                slot.pending_event_wait.set(tok, None);
                slot.event_wait_observed.set(tok, 0);
                slot.time_slice_remaining.set(tok, 0);
                #[cfg(feature = "runtime_stats")]
                {
                    slot.cpu_time_us.set(tok, 0);
                    slot.switch_count.set(tok, 0);
                }
                self.next_free_hint.store((i + 1) % MAX_TASKS, Ordering::Relaxed);
                return Ok(TaskId::from_index(i));
            }
        }
        Err(ResourceError::NoFreeTaskSlot.into())
    }

    pub fn delete(&self, tok: &CpuLockToken<H>, id: TaskId) -> Result<(), KernelError> {
        let slot = self.get(id);
        match slot.state(tok) {
            TaskSt::Dormant | TaskSt::Terminated => {
                slot.in_use.set(tok, false);
                Ok(())
            }
            _ => Err(StateError::TaskStillRunning.into()),
        }
    }
}

impl<H: Hal> PriorityListOps<H, TaskId> for TaskRegistry<H> {
    fn priority_of(&self, id: TaskId, tok: &CpuLockToken<H>) -> u8 {
        self.get(id).effective_priority(tok)
    }

    fn link_prev(&self, id: TaskId, tok: &CpuLockToken<H>) -> Option<TaskId> {
        self.get(id).link_prev.get(tok)
    }

    fn set_link_prev(&self, id: TaskId, tok: &CpuLockToken<H>, v: Option<TaskId>) {
        self.get(id).link_prev.set(tok, v);
    }

    fn link_next(&self, id: TaskId, tok: &CpuLockToken<H>) -> Option<TaskId> {
        self.get(id).link_next.get(tok)
    }

    fn set_link_next(&self, id: TaskId, tok: &CpuLockToken<H>, v: Option<TaskId>) {
        self.get(id).link_next.set(tok, v);
    }
}

/// A per-core ready queue: a [`PriorityListHead`] plus the bitmap that lets
/// `pop_highest` skip straight to the first nonempty level (§4.8).
pub struct ReadyQueue<H: Hal> {
    list: PriorityListHead<H, TaskId>,
    bitmap: KCell<H, PrioBitmap>,
}

impl<H: Hal> ReadyQueue<H> {
    pub const fn new() -> Self {
        Self {
            list: PriorityListHead::new(),
            bitmap: KCell::new(PrioBitmap::new()),
        }
    }

    pub fn push(&self, reg: &TaskRegistry<H>, tok: &CpuLockToken<H>, id: TaskId) {
        self.list.insert(reg, tok, id);
        let prio = reg.priority_of(id, tok);
        self.bitmap.write(tok).set(prio as usize);
    }

    pub fn remove(&self, reg: &TaskRegistry<H>, tok: &CpuLockToken<H>, id: TaskId) {
        self.list.remove(reg, tok, id);
        self.update_bitmap_level(reg, tok, reg.priority_of(id, tok));
    }

    pub fn pop_highest(&self, reg: &TaskRegistry<H>, tok: &CpuLockToken<H>) -> Option<TaskId> {
        let id = self.list.pop_front(reg, tok)?;
        self.update_bitmap_level(reg, tok, reg.priority_of(id, tok));
        Some(id)
    }

    pub fn peek_highest(&self, reg: &TaskRegistry<H>, tok: &CpuLockToken<H>) -> Option<TaskId> {
        self.list.front(tok)
    }

    pub fn is_empty(&self, tok: &CpuLockToken<H>) -> bool {
        self.list.is_empty(tok)
    }

    /// Iterates every task currently on this ready queue, front to back
    /// (highest priority first). Used by the load balancer (`crate::smp`)
    /// to compute average priority and pick migration candidates; never on
    /// a scheduling hot path.
    pub fn iter<'a>(
        &'a self,
        reg: &'a TaskRegistry<H>,
        tok: &'a CpuLockToken<H>,
    ) -> crate::utils::priolist::PriorityListIter<'a, H, TaskId, TaskRegistry<H>> {
        self.list.iter(reg, tok)
    }

    /// Re-derives whether `level` still has a ready task by walking from the
    /// front until priority exceeds `level`; cheap because ready lists stay
    /// short in practice and avoids a per-level counter.
    fn update_bitmap_level(&self, reg: &TaskRegistry<H>, tok: &CpuLockToken<H>, level: u8) {
        let still_present = {
            let mut cursor = self.list.front(tok);
            let mut found = false;
            while let Some(cur) = cursor {
                let p = reg.priority_of(cur, tok);
                if p == level {
                    found = true;
                    break;
                }
                if p > level {
                    break;
                }
                cursor = reg.link_next(cur, tok);
            }
            found
        };
        if still_present {
            self.bitmap.write(tok).set(level as usize);
        } else {
            self.bitmap.write(tok).clear(level as usize);
        }
    }
}

/// Per-core scheduling state: the ready queue and the currently-running
/// task, if any (`None` only while the idle task itself is being chosen for
/// the first time at boot).
pub struct CoreSchedState<H: Hal> {
    pub ready: ReadyQueue<H>,
    pub running: KCell<H, Option<TaskId>>,
}

impl<H: Hal> CoreSchedState<H> {
    pub const fn new() -> Self {
        Self {
            ready: ReadyQueue::new(),
            running: KCell::new(None),
        }
    }
}

impl<H: Hal> crate::Kernel<H> {
    pub fn create_task(&'static self, attr: TaskAttr) -> Result<TaskHandle, KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let id = self.tasks.create(tok, &attr)?;
        Ok(self.tasks.handle_of(id, tok))
    }

    pub fn delete_task(&'static self, handle: TaskHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let id = self.tasks.resolve(handle, tok)?;
        self.tasks.delete(tok, id)
    }

    /// Moves a `Dormant` task to `Ready` and places it on its assigned
    /// core's ready queue, per §4.8's activation rule.
    pub fn activate_task(&'static self, handle: TaskHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let id = self.tasks.resolve(handle, tok)?;
        let task = self.tasks.get(id);
        if task.state(tok) != TaskSt::Dormant {
            return Err(StateError::TaskAlreadyActive.into());
        }
        task.set_effective_priority(tok, task.base_priority(tok));
        // Safety: the slot was just allocated/reset and its stack region is
        // exclusively owned by this task.
        unsafe { H::prepare_task_stack(task) };
        self.make_ready(tok, id);
        let core = task.assigned_core(tok);
        drop(guard);
        self.check_preemption(core);
        Ok(())
    }

    /// Places `id` on its assigned core's ready queue and marks it `Ready`.
    /// Internal: callers must already hold CPU Lock.
    pub(crate) fn make_ready(&self, tok: &CpuLockToken<H>, id: TaskId) {
        let task = self.tasks.get(id);
        task.set_block_reason(tok, None);
        if task.suspend_count(tok) > 0 {
            task.set_state(tok, TaskSt::Suspended);
            return;
        }
        task.set_state(tok, TaskSt::Ready);
        let core = task.assigned_core(tok);
        self.core(core).ready.push(&self.tasks, tok, id);
    }

    pub(crate) fn core(&self, core: CoreId) -> &CoreSchedState<H> {
        &self.cores[core.index()]
    }

    /// Picks the highest-priority ready task for `core` and context-switches
    /// into it if it differs from the one currently running (§4.8). Called
    /// from the reschedule exception and from every blocking-primitive entry
    /// point that might have changed readiness.
    pub fn check_preemption(&'static self, core: CoreId) {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let sched = self.core(core);
        let current = sched.running.get(tok);
        let best = sched.ready.peek_highest(&self.tasks, tok);

        let should_switch = match (current, best) {
            (None, Some(_)) => true,
            (Some(cur), Some(cand)) => {
                let cur_prio = self.tasks.get(cur).effective_priority(tok);
                let cand_prio = self.tasks.get(cand).effective_priority(tok);
                cand_prio < cur_prio
            }
            _ => false,
        };

        if !should_switch {
            return;
        }

        let next = sched.ready.pop_highest(&self.tasks, tok).unwrap();
        if let Some(cur) = current {
            let cur_task = self.tasks.get(cur);
            if cur_task.state(tok) == TaskSt::Running {
                cur_task.set_state(tok, TaskSt::Ready);
                sched.ready.push(&self.tasks, tok, cur);
            }
        }
        self.tasks.get(next).set_state(tok, TaskSt::Running);
        sched.running.set(tok, Some(next));

        if core == H::current_core() {
            let prev_cb = current.map(|c| self.tasks.get(c));
            let next_cb = self.tasks.get(next);
            // Safety: invoked with CPU Lock held, as `Hal::context_switch`
            // requires; `prev`/`next` outlive the call (`'static` arena).
            unsafe { H::context_switch(prev_cb, next_cb) };
        } else {
            // Safety: only the scheduler calls this, to nudge a remote core
            // into re-evaluating its own ready queue.
            unsafe { H::request_reschedule(core) };
        }
    }

    /// Voluntarily yields the calling task to any other ready task of equal
    /// or higher priority (§4.8).
    pub fn yield_now(&'static self) {
        let core = H::current_core();
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        if let Some(cur) = self.core(core).running.get(tok) {
            let task = self.tasks.get(cur);
            task.set_state(tok, TaskSt::Ready);
            self.core(core).ready.push(&self.tasks, tok, cur);
            self.core(core).running.set(tok, None);
        }
        drop(guard);
        self.check_preemption(core);
    }

    /// Changes a task's base priority, recomputing its effective priority
    /// (unless it's currently boosted above `priority` by inheritance, in
    /// which case the boost still applies; see `crate::mutex`) and
    /// re-threading it through whichever queue it's on (§4.8's "reposition
    /// on priority change").
    pub fn set_task_priority(&'static self, handle: TaskHandle, priority: u8) -> Result<(), KernelError> {
        if priority as usize >= NUM_PRIORITIES {
            return Err(ParameterError::BadPriority.into());
        }
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let id = self.tasks.resolve(handle, tok)?;
        let task = self.tasks.get(id);
        task.base_priority.set(tok, priority);
        // The inheritance ceiling contributed by owned mutexes (if any) is
        // recomputed from the mutexes themselves, not derived from the old
        // effective priority, so a priority change can't "remember" a stale
        // boost; see `crate::mutex::recompute_effective_priority`.
        let effective = crate::mutex::recompute_effective_priority(self, tok, id, priority);
        let old_state = task.state(tok);
        match old_state {
            TaskSt::Ready => {
                let core = task.assigned_core(tok);
                self.core(core).ready.remove(&self.tasks, tok, id);
                task.set_effective_priority(tok, effective);
                self.core(core).ready.push(&self.tasks, tok, id);
            }
            TaskSt::Blocked => {
                task.set_effective_priority(tok, effective);
                self.reposition_in_wait_queue(tok, id);
            }
            _ => {
                task.set_effective_priority(tok, effective);
            }
        }
        drop(guard);
        for core in 0..NUM_CORES {
            self.check_preemption(CoreId::from_index(core));
        }
        Ok(())
    }

    /// Increments `handle`'s suspend count, taking it off the ready/running
    /// slot it's in (a `Blocked` task stays queued where it is; only its
    /// eventual unblock gets redirected to `Suspended`, via `make_ready`).
    /// Nested suspends stack: `task_resume` must be called once per
    /// `task_suspend` before the task can run again (§3, §8's round-trip
    /// law). Rejects `Dormant`/`Terminated` targets.
    pub fn task_suspend(&'static self, handle: TaskHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let id = self.tasks.resolve(handle, tok)?;
        let task = self.tasks.get(id);
        let state = task.state(tok);
        if matches!(state, TaskSt::Dormant | TaskSt::Terminated) {
            return Err(StateError::TaskNotSuspendable.into());
        }
        *task.suspend_count.write(tok) += 1;
        let mut preempt_core = None;
        match state {
            TaskSt::Ready => {
                let core = task.assigned_core(tok);
                self.core(core).ready.remove(&self.tasks, tok, id);
                task.set_state(tok, TaskSt::Suspended);
            }
            TaskSt::Running => {
                let core = task.assigned_core(tok);
                task.set_state(tok, TaskSt::Suspended);
                self.core(core).running.set(tok, None);
                preempt_core = Some(core);
            }
            _ => {}
        }
        drop(guard);
        if let Some(core) = preempt_core {
            self.check_preemption(core);
        }
        Ok(())
    }

    /// Decrements `handle`'s suspend count; once it reaches zero and the
    /// task is still `Suspended`, it becomes `Ready` again. Errors with
    /// [`StateError::TaskNotSuspended`] if there's no outstanding suspend to
    /// undo.
    pub fn task_resume(&'static self, handle: TaskHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let id = self.tasks.resolve(handle, tok)?;
        let task = self.tasks.get(id);
        let count = task.suspend_count(tok);
        if count == 0 {
            return Err(StateError::TaskNotSuspended.into());
        }
        task.suspend_count.set(tok, count - 1);
        let mut preempt_core = None;
        if count - 1 == 0 && task.state(tok) == TaskSt::Suspended {
            self.make_ready(tok, id);
            preempt_core = Some(task.assigned_core(tok));
        }
        drop(guard);
        if let Some(core) = preempt_core {
            self.check_preemption(core);
        }
        Ok(())
    }

    /// Blocks the calling task for `ms` milliseconds (§6). Returns
    /// immediately without yielding for `ms == 0`
    /// ([`crate::timeout::TIMEOUT_IMMEDIATE`]); `TIMEOUT_INFINITE` blocks
    /// forever, matching every other timeout-taking API even though a caller
    /// sleeping forever would never observe the difference from a crash.
    pub fn task_delay(&'static self, ms: u32) {
        if ms == crate::timeout::TIMEOUT_IMMEDIATE {
            return;
        }
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let core = H::current_core();
        let caller = self
            .core(core)
            .running
            .get(tok)
            .expect("task_delay called with no running task");
        if ms != crate::timeout::TIMEOUT_INFINITE {
            self.timeout_arm(tok, caller, ms, None);
        }
        self.block_on(tok, &self.delay_queue, BlockReason::Delay);
        drop(guard);
        self.check_preemption(core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{lock_test, task_attr, MockHal};

    fn new_kernel() -> &'static crate::Kernel<MockHal> {
        Box::leak(Box::new(crate::Kernel::new(crate::cfg::KernelConfig::default())))
    }

    #[test]
    fn activating_the_only_task_makes_it_running() {
        let _g = lock_test();
        let kernel = new_kernel();

        let h = kernel.create_task(task_attr("a", 10, Affinity::Core0)).unwrap();
        kernel.activate_task(h).unwrap();

        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let id = kernel.tasks.resolve(h, tok).unwrap();
        assert_eq!(kernel.tasks.get(id).state(tok), TaskSt::Running);
        assert_eq!(kernel.core(CoreId::Core0).running.get(tok), Some(id));
    }

    #[test]
    fn higher_priority_task_preempts_lower_one() {
        let _g = lock_test();
        let kernel = new_kernel();

        let low = kernel.create_task(task_attr("low", 20, Affinity::Core0)).unwrap();
        kernel.activate_task(low).unwrap();

        let high = kernel.create_task(task_attr("high", 5, Affinity::Core0)).unwrap();
        kernel.activate_task(high).unwrap();

        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let low_id = kernel.tasks.resolve(low, tok).unwrap();
        let high_id = kernel.tasks.resolve(high, tok).unwrap();

        // Numerically lower priority is more urgent (§3): `high` must be
        // running and `low` demoted back to `Ready`.
        assert_eq!(kernel.core(CoreId::Core0).running.get(tok), Some(high_id));
        assert_eq!(kernel.tasks.get(low_id).state(tok), TaskSt::Ready);
        assert_eq!(kernel.tasks.get(high_id).state(tok), TaskSt::Running);
    }

    #[test]
    fn equal_priority_second_task_stays_ready() {
        let _g = lock_test();
        let kernel = new_kernel();

        let first = kernel.create_task(task_attr("first", 10, Affinity::Core0)).unwrap();
        kernel.activate_task(first).unwrap();
        let second = kernel.create_task(task_attr("second", 10, Affinity::Core0)).unwrap();
        kernel.activate_task(second).unwrap();

        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let first_id = kernel.tasks.resolve(first, tok).unwrap();
        assert_eq!(kernel.core(CoreId::Core0).running.get(tok), Some(first_id));
    }

    #[test]
    fn yield_now_hands_off_to_equal_priority_peer() {
        let _g = lock_test();
        let kernel = new_kernel();
        crate::test_support::set_current_core(CoreId::Core0);

        let first = kernel.create_task(task_attr("first", 10, Affinity::Core0)).unwrap();
        kernel.activate_task(first).unwrap();
        let second = kernel.create_task(task_attr("second", 10, Affinity::Core0)).unwrap();
        kernel.activate_task(second).unwrap();

        kernel.yield_now();

        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let second_id = kernel.tasks.resolve(second, tok).unwrap();
        assert_eq!(kernel.core(CoreId::Core0).running.get(tok), Some(second_id));
    }

    #[test]
    fn set_task_priority_reorders_ready_queue() {
        let _g = lock_test();
        let kernel = new_kernel();

        let running = kernel.create_task(task_attr("running", 1, Affinity::Core0)).unwrap();
        kernel.activate_task(running).unwrap();
        let waiting = kernel.create_task(task_attr("waiting", 20, Affinity::Core0)).unwrap();
        kernel.activate_task(waiting).unwrap();

        kernel.set_task_priority(waiting, 0).unwrap();

        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let waiting_id = kernel.tasks.resolve(waiting, tok).unwrap();
        // `waiting` is now the most urgent task and should have preempted.
        assert_eq!(kernel.core(CoreId::Core0).running.get(tok), Some(waiting_id));
    }

    #[test]
    fn delete_requires_dormant_or_terminated() {
        let _g = lock_test();
        let kernel = new_kernel();

        let h = kernel.create_task(task_attr("a", 10, Affinity::Core0)).unwrap();
        kernel.activate_task(h).unwrap();
        assert!(matches!(kernel.delete_task(h), Err(_)));

        let h2 = kernel.create_task(task_attr("b", 10, Affinity::Core0)).unwrap();
        assert!(kernel.delete_task(h2).is_ok());
    }

    #[test]
    fn stale_handle_after_delete_is_rejected() {
        let _g = lock_test();
        let kernel = new_kernel();

        let h = kernel.create_task(task_attr("a", 10, Affinity::Core0)).unwrap();
        kernel.delete_task(h).unwrap();
        let reused = kernel.create_task(task_attr("b", 10, Affinity::Core0)).unwrap();
        assert_ne!(h, reused);
        assert!(kernel.activate_task(h).is_err());
    }

    #[test]
    fn suspend_then_resume_round_trips_to_ready() {
        let _g = lock_test();
        let kernel = new_kernel();

        let low = kernel.create_task(task_attr("low", 20, Affinity::Core0)).unwrap();
        kernel.activate_task(low).unwrap();
        let high = kernel.create_task(task_attr("high", 5, Affinity::Core0)).unwrap();
        kernel.activate_task(high).unwrap();

        // `low` preempted back to `Ready` by `high`; suspend it there.
        kernel.task_suspend(low).unwrap();
        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let low_id = kernel.tasks.resolve(low, tok).unwrap();
        assert_eq!(kernel.tasks.get(low_id).state(tok), TaskSt::Suspended);
        drop(guard);

        kernel.task_resume(low).unwrap();
        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        assert_eq!(kernel.tasks.get(low_id).state(tok), TaskSt::Ready);
    }

    #[test]
    fn nested_suspend_requires_matching_resumes() {
        let _g = lock_test();
        let kernel = new_kernel();

        let low = kernel.create_task(task_attr("low", 20, Affinity::Core0)).unwrap();
        kernel.activate_task(low).unwrap();
        let high = kernel.create_task(task_attr("high", 5, Affinity::Core0)).unwrap();
        kernel.activate_task(high).unwrap();

        kernel.task_suspend(low).unwrap();
        kernel.task_suspend(low).unwrap();
        kernel.task_resume(low).unwrap();

        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let low_id = kernel.tasks.resolve(low, tok).unwrap();
        // One outstanding suspend left: still not runnable.
        assert_eq!(kernel.tasks.get(low_id).state(tok), TaskSt::Suspended);
        drop(guard);

        kernel.task_resume(low).unwrap();
        assert!(matches!(kernel.task_resume(low), Err(_)));
    }

    #[test]
    fn suspend_rejects_dormant_and_terminated() {
        let _g = lock_test();
        let kernel = new_kernel();

        let h = kernel.create_task(task_attr("a", 10, Affinity::Core0)).unwrap();
        assert!(matches!(kernel.task_suspend(h), Err(_)));
    }

    #[test]
    fn resume_without_a_pending_suspend_is_rejected() {
        let _g = lock_test();
        let kernel = new_kernel();

        let h = kernel.create_task(task_attr("a", 10, Affinity::Core0)).unwrap();
        kernel.activate_task(h).unwrap();
        assert!(matches!(kernel.task_resume(h), Err(_)));
    }

    #[test]
    fn delay_of_zero_returns_without_blocking() {
        let _g = lock_test();
        let kernel = new_kernel();

        let h = kernel.create_task(task_attr("a", 10, Affinity::Core0)).unwrap();
        kernel.activate_task(h).unwrap();

        // `TIMEOUT_IMMEDIATE` (0ms) must return immediately; since
        // `MockHal::context_switch` is a no-op, any attempt to actually
        // block here would hang the test thread.
        kernel.task_delay(crate::timeout::TIMEOUT_IMMEDIATE);

        let guard = crate::klock::lock_cpu::<MockHal>();
        let tok = guard.token();
        let id = kernel.tasks.resolve(h, tok).unwrap();
        assert_eq!(kernel.tasks.get(id).state(tok), TaskSt::Running);
    }
}
