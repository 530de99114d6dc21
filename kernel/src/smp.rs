//! C9: SMP core manager — affinity enforcement, task migration, and the
//! periodic load balancer. Gated by the `multi_core` feature (§6's
//! `ENABLE_MULTI_CORE`).
//!
//! Migration itself is a two-phase protocol (§4.9): a request is enqueued
//! into a bounded, drop-oldest ring here; the destination core actually
//! moves the task's ready-queue membership at its next scheduling point
//! (`crate::Kernel::check_preemption`'s caller drains the ring first), so
//! no cross-core mutation happens from inside an arbitrary caller's stack.
#![cfg(feature = "multi_core")]

use crate::cfg::{MIGRATION_RING_LEN, NUM_CORES};
use crate::error::KernelError;
use crate::hal::{CoreId, Hal};
use crate::klock::{CpuLockToken, KCell};
use crate::task::{Affinity, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignStrategy {
    RoundRobin,
    LeastLoaded,
    PriorityBased,
    AffinityFirst,
}

#[derive(Debug, Clone, Copy)]
struct MigrationRequest {
    task: TaskId,
    target: CoreId,
    urgent: bool,
}

/// Per-core counters the load balancer derives its composite score from.
pub struct CorePerfState<H: Hal> {
    task_count: KCell<H, u32>,
    runtime_us: KCell<H, u64>,
    idle_time_us: KCell<H, u64>,
    context_switch_count: KCell<H, u32>,
}

impl<H: Hal> CorePerfState<H> {
    pub const fn new() -> Self {
        Self {
            task_count: KCell::new(0),
            runtime_us: KCell::new(0),
            idle_time_us: KCell::new(0),
            context_switch_count: KCell::new(0),
        }
    }
}

/// A bounded FIFO of pending migration requests, oldest dropped (and
/// logged) when full (§4.9's explicit drop-oldest policy).
struct MigrationRing<H: Hal> {
    slots: [KCell<H, Option<MigrationRequest>>; MIGRATION_RING_LEN],
    head: KCell<H, usize>,
    len: KCell<H, usize>,
}

impl<H: Hal> MigrationRing<H> {
    const fn new() -> Self {
        Self {
            slots: [const { KCell::new(None) }; MIGRATION_RING_LEN],
            head: KCell::new(0),
            len: KCell::new(0),
        }
    }

    fn push(&self, tok: &CpuLockToken<H>, req: MigrationRequest) {
        let len = self.len.get(tok);
        if len == MIGRATION_RING_LEN {
            log::warn!("migration ring full, dropping oldest request");
            let head = self.head.get(tok);
            self.head.set(tok, (head + 1) % MIGRATION_RING_LEN);
            self.len.set(tok, len - 1);
        }
        let tail = (self.head.get(tok) + self.len.get(tok)) % MIGRATION_RING_LEN;
        self.slots[tail].set(tok, Some(req));
        self.len.set(tok, self.len.get(tok) + 1);
    }

    fn pop(&self, tok: &CpuLockToken<H>) -> Option<MigrationRequest> {
        if self.len.get(tok) == 0 {
            return None;
        }
        let head = self.head.get(tok);
        let req = self.slots[head].replace(tok, None);
        self.head.set(tok, (head + 1) % MIGRATION_RING_LEN);
        self.len.set(tok, self.len.get(tok) - 1);
        req
    }
}

pub struct SmpManager<H: Hal> {
    enabled: KCell<H, bool>,
    strategy: KCell<H, AssignStrategy>,
    load_balance_threshold_pct: KCell<H, u8>,
    migration_counter: KCell<H, u32>,
    last_balance_us: KCell<H, u64>,
    pub perf: [CorePerfState<H>; NUM_CORES],
    pending: MigrationRing<H>,
}

impl<H: Hal> SmpManager<H> {
    pub const fn new() -> Self {
        Self {
            enabled: KCell::new(true),
            strategy: KCell::new(AssignStrategy::AffinityFirst),
            load_balance_threshold_pct: KCell::new(20),
            migration_counter: KCell::new(0),
            last_balance_us: KCell::new(0),
            perf: [const { CorePerfState::new() }; NUM_CORES],
            pending: MigrationRing::new(),
        }
    }
}

impl<H: Hal> crate::Kernel<H> {
    /// Computes core `core`'s composite load (§4.9): 40% task-count ratio
    /// (against `MAX_TASKS`), 40% CPU utilization, 20% average-priority
    /// weight (lower average priority number = busier with urgent work, so
    /// weighted as `(NUM_PRIORITIES - avg) / NUM_PRIORITIES`), clamped to
    /// [0, 100].
    pub fn core_load_pct(&self, tok: &CpuLockToken<H>, core: CoreId) -> u8 {
        let perf = &self.smp.perf[core.index()];
        let task_count = perf.task_count.get(tok) as u64;
        let task_ratio = (task_count * 100 / crate::cfg::MAX_TASKS as u64).min(100);

        let runtime = perf.runtime_us.get(tok);
        let idle = perf.idle_time_us.get(tok);
        let total = runtime + idle;
        let util = if total == 0 { 0 } else { runtime * 100 / total };

        let avg_prio = self.average_priority(tok, core);
        let prio_weight = ((crate::cfg::NUM_PRIORITIES as u64).saturating_sub(avg_prio) * 100) / crate::cfg::NUM_PRIORITIES as u64;

        let composite = (task_ratio * 40 + util * 40 + prio_weight * 20) / 100;
        composite.min(100) as u8
    }

    fn average_priority(&self, tok: &CpuLockToken<H>, core: CoreId) -> u64 {
        let mut sum = 0u64;
        let mut count = 0u64;
        for id in self.core(core).ready.iter(&self.tasks, tok) {
            sum += self.tasks.get(id).effective_priority(tok) as u64;
            count += 1;
        }
        if count == 0 {
            0
        } else {
            sum / count
        }
    }

    /// Sets `handle`'s affinity. If the task is currently running on a core
    /// the new affinity disallows, an urgent migration is queued
    /// immediately rather than waiting for the next load-balance pass.
    pub fn set_task_affinity(&'static self, handle: crate::task::TaskHandle, affinity: Affinity) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let id = self.tasks.resolve(handle, tok)?;
        let task = self.tasks.get(id);
        task.set_affinity_value(tok, affinity);
        let current = task.assigned_core(tok);
        if !affinity.allows(current) {
            let target = current.other();
            self.smp.pending.push(
                tok,
                MigrationRequest {
                    task: id,
                    target,
                    urgent: true,
                },
            );
        }
        drop(guard);
        for core in 0..NUM_CORES {
            self.drain_migrations(CoreId::from_index(core));
        }
        Ok(())
    }

    /// Drains queued migration requests targeting `core`, performed at a
    /// scheduling point (called from `check_preemption`'s call sites and
    /// directly after `set_task_affinity`/the load balancer enqueue one).
    pub fn drain_migrations(&'static self, core: CoreId) {
        loop {
            let guard = crate::klock::lock_cpu::<H>();
            let tok = guard.token();
            let Some(req) = self.take_migration_for(tok, core) else {
                return;
            };
            let task = self.tasks.get(req.task);
            if task.assigned_core(tok) == req.target {
                continue;
            }
            let was_ready = task.state(tok) == crate::task::TaskSt::Ready;
            if was_ready {
                self.core(task.assigned_core(tok)).ready.remove(&self.tasks, tok, req.task);
            }
            task.set_assigned_core(tok, req.target);
            task.record_migration(tok);
            *self.smp.migration_counter.write(tok) += 1;
            if was_ready {
                self.core(req.target).ready.push(&self.tasks, tok, req.task);
            }
            drop(guard);
            self.check_preemption(req.target);
        }
    }

    /// Pops the next pending request if it targets `core`, re-queuing any
    /// mismatched request it passes over (the ring only ever holds a
    /// handful of entries, so a linear rescan is cheap).
    fn take_migration_for(&self, tok: &CpuLockToken<H>, core: CoreId) -> Option<MigrationRequest> {
        let mut deferred = arrayvec::ArrayVec::<MigrationRequest, MIGRATION_RING_LEN>::new();
        let mut found = None;
        while let Some(req) = self.smp.pending.pop(tok) {
            if found.is_none() && req.target == core {
                found = Some(req);
            } else {
                let _ = deferred.try_push(req);
            }
        }
        for req in deferred {
            self.smp.pending.push(tok, req);
        }
        found
    }

    /// Runs the periodic load balancer (§4.9). Call from the tick handler;
    /// it self-paces against `load_balance_period_us`.
    pub fn load_balance_tick(&'static self, now_us: u64) {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        if !self.smp.enabled.get(tok) {
            return;
        }
        let period = self.config.load_balance_period_us;
        if now_us.wrapping_sub(self.smp.last_balance_us.get(tok)) < period {
            return;
        }
        self.smp.last_balance_us.set(tok, now_us);

        let load0 = self.core_load_pct(tok, CoreId::Core0);
        let load1 = self.core_load_pct(tok, CoreId::Core1);
        let threshold = self.smp.load_balance_threshold_pct.get(tok);
        let diff = load0.abs_diff(load1);
        if diff <= threshold {
            return;
        }
        let (overloaded, target) = if load0 > load1 {
            (CoreId::Core0, CoreId::Core1)
        } else {
            (CoreId::Core1, CoreId::Core0)
        };

        let mut candidates = arrayvec::ArrayVec::<TaskId, 3>::new();
        for id in self.core(overloaded).ready.iter(&self.tasks, tok) {
            if candidates.is_full() {
                break;
            }
            let task = self.tasks.get(id);
            if task.affinity(tok).allows(target) && task.migration_count(tok) == 0 {
                let _ = candidates.try_push(id);
            }
        }
        for id in candidates {
            self.smp.pending.push(
                tok,
                MigrationRequest {
                    task: id,
                    target,
                    urgent: false,
                },
            );
        }
        drop(guard);
        self.drain_migrations(target);
    }
}
