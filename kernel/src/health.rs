//! C11: core-health watchdog, heartbeat monitor, and graceful single-core
//! degradation. Gated by the `multi_core` feature (§6's
//! `ENABLE_MULTI_CORE` gates C9-C11 together).
//!
//! Grounded in the same per-core-state-plus-Core0-owned-monitor shape as
//! `crate::smp`'s load balancer, driven from the same tick handler rather
//! than its own interrupt (§4.11: "the monitor runs on Core0 only").
#![cfg(feature = "multi_core")]

use crate::cfg::NUM_CORES;
use crate::hal::{CoreId, Hal};
use crate::klock::{CpuLockToken, KCell};
use crate::task::TaskSt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreHealthStatus {
    Healthy,
    Unresponsive,
    Failed,
    Recovering,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    WatchdogTimeout,
    MissedHeartbeats,
    Unknown,
}

/// What a registered failure callback asks the monitor to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    GiveUp,
}

struct CoreHealth<H: Hal> {
    status: KCell<H, CoreHealthStatus>,
    failure_type: KCell<H, Option<FailureType>>,
    last_heartbeat_us: KCell<H, u64>,
    missed_heartbeat_count: KCell<H, u8>,
    failure_count: KCell<H, u32>,
    recovery_attempts: KCell<H, u32>,
    total_downtime_us: KCell<H, u64>,
    failed_since_us: KCell<H, u64>,
    watchdog_fed: KCell<H, bool>,
    watchdog_feed_count: KCell<H, u32>,
}

impl<H: Hal> CoreHealth<H> {
    const fn new() -> Self {
        Self {
            status: KCell::new(CoreHealthStatus::Unknown),
            failure_type: KCell::new(None),
            last_heartbeat_us: KCell::new(0),
            missed_heartbeat_count: KCell::new(0),
            failure_count: KCell::new(0),
            recovery_attempts: KCell::new(0),
            total_downtime_us: KCell::new(0),
            failed_since_us: KCell::new(0),
            watchdog_fed: KCell::new(false),
            watchdog_feed_count: KCell::new(0),
        }
    }
}

/// A snapshot returned by [`crate::Kernel::health_get_state`]; the live
/// state behind `KCell`s isn't directly shareable across the API boundary.
#[derive(Debug, Clone, Copy)]
pub struct CoreHealthSnapshot {
    pub status: CoreHealthStatus,
    pub failure_type: Option<FailureType>,
    pub last_heartbeat_us: u64,
    pub missed_heartbeat_count: u8,
    pub failure_count: u32,
    pub recovery_attempts: u32,
    pub total_downtime_us: u64,
    pub watchdog_fed: bool,
    pub watchdog_feed_count: u32,
}

pub type FailureCallback = fn(CoreId, FailureType) -> RecoveryAction;

pub struct HealthMonitor<H: Hal> {
    enabled: KCell<H, bool>,
    cores: [CoreHealth<H>; NUM_CORES],
    single_core_mode: KCell<H, bool>,
    last_check_us: KCell<H, u64>,
    callback: KCell<H, Option<FailureCallback>>,
}

impl<H: Hal> HealthMonitor<H> {
    pub const fn new() -> Self {
        Self {
            enabled: KCell::new(false),
            cores: [const { CoreHealth::new() }; NUM_CORES],
            single_core_mode: KCell::new(false),
            last_check_us: KCell::new(0),
            callback: KCell::new(None),
        }
    }
}

/// The reset-survives-reset RAM region (§6): a magic sentinel, a payload
/// length, and up to 256 bytes of recovery data. Placed by the port in a
/// linker section excluded from zero-init, and handed to
/// [`crate::Kernel::new`] as a `&'static mut` reference.
#[repr(C)]
pub struct ResetRecoveryRegion {
    magic: u32,
    length: u32,
    payload: [u8; 256],
}

const RESET_MAGIC: u32 = 0xDEAD_BEEF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    PowerOn,
    WatchdogTimeout,
}

impl ResetRecoveryRegion {
    /// A region with no valid magic, i.e. "nothing survived from before".
    /// Ports place the actual instance in a linker section excluded from
    /// zero-init, so on a genuine watchdog-triggered reset the previous
    /// boot's `write_payload` contents are still there in SRAM even though
    /// this constructor never runs again after the first power-on.
    pub const fn new() -> Self {
        Self {
            magic: 0,
            length: 0,
            payload: [0; 256],
        }
    }

    /// Derives the reset reason (§6): a valid magic left by the previous
    /// boot means the kernel itself reset via watchdog; otherwise the
    /// port-supplied `hw_timer_reset_bit` (read from the MCU's own reset-
    /// reason register) is consulted.
    pub fn reset_reason(&self, hw_timer_reset_bit: bool) -> ResetReason {
        if self.magic == RESET_MAGIC || hw_timer_reset_bit {
            ResetReason::WatchdogTimeout
        } else {
            ResetReason::PowerOn
        }
    }

    pub fn read_payload(&self) -> &[u8] {
        if self.magic != RESET_MAGIC {
            return &[];
        }
        let len = (self.length as usize).min(self.payload.len());
        &self.payload[..len]
    }

    /// Stamps `data` into the region ahead of a deliberate watchdog reset
    /// (e.g. right before [`crate::Kernel::health_force_recovery`] gives up
    /// and lets the watchdog fire). Truncates silently past 256 bytes.
    pub fn write_payload(&mut self, data: &[u8]) {
        let len = data.len().min(self.payload.len());
        self.payload[..len].copy_from_slice(&data[..len]);
        self.length = len as u32;
        self.magic = RESET_MAGIC;
    }
}

impl<H: Hal> crate::Kernel<H> {
    pub fn health_start(&self) {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        self.health.enabled.set(tok, true);
        let now = H::now_us();
        for core in &self.health.cores {
            core.status.set(tok, CoreHealthStatus::Healthy);
            core.last_heartbeat_us.set(tok, now);
            core.watchdog_fed.set(tok, true);
        }
        H::configure_watchdog(Some(self.config.watchdog_timeout_us));
    }

    pub fn health_stop(&self) {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        self.health.enabled.set(tok, false);
        H::configure_watchdog(None);
    }

    pub fn health_register_callback(&self, cb: FailureCallback) {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        self.health.callback.set(tok, Some(cb));
    }

    /// Self-reported by a core's idle task (and any cooperating long-
    /// running loop), per §4.11.
    pub fn health_heartbeat(&self, core: CoreId) {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let c = &self.health.cores[core.index()];
        c.last_heartbeat_us.set(tok, H::now_us());
        c.missed_heartbeat_count.set(tok, 0);
        if c.status.get(tok) == CoreHealthStatus::Unresponsive {
            c.status.set(tok, CoreHealthStatus::Healthy);
        }
    }

    pub fn health_feed_watchdog(&self, core: CoreId) {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let c = &self.health.cores[core.index()];
        c.watchdog_fed.set(tok, true);
        *c.watchdog_feed_count.write(tok) += 1;
        if core == H::current_core() {
            H::feed_watchdog();
        }
    }

    pub fn health_get_state(&self, core: CoreId) -> CoreHealthSnapshot {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let c = &self.health.cores[core.index()];
        CoreHealthSnapshot {
            status: c.status.get(tok),
            failure_type: c.failure_type.get(tok),
            last_heartbeat_us: c.last_heartbeat_us.get(tok),
            missed_heartbeat_count: c.missed_heartbeat_count.get(tok),
            failure_count: c.failure_count.get(tok),
            recovery_attempts: c.recovery_attempts.get(tok),
            total_downtime_us: c.total_downtime_us.get(tok),
            watchdog_fed: c.watchdog_fed.get(tok),
            watchdog_feed_count: c.watchdog_feed_count.get(tok),
        }
    }

    pub fn health_query_single_core(&self) -> bool {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        self.health.single_core_mode.get(tok)
    }

    /// Forces recovery of `core` outside the normal polling cadence (§6's
    /// "force recovery" health API entry). Runs the same state machine
    /// [`Self::health_monitor_tick`] would, for this one core, immediately.
    pub fn health_force_recovery(&'static self, core: CoreId) {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        if self.health.cores[core.index()].status.get(tok) == CoreHealthStatus::Failed {
            drop(guard);
            self.begin_recovery(core);
        }
    }

    /// Runs one poll of the health monitor; call from the tick handler on
    /// Core0 only (§4.11). Self-paces against `health_check_interval_us`.
    pub fn health_monitor_tick(&'static self, now_us: u64) {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        if !self.health.enabled.get(tok) {
            return;
        }
        if now_us.wrapping_sub(self.health.last_check_us.get(tok)) < self.config.health_check_interval_us {
            return;
        }
        self.health.last_check_us.set(tok, now_us);

        let mut to_fail: arrayvec::ArrayVec<CoreId, { crate::cfg::NUM_CORES }> = arrayvec::ArrayVec::new();
        for idx in 0..NUM_CORES {
            let core = CoreId::from_index(idx);
            let c = &self.health.cores[idx];
            let status = c.status.get(tok);
            if status == CoreHealthStatus::Failed || status == CoreHealthStatus::Recovering {
                continue;
            }
            let age_us = now_us.wrapping_sub(c.last_heartbeat_us.get(tok));
            let stale = age_us > self.config.watchdog_timeout_us || !c.watchdog_fed.get(tok);
            if stale {
                let missed = c.missed_heartbeat_count.get(tok) + 1;
                c.missed_heartbeat_count.set(tok, missed);
                c.status.set(
                    tok,
                    if missed >= self.config.max_missed_heartbeats {
                        CoreHealthStatus::Failed
                    } else {
                        CoreHealthStatus::Unresponsive
                    },
                );
                if missed >= self.config.max_missed_heartbeats {
                    let _ = to_fail.try_push(core);
                }
            }
            c.watchdog_fed.set(tok, false);
        }
        drop(guard);

        for core in to_fail {
            self.handle_core_failure(core);
        }
    }

    fn handle_core_failure(&'static self, core: CoreId) {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let c = &self.health.cores[core.index()];
        c.failure_type.set(tok, Some(FailureType::MissedHeartbeats));
        *c.failure_count.write(tok) += 1;
        c.failed_since_us.set(tok, H::now_us());
        let cb = self.health.callback.get(tok);
        let auto_recovery = self.config.auto_recovery;
        drop(guard);

        let action = cb.map(|f| f(core, FailureType::MissedHeartbeats)).unwrap_or(RecoveryAction::GiveUp);
        if auto_recovery && action == RecoveryAction::Retry {
            self.begin_recovery(core);
        } else if self.config.graceful_degradation {
            self.degrade_to_single_core(core);
        }
    }

    /// Polls for up to `recovery_timeout_us` for fresh heartbeats from
    /// `core`. On success, marks it `Healthy` and records the downtime; on
    /// failure, degrades to single-core if enabled (§4.11).
    fn begin_recovery(&'static self, core: CoreId) {
        {
            let guard = crate::klock::lock_cpu::<H>();
            let tok = guard.token();
            let c = &self.health.cores[core.index()];
            c.status.set(tok, CoreHealthStatus::Recovering);
            c.missed_heartbeat_count.set(tok, 0);
            *c.recovery_attempts.write(tok) += 1;
        }

        let start_us = H::now_us();
        loop {
            let guard = crate::klock::lock_cpu::<H>();
            let tok = guard.token();
            let c = &self.health.cores[core.index()];
            let recovered = H::now_us().wrapping_sub(c.last_heartbeat_us.get(tok)) < self.config.health_check_interval_us
                && c.last_heartbeat_us.get(tok) >= start_us;
            if recovered {
                let downtime = H::now_us().wrapping_sub(c.failed_since_us.get(tok));
                *c.total_downtime_us.write(tok) += downtime;
                c.status.set(tok, CoreHealthStatus::Healthy);
                c.failure_type.set(tok, None);
                drop(guard);
                return;
            }
            let timed_out = H::now_us().wrapping_sub(start_us) >= self.config.recovery_timeout_us;
            drop(guard);
            if timed_out {
                if self.config.graceful_degradation {
                    self.degrade_to_single_core(core);
                }
                return;
            }
            self.yield_now();
        }
    }

    /// Migrates every non-idle task off `failed` to the other core,
    /// processed inline rather than through `crate::smp`'s deferred
    /// migration ring (§4.11's "urgent requests processed inline"), marks
    /// `failed` inactive, and sets `single_core_mode`.
    fn degrade_to_single_core(&'static self, failed: CoreId) {
        let healthy = failed.other();
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();

        let c = &self.health.cores[failed.index()];
        c.status.set(tok, CoreHealthStatus::Failed);

        let mut victims: arrayvec::ArrayVec<crate::task::TaskId, { crate::cfg::MAX_TASKS }> = arrayvec::ArrayVec::new();
        for id in self.core(failed).ready.iter(&self.tasks, tok) {
            if self.tasks.get(id).base_priority(tok) != 0 {
                let _ = victims.try_push(id);
            }
        }
        if let Some(running) = self.core(failed).running.get(tok) {
            if self.tasks.get(running).base_priority(tok) != 0 {
                let _ = victims.try_push(running);
            }
        }

        for id in victims {
            let task = self.tasks.get(id);
            if task.state(tok) == TaskSt::Ready {
                self.core(failed).ready.remove(&self.tasks, tok, id);
                task.set_assigned_core(tok, healthy);
                self.core(healthy).ready.push(&self.tasks, tok, id);
            } else {
                task.set_assigned_core(tok, healthy);
            }
            task.record_migration(tok);
        }

        self.health.single_core_mode.set(tok, true);
        drop(guard);
        self.check_preemption(healthy);
    }
}
