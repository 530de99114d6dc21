//! Compile-time and boot-time kernel configuration.
//!
//! Array-bounding knobs ([`MAX_TASKS`] and friends) are plain consts because
//! Rust's stable constant-generics story doesn't let a trait associate a
//! const with an array length on another generic type ([tag:no_gce]). Knobs
//! that only gate behavior, not storage, are either Cargo features (see
//! `Cargo.toml`: `multi_core`, `hires_timers`, `memory_tracking`,
//! `runtime_stats`) or fields of [`KernelConfig`], supplied at
//! [`crate::Kernel::new`] time.

/// Maximum number of simultaneously-registered tasks.
pub const MAX_TASKS: usize = 32;

/// Number of priority levels, 0 (highest) ..= [`NUM_PRIORITIES`] - 1.
/// Priority 0 is reserved for a core's idle task.
pub const NUM_PRIORITIES: usize = 32;

/// Maximum number of timers tracked by the hi-res timer wheel
/// ([`crate::hirestimer`]) when the `hires_timers` feature is enabled.
pub const MAX_HIRES_TIMERS: usize = 16;

/// Number of cores. This kernel targets exactly a dual-core part; ports that
/// are compiled without `multi_core` still see this as `1` for the purpose
/// of sizing per-core arrays, with core 1 simply left unused.
pub const NUM_CORES: usize = 2;

/// Depth of the inter-core message ring used by [`crate::ipc`] per
/// direction.
pub const IPC_RING_LEN: usize = 8;

/// Depth of the migration-request ring used by [`crate::smp`].
pub const MIGRATION_RING_LEN: usize = 8;

/// Maximum number of simultaneously-registered mutexes ([`crate::mutex`]).
pub const MAX_MUTEXES: usize = 16;

/// Maximum number of simultaneously-registered counting semaphores
/// ([`crate::semaphore`]).
pub const MAX_SEMAPHORES: usize = 16;

/// Maximum number of simultaneously-registered message queues
/// ([`crate::queue`]).
pub const MAX_QUEUES: usize = 8;

/// Maximum number of simultaneously-registered event sets
/// ([`crate::event`]).
pub const MAX_EVENT_SETS: usize = 8;

/// Maximum number of simultaneously-registered fixed-block memory pools
/// ([`crate::mempool`]).
pub const MAX_MEMPOOLS: usize = 4;

/// Maximum number of fixed-size blocks a single memory pool can carve its
/// backing region into ([`crate::mempool`]).
pub const MAX_MEMPOOL_BLOCKS: usize = 64;

/// Runtime (not array-sizing) configuration, supplied once at
/// [`crate::Kernel::new`].
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Scheduler tick frequency in Hz. Default 1000 (1 ms tick).
    pub tick_rate_hz: u32,
    /// SMP load balancer imbalance threshold, percent. Default 20.
    pub load_balance_threshold_pct: u8,
    /// SMP load balancer period in microseconds. Default 100_000 (100 ms).
    pub load_balance_period_us: u64,
    /// Watchdog timeout in microseconds. Default 5_000_000 (5 s).
    pub watchdog_timeout_us: u64,
    /// Health monitor polling interval in microseconds. Default 1_000_000.
    pub health_check_interval_us: u64,
    /// Missed heartbeats before a core is declared `Failed`. Default 3.
    pub max_missed_heartbeats: u8,
    /// Recovery poll timeout in microseconds. Default 10_000_000 (10 s).
    pub recovery_timeout_us: u64,
    /// Whether to attempt in-place recovery before degrading to single-core.
    pub auto_recovery: bool,
    /// Whether a permanently-unrecoverable core should trigger single-core
    /// degradation (vs. leaving the system halted).
    pub graceful_degradation: bool,
    /// Whether same-priority ready tasks round-robin on a tick budget.
    pub time_slice_enabled: bool,
    /// Ticks a task may run before yielding to the next same-priority task,
    /// when `time_slice_enabled`. Default 10.
    pub time_slice_ticks: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 1000,
            load_balance_threshold_pct: 20,
            load_balance_period_us: 100_000,
            watchdog_timeout_us: 5_000_000,
            health_check_interval_us: 1_000_000,
            max_missed_heartbeats: 3,
            recovery_timeout_us: 10_000_000,
            auto_recovery: true,
            graceful_degradation: true,
            time_slice_enabled: true,
            time_slice_ticks: 10,
        }
    }
}
