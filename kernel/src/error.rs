//! Kernel error taxonomy (§7). No operation panics or unwinds on a
//! recoverable condition; every fallible kernel call returns one of these.
//!
//! Grounded in `r3_kernel::error`'s `define_suberror!` macro, which builds a
//! family of small per-operation error enums that all convert into one
//! another via a shared superset. We don't need the macro's code-generation
//! machinery (that exists in the teacher to let each kernel entry point
//! expose only the subset of variants it can actually produce, verified at
//! the API surface) — a single flat [`KernelError`] plus a handful of
//! `From` impls for the primitive-specific errors gets the same "can't
//! construct a variant that operation can't produce" property cheaply
//! enough at this scale, without the proc-macro dependency.

use core::fmt;

/// The six-category taxonomy from §7. Every other error type in this crate
/// is either this type directly or converts into it via [`From`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No free object/slot/block/descriptor (`MAX_TASKS` exhausted, memory
    /// pool exhausted, hi-res timer table full, ...).
    Resource(ResourceError),
    /// A caller-supplied value is out of range or otherwise invalid.
    Parameter(ParameterError),
    /// The target object is in a state that does not accept this operation
    /// (deleting a still-running task, unlocking a mutex you don't own, ...).
    State(StateError),
    /// A timeout elapsed before the operation could complete.
    Timing(TimingError),
    /// An internal consistency check failed (corrupted free list, dangling
    /// link, priority-bitmap/list disagreement, ...). Always logged via
    /// `log::error!` before propagating; see §7 and `crate::Kernel::fail`.
    Integrity(IntegrityError),
    /// Unrecoverable: both cores confirmed failed, or a failure during
    /// failure handling itself. The kernel does not attempt to continue
    /// scheduling after returning this.
    Fatal(FatalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    NoFreeTaskSlot,
    MemoryPoolExhausted,
    NoFreeTimerSlot,
    QueueFull,
    /// A mutex/semaphore/queue/event-set pool has no free slot left.
    NoFreeObjectSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterError {
    BadPriority,
    BadBlockSize,
    BadTimeout,
    UnknownTaskId,
    UnknownObjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    TaskNotDormant,
    TaskAlreadyActive,
    TaskStillRunning,
    NotLockOwner,
    AlreadyLocked,
    QueueEmpty,
    WouldDeadlock,
    /// `task_suspend` called on a task that can't be suspended (`Dormant`
    /// or `Terminated`).
    TaskNotSuspendable,
    /// `task_resume` called on a task with no outstanding suspend to undo.
    TaskNotSuspended,
    /// The object a caller was waiting on was destroyed out from under it.
    ObjectDeleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingError {
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityError {
    CorruptFreeList,
    CorruptWaitQueue,
    CorruptTimerList,
    DoubleFree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    AllCoresFailed,
    FailureDuringRecovery,
}

impl From<ResourceError> for KernelError {
    fn from(e: ResourceError) -> Self {
        KernelError::Resource(e)
    }
}
impl From<ParameterError> for KernelError {
    fn from(e: ParameterError) -> Self {
        KernelError::Parameter(e)
    }
}
impl From<StateError> for KernelError {
    fn from(e: StateError) -> Self {
        KernelError::State(e)
    }
}
impl From<TimingError> for KernelError {
    fn from(e: TimingError) -> Self {
        KernelError::Timing(e)
    }
}
impl From<IntegrityError> for KernelError {
    fn from(e: IntegrityError) -> Self {
        KernelError::Integrity(e)
    }
}
impl From<FatalError> for KernelError {
    fn from(e: FatalError) -> Self {
        KernelError::Fatal(e)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Resource(e) => write!(f, "resource exhausted: {:?}", e),
            KernelError::Parameter(e) => write!(f, "bad parameter: {:?}", e),
            KernelError::State(e) => write!(f, "bad state: {:?}", e),
            KernelError::Timing(e) => write!(f, "timing: {:?}", e),
            KernelError::Integrity(e) => write!(f, "integrity violation: {:?}", e),
            KernelError::Fatal(e) => write!(f, "fatal: {:?}", e),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Logs a `Parameter`/`State` error at `warn` and anything else at `error`,
/// per §7's "operational misuse is diagnosable, not silent" rule, then
/// passes the error through unchanged. Call at the point an error is about
/// to leave the kernel's public API, not at every internal propagation.
#[inline]
pub fn report(obj_kind: &str, obj_id: u32, err: KernelError) -> KernelError {
    match err {
        KernelError::Parameter(_) | KernelError::State(_) => {
            log::warn!("{obj_kind}#{obj_id}: {err}");
        }
        KernelError::Integrity(_) | KernelError::Fatal(_) => {
            log::error!("{obj_kind}#{obj_id}: {err}");
        }
        _ => {
            log::trace!("{obj_kind}#{obj_id}: {err}");
        }
    }
    err
}
