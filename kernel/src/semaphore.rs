//! Counting semaphores, built directly on [`crate::wait::WaitQueue`] with
//! no priority-inheritance machinery (that's `crate::mutex`'s job) — a
//! semaphore's wait queue only ever releases its highest-priority waiter
//! one `signal` at a time, per §4.5.
use crate::error::{KernelError, ParameterError, ResourceError};
use crate::hal::Hal;
use crate::klock::{CpuLockToken, KCell};
use crate::task::BlockReason;
use crate::timeout::{TIMEOUT_IMMEDIATE, TIMEOUT_INFINITE};
use crate::wait::WaitQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreHandle(u16);

struct SemaphoreCb<H: Hal> {
    in_use: KCell<H, bool>,
    count: KCell<H, u32>,
    max_count: KCell<H, u32>,
    waiters: WaitQueue<H>,
}

impl<H: Hal> SemaphoreCb<H> {
    const fn vacant() -> Self {
        Self {
            in_use: KCell::new(false),
            count: KCell::new(0),
            max_count: KCell::new(0),
            waiters: WaitQueue::new(),
        }
    }
}

pub struct SemaphorePool<H: Hal> {
    slots: [SemaphoreCb<H>; crate::cfg::MAX_SEMAPHORES],
}

impl<H: Hal> SemaphorePool<H> {
    pub const fn new() -> Self {
        Self {
            slots: [const { SemaphoreCb::vacant() }; crate::cfg::MAX_SEMAPHORES],
        }
    }
}

impl<H: Hal> crate::Kernel<H> {
    pub fn semaphore_create(&self, initial_count: u32, max_count: u32) -> Result<SemaphoreHandle, KernelError> {
        if initial_count > max_count {
            return Err(ParameterError::BadBlockSize.into());
        }
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self
            .semaphores
            .slots
            .iter()
            .position(|s| !s.in_use.get(tok))
            .ok_or(KernelError::from(ResourceError::NoFreeObjectSlot))?;
        let sem = &self.semaphores.slots[idx];
        sem.in_use.set(tok, true);
        sem.count.set(tok, initial_count);
        sem.max_count.set(tok, max_count);
        Ok(SemaphoreHandle(idx as u16))
    }

    pub fn semaphore_delete(&self, handle: SemaphoreHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let sem = self.semaphore(tok, handle)?;
        sem.in_use.set(tok, false);
        Ok(())
    }

    /// Releases one count, or hands it straight to the highest-priority
    /// waiter if one is blocked (§4.5's "signal never increments past a
    /// waiter"). Errors with [`StateError::QueueEmpty`] — reused here as the
    /// "would overflow `max_count`" condition — if the semaphore is already
    /// at its ceiling and nobody is waiting.
    pub fn semaphore_signal(&'static self, handle: SemaphoreHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let sem = self.semaphore(tok, handle)?;
        if sem.waiters.is_empty(tok) {
            let count = sem.count.get(tok);
            if count >= sem.max_count.get(tok) {
                return Err(ResourceError::QueueFull.into());
            }
            sem.count.set(tok, count + 1);
            Ok(())
        } else {
            self.wake_one(tok, &sem.waiters, Ok(()));
            drop(guard);
            self.check_preemption(H::current_core());
            Ok(())
        }
    }

    /// Takes one count, blocking up to `timeout_ms` if none is available.
    pub fn semaphore_wait(&'static self, handle: SemaphoreHandle, timeout_ms: u32) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self.semaphore_index(tok, handle)?;
        let sem = &self.semaphores.slots[idx];
        let count = sem.count.get(tok);
        if count > 0 {
            sem.count.set(tok, count - 1);
            return Ok(());
        }
        if timeout_ms == TIMEOUT_IMMEDIATE {
            return Err(crate::error::TimingError::TimedOut.into());
        }

        let core = H::current_core();
        let caller = self
            .core(core)
            .running
            .get(tok)
            .expect("semaphore_wait called with no running task");
        if timeout_ms != TIMEOUT_INFINITE {
            self.timeout_arm(tok, caller, timeout_ms, None);
        }
        self.block_on(tok, &sem.waiters, BlockReason::Semaphore);
        drop(guard);
        self.check_preemption(core);

        let guard2 = crate::klock::lock_cpu::<H>();
        let tok2 = guard2.token();
        self.tasks.get(caller).wait_result(tok2)
    }

    fn semaphore_index(&self, tok: &CpuLockToken<H>, handle: SemaphoreHandle) -> Result<usize, KernelError> {
        let idx = handle.0 as usize;
        if self.semaphores.slots[idx].in_use.get(tok) {
            Ok(idx)
        } else {
            Err(ParameterError::UnknownObjectId.into())
        }
    }

    fn semaphore(&self, tok: &CpuLockToken<H>, handle: SemaphoreHandle) -> Result<&SemaphoreCb<H>, KernelError> {
        let idx = self.semaphore_index(tok, handle)?;
        Ok(&self.semaphores.slots[idx])
    }
}

// Only the paths that never reach `block_on` are covered here; see
// `crate::mutex`'s test module doc comment for why.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{lock_test, MockHal};

    fn new_kernel() -> &'static crate::Kernel<MockHal> {
        Box::leak(Box::new(crate::Kernel::new(crate::cfg::KernelConfig::default())))
    }

    #[test]
    fn initial_count_above_max_is_rejected() {
        let _g = lock_test();
        let kernel = new_kernel();
        assert!(matches!(kernel.semaphore_create(2, 1), Err(_)));
    }

    #[test]
    fn wait_consumes_an_available_count() {
        let _g = lock_test();
        let kernel = new_kernel();
        let s = kernel.semaphore_create(1, 1).unwrap();
        kernel.semaphore_wait(s, TIMEOUT_IMMEDIATE).unwrap();
        // No count left, and nobody's waiting to hand it off to, so a
        // further immediate wait must time out rather than block.
        assert!(matches!(kernel.semaphore_wait(s, TIMEOUT_IMMEDIATE), Err(_)));
    }

    #[test]
    fn signal_increments_count_up_to_the_ceiling() {
        let _g = lock_test();
        let kernel = new_kernel();
        let s = kernel.semaphore_create(0, 1).unwrap();
        kernel.semaphore_signal(s).unwrap();
        kernel.semaphore_wait(s, TIMEOUT_IMMEDIATE).unwrap();
    }

    #[test]
    fn signal_past_the_ceiling_with_no_waiters_is_rejected() {
        let _g = lock_test();
        let kernel = new_kernel();
        let s = kernel.semaphore_create(1, 1).unwrap();
        assert!(matches!(kernel.semaphore_signal(s), Err(_)));
    }

    #[test]
    fn deleted_handle_is_rejected() {
        let _g = lock_test();
        let kernel = new_kernel();
        let s = kernel.semaphore_create(0, 1).unwrap();
        kernel.semaphore_delete(s).unwrap();
        assert!(matches!(kernel.semaphore_signal(s), Err(_)));
        assert!(matches!(kernel.semaphore_wait(s, TIMEOUT_IMMEDIATE), Err(_)));
    }
}
