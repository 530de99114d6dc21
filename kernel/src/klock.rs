//! Kernel state locking.
//!
//! The teacher (`r3_kernel::klock`) proves CPU-Lock possession at compile
//! time via the `tokenlock` crate's generic keyhole mechanism, because a
//! single `r3_kernel` binary is monomorphized over an open set of ports. We
//! target exactly one hardware family, so the same proof-token idea is
//! implemented directly: [`CpuLockToken`] is a zero-sized, `!Send + !Sync`
//! capability that [`lock_cpu`] is the only safe way to produce, and
//! [`KCell::get`]/[`with`] require one by reference. This is the same shape
//! `critical_section::Mutex` uses for a single global critical section; we
//! need our own type because a held [`CrossCoreLock`] must also vouch for a
//! [`CpuLockToken`] (composing both proofs), which `critical-section`'s
//! upstream type doesn't model.
use core::{cell::UnsafeCell, marker::PhantomData, ops::Deref};

use crate::hal::Hal;

/// Proof that the calling core currently holds CPU Lock (interrupts masked
/// on this core). Cannot be constructed outside this module; see
/// [`lock_cpu`].
pub struct CpuLockToken<H: Hal> {
    _not_send_sync: PhantomData<*const H>,
}

/// RAII guard for a per-core CPU Lock, acquired via [`lock_cpu`]. Dropping
/// it (including via unwind) releases the lock, per §4.1's "release on all
/// exit paths" guarantee.
pub struct CpuLockGuard<H: Hal> {
    token: CpuLockToken<H>,
}

impl<H: Hal> CpuLockGuard<H> {
    #[inline]
    pub fn token(&self) -> &CpuLockToken<H> {
        &self.token
    }
}

impl<H: Hal> Drop for CpuLockGuard<H> {
    fn drop(&mut self) {
        // Safety: this guard is the unique witness that we hold CPU Lock.
        unsafe { H::leave_cpu_lock() };
    }
}

/// Enters a per-core CPU Lock state, masking interrupts on the calling
/// core, and returns an RAII guard from which a [`CpuLockToken`] can be
/// borrowed.
#[inline]
pub fn lock_cpu<H: Hal>() -> CpuLockGuard<H> {
    // Safety: paired with `Drop::drop` on the returned guard.
    unsafe { H::enter_cpu_lock() };
    CpuLockGuard {
        token: CpuLockToken {
            _not_send_sync: PhantomData,
        },
    }
}

/// Assumes CPU Lock is already active (e.g. we're in an ISR that the port
/// guarantees runs with interrupts masked) and manufactures a token for it
/// without re-entering.
///
/// # Safety
/// CPU Lock must genuinely be active on the calling core, and no other
/// [`CpuLockToken`]/[`CpuLockGuard`] may be alive concurrently.
#[inline]
pub unsafe fn assume_cpu_lock<H: Hal>() -> CpuLockToken<H> {
    debug_assert!(H::is_cpu_lock_active());
    CpuLockToken {
        _not_send_sync: PhantomData,
    }
}

/// A cell accessible only while holding a [`CpuLockToken`]. Every piece of
/// kernel object state lives in one of these; see the per-object "critical
/// section guarding exactly its fields" rule in §5.
pub struct KCell<H: Hal, T> {
    value: UnsafeCell<T>,
    _hal: PhantomData<H>,
}

// Safety: all access is gated by possession of a `CpuLockToken`, which is
// itself only obtainable while holding the lock that serializes access.
unsafe impl<H: Hal, T: Send> Sync for KCell<H, T> {}

impl<H: Hal, T> KCell<H, T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
            _hal: PhantomData,
        }
    }

    #[inline]
    pub fn get(&self, _tok: &CpuLockToken<H>) -> T
    where
        T: Copy,
    {
        // Safety: `_tok` proves exclusive access.
        unsafe { *self.value.get() }
    }

    #[inline]
    pub fn read(&self, _tok: &CpuLockToken<H>) -> &T {
        // Safety: `_tok` proves exclusive access for the lifetime of the
        // borrow (the token can't outlive the lock).
        unsafe { &*self.value.get() }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn write(&self, _tok: &CpuLockToken<H>) -> &mut T {
        // Safety: `_tok` proves exclusive access.
        unsafe { &mut *self.value.get() }
    }

    #[inline]
    pub fn set(&self, tok: &CpuLockToken<H>, value: T) {
        *self.write(tok) = value;
    }

    #[inline]
    pub fn replace(&self, tok: &CpuLockToken<H>, value: T) -> T {
        core::mem::replace(self.write(tok), value)
    }

    #[inline]
    pub fn with<R>(&self, tok: &CpuLockToken<H>, f: impl FnOnce(&mut T) -> R) -> R {
        f(self.write(tok))
    }
}

/// Proof that the calling core holds the recursive cross-core lock *and*,
/// transitively, CPU Lock (acquiring the cross-core lock always also masks
/// local interrupts — see §5's lock order, global lock outermost).
pub struct CrossCoreLockToken<H: Hal> {
    cpu: CpuLockToken<H>,
}

impl<H: Hal> Deref for CrossCoreLockToken<H> {
    type Target = CpuLockToken<H>;
    fn deref(&self) -> &Self::Target {
        &self.cpu
    }
}

const SMP_SPINLOCK_INDEX: u8 = 31;
const SMP_SPIN_BUDGET: u32 = 10_000;

/// The global recursive cross-core critical section (§4.1, §5). Exclusive
/// across cores, recursive for the owning core, tracks lock depth and
/// contention for observability.
pub struct CrossCoreLock<H: Hal> {
    /// Owning core index + 1, or 0 if unowned. Only ever touched while
    /// holding per-core CPU Lock, so plain atomics aren't needed; the
    /// hardware spinlock is what provides cross-core exclusion.
    owner_depth: core::sync::atomic::AtomicU32,
    contention_count: core::sync::atomic::AtomicU32,
    _hal: PhantomData<H>,
}

impl<H: Hal> CrossCoreLock<H> {
    pub const fn new() -> Self {
        Self {
            owner_depth: core::sync::atomic::AtomicU32::new(0),
            contention_count: core::sync::atomic::AtomicU32::new(0),
            _hal: PhantomData,
        }
    }

    /// Acquires the cross-core lock, recursing if the calling core already
    /// holds it. Always also holds CPU Lock on return (see the lock-order
    /// note on [`CrossCoreLockToken`]).
    pub fn lock(&self) -> CrossCoreLockGuard<'_, H> {
        use core::sync::atomic::Ordering;

        let cpu_guard = lock_cpu::<H>();
        let core = H::current_core().index() as u32;
        let packed = self.owner_depth.load(Ordering::Relaxed);
        let (owner, depth) = unpack(packed);

        let recursed = if depth > 0 && owner == core {
            // Already ours on this core; CPU Lock already serializes
            // against same-core reentry, just bump the depth.
            self.owner_depth
                .store(pack(core, depth + 1), Ordering::Relaxed);
            true
        } else {
            if depth > 0 {
                self.contention_count.fetch_add(1, Ordering::Relaxed);
            }
            // Safety: acquiring the hardware spinlock that backs this lock.
            while !unsafe { H::try_acquire_hw_spinlock(SMP_SPINLOCK_INDEX, SMP_SPIN_BUDGET) } {
                core::hint::spin_loop();
            }
            self.owner_depth.store(pack(core, 1), Ordering::Relaxed);
            false
        };

        CrossCoreLockGuard {
            lock: self,
            cpu_guard,
            acquired_hw: !recursed,
        }
    }

    pub fn contention_count(&self) -> u32 {
        self.contention_count.load(core::sync::atomic::Ordering::Relaxed)
    }
}

impl<H: Hal> Default for CrossCoreLock<H> {
    fn default() -> Self {
        Self::new()
    }
}

fn pack(owner: u32, depth: u32) -> u32 {
    (owner << 24) | depth
}

fn unpack(packed: u32) -> (u32, u32) {
    (packed >> 24, packed & 0x00FF_FFFF)
}

/// RAII guard for [`CrossCoreLock::lock`].
pub struct CrossCoreLockGuard<'a, H: Hal> {
    lock: &'a CrossCoreLock<H>,
    cpu_guard: CpuLockGuard<H>,
    acquired_hw: bool,
}

impl<'a, H: Hal> CrossCoreLockGuard<'a, H> {
    pub fn token(&self) -> CrossCoreLockToken<H> {
        CrossCoreLockToken {
            cpu: CpuLockToken {
                _not_send_sync: PhantomData,
            },
        }
    }
}

impl<'a, H: Hal> Drop for CrossCoreLockGuard<'a, H> {
    fn drop(&mut self) {
        use core::sync::atomic::Ordering;
        if self.acquired_hw {
            let packed = self.lock.owner_depth.load(Ordering::Relaxed);
            let (owner, depth) = unpack(packed);
            if depth <= 1 {
                self.lock.owner_depth.store(0, Ordering::Relaxed);
                // Safety: releasing the spinlock we acquired in `lock`.
                unsafe { H::release_hw_spinlock(SMP_SPINLOCK_INDEX) };
            } else {
                self.lock.owner_depth.store(pack(owner, depth - 1), Ordering::Relaxed);
            }
        } else {
            let packed = self.lock.owner_depth.load(Ordering::Relaxed);
            let (owner, depth) = unpack(packed);
            self.lock.owner_depth.store(pack(owner, depth - 1), Ordering::Relaxed);
        }
        // `cpu_guard`'s own `Drop` now releases CPU Lock.
        let _ = &self.cpu_guard;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{lock_test, MockHal};

    #[test]
    fn cpu_lock_is_active_only_while_guard_is_held() {
        let _g = lock_test();
        assert!(!MockHal::is_cpu_lock_active());
        let guard = lock_cpu::<MockHal>();
        assert!(MockHal::is_cpu_lock_active());
        drop(guard);
        assert!(!MockHal::is_cpu_lock_active());
    }

    #[test]
    fn kcell_round_trips_through_get_set_write_replace() {
        let _g = lock_test();
        let guard = lock_cpu::<MockHal>();
        let tok = guard.token();

        let cell: KCell<MockHal, u32> = KCell::new(1);
        assert_eq!(cell.get(tok), 1);

        cell.set(tok, 2);
        assert_eq!(cell.get(tok), 2);

        *cell.write(tok) += 10;
        assert_eq!(cell.get(tok), 12);

        let old = cell.replace(tok, 100);
        assert_eq!(old, 12);
        assert_eq!(cell.get(tok), 100);

        cell.with(tok, |v| *v += 1);
        assert_eq!(cell.get(tok), 101);
    }

    #[test]
    fn cross_core_lock_recurses_on_the_owning_core_without_contention() {
        let _g = lock_test();
        let lock: CrossCoreLock<MockHal> = CrossCoreLock::new();

        let outer = lock.lock();
        let inner = lock.lock();
        assert_eq!(lock.contention_count(), 0);
        drop(inner);
        drop(outer);
    }
}
