//! C2: fixed-block memory pools.
//!
//! Each pool carves a caller-supplied `&'static mut [u8]` region into
//! equal-size blocks and threads the free ones into a singly-linked list
//! *through the blocks themselves* (the first `usize` of a free block is
//! its next-free pointer) — the classic fixed-block-allocator trick, same
//! shape as `r3_kernel`'s `wrapping_fixedpool` but address-based rather
//! than arena-indexed, since blocks live in externally-supplied memory this
//! kernel doesn't otherwise arena-manage. A guard word (`MAGIC_FREE`)
//! precedes the free-list pointer in every free block, so `free` can detect
//! a double-free or an out-of-pool pointer before corrupting the list
//! (§4.2's explicit double-free requirement).
use core::ptr::NonNull;

use crate::cfg::MAX_MEMPOOLS;
use crate::error::{IntegrityError, KernelError, ParameterError, ResourceError, StateError};
use crate::hal::Hal;
use crate::klock::{CpuLockToken, KCell};
use crate::task::BlockReason;
use crate::timeout::{TIMEOUT_IMMEDIATE, TIMEOUT_INFINITE};
use crate::wait::WaitQueue;

const MAGIC_FREE: usize = 0x46_52_45_45; // "FREE" as bytes, read as a usize guard.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemPoolHandle(u16);

struct MemPoolCb<H: Hal> {
    in_use: KCell<H, bool>,
    base: KCell<H, *mut u8>,
    block_size: KCell<H, usize>,
    block_count: KCell<H, usize>,
    free_head: KCell<H, Option<NonNull<u8>>>,
    free_count: KCell<H, usize>,
    #[cfg(feature = "memory_tracking")]
    min_free_count: KCell<H, usize>,
    #[cfg(feature = "memory_tracking")]
    alloc_count: KCell<H, u32>,
    #[cfg(feature = "memory_tracking")]
    double_free_count: KCell<H, u32>,
    waiters: WaitQueue<H>,
}

// Safety: `free_head` is only ever dereferenced while holding CPU Lock, and
// the backing region is asserted caller-owned and unaliased at creation.
unsafe impl<H: Hal> Sync for MemPoolCb<H> {}

impl<H: Hal> MemPoolCb<H> {
    const fn vacant() -> Self {
        Self {
            in_use: KCell::new(false),
            base: KCell::new(core::ptr::null_mut()),
            block_size: KCell::new(0),
            block_count: KCell::new(0),
            free_head: KCell::new(None),
            free_count: KCell::new(0),
            #[cfg(feature = "memory_tracking")]
            min_free_count: KCell::new(0),
            #[cfg(feature = "memory_tracking")]
            alloc_count: KCell::new(0),
            #[cfg(feature = "memory_tracking")]
            double_free_count: KCell::new(0),
            waiters: WaitQueue::new(),
        }
    }
}

pub struct MemPoolPool<H: Hal> {
    slots: [MemPoolCb<H>; MAX_MEMPOOLS],
}

impl<H: Hal> MemPoolPool<H> {
    pub const fn new() -> Self {
        Self {
            slots: [const { MemPoolCb::vacant() }; MAX_MEMPOOLS],
        }
    }
}

/// Statistics reported by [`crate::Kernel::mempool_stats`] when
/// `memory_tracking` is enabled.
#[cfg(feature = "memory_tracking")]
#[derive(Debug, Clone, Copy)]
pub struct MemPoolStats {
    pub block_count: usize,
    pub free_count: usize,
    pub min_free_count: usize,
    pub alloc_count: u32,
    pub double_free_count: u32,
}

impl<H: Hal> crate::Kernel<H> {
    /// Creates a pool over `region`, split into `block_size`-byte blocks
    /// (rounded down; any remainder is unused padding). `block_size` must
    /// be at least `size_of::<usize>()` to hold the free-list guard plus
    /// next-pointer, and the pool must fit within
    /// [`crate::cfg::MAX_MEMPOOL_BLOCKS`] blocks.
    pub fn mempool_create(&self, region: &'static mut [u8], block_size: usize) -> Result<MemPoolHandle, KernelError> {
        let word = core::mem::size_of::<usize>();
        if block_size < 2 * word {
            return Err(ParameterError::BadBlockSize.into());
        }
        let block_count = region.len() / block_size;
        if block_count == 0 || block_count > crate::cfg::MAX_MEMPOOL_BLOCKS {
            return Err(ParameterError::BadBlockSize.into());
        }

        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let idx = self
            .mempools
            .slots
            .iter()
            .position(|p| !p.in_use.get(tok))
            .ok_or(KernelError::from(ResourceError::NoFreeObjectSlot))?;
        let pool = &self.mempools.slots[idx];

        let base = region.as_mut_ptr();
        pool.in_use.set(tok, true);
        pool.base.set(tok, base);
        pool.block_size.set(tok, block_size);
        pool.block_count.set(tok, block_count);
        pool.free_count.set(tok, block_count);
        #[cfg(feature = "memory_tracking")]
        {
            pool.min_free_count.set(tok, block_count);
            pool.alloc_count.set(tok, 0);
            pool.double_free_count.set(tok, 0);
        }

        // Thread every block onto the free list, guard word first.
        let mut head: Option<NonNull<u8>> = None;
        for i in (0..block_count).rev() {
            // Safety: `i * block_size + word*2 <= region.len()`, verified by
            // `block_count = region.len() / block_size` above.
            unsafe {
                let block = base.add(i * block_size);
                write_guard(block, MAGIC_FREE);
                write_next(block, head);
                head = Some(NonNull::new_unchecked(block));
            }
        }
        pool.free_head.set(tok, head);
        Ok(MemPoolHandle(idx as u16))
    }

    /// Deletes `handle`, releasing every task blocked in [`Self::mempool_alloc`]
    /// on it with [`StateError::ObjectDeleted`] rather than leaving them
    /// waiting on a pool that no longer exists (§4.2).
    pub fn mempool_delete(&'static self, handle: MemPoolHandle) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let pool = self.mempool(tok, handle)?;
        pool.in_use.set(tok, false);
        self.wake_all(tok, &pool.waiters, Err(StateError::ObjectDeleted.into()));
        drop(guard);
        self.check_preemption(H::current_core());
        Ok(())
    }

    /// Allocates one block, blocking up to `timeout_ms` if the pool is
    /// exhausted (§4.2). [`TIMEOUT_IMMEDIATE`] never blocks; [`TIMEOUT_INFINITE`]
    /// blocks forever. Blocks are fungible, so a woken waiter simply retries
    /// the fast path rather than being handed a specific block.
    pub fn mempool_alloc(&'static self, handle: MemPoolHandle, timeout_ms: u32) -> Result<NonNull<u8>, KernelError> {
        loop {
            let guard = crate::klock::lock_cpu::<H>();
            let tok = guard.token();
            let idx = self.mempool_index(tok, handle)?;
            let pool = &self.mempools.slots[idx];
            if let Some(block) = pool.free_head.get(tok) {
                // Safety: every block on the free list was validated at
                // `free` time (or freshly initialized at `mempool_create`)
                // to carry a valid next-pointer at its head.
                let next = unsafe { read_next(block.as_ptr()) };
                pool.free_head.set(tok, next);
                *pool.free_count.write(tok) -= 1;
                #[cfg(feature = "memory_tracking")]
                {
                    *pool.alloc_count.write(tok) += 1;
                    let fc = pool.free_count.get(tok);
                    if fc < pool.min_free_count.get(tok) {
                        pool.min_free_count.set(tok, fc);
                    }
                }
                return Ok(block);
            }

            if timeout_ms == TIMEOUT_IMMEDIATE {
                return Err(crate::error::TimingError::TimedOut.into());
            }

            let core = H::current_core();
            let caller = self
                .core(core)
                .running
                .get(tok)
                .expect("mempool_alloc called with no running task");
            if timeout_ms != TIMEOUT_INFINITE {
                self.timeout_arm(tok, caller, timeout_ms, None);
            }
            self.block_on(tok, &pool.waiters, BlockReason::MemoryPool);
            drop(guard);
            self.check_preemption(core);

            let guard2 = crate::klock::lock_cpu::<H>();
            let tok2 = guard2.token();
            let result = self.tasks.get(caller).wait_result(tok2);
            drop(guard2);
            result?;
            // Woken: loop back around and retry the fast path.
        }
    }

    /// Returns `block` to the pool, waking the highest-priority waiter (if
    /// any) so it can retry its own alloc (§4.2). Detects a double-free or an
    /// out-of-pool/misaligned pointer via the guard word and address-range
    /// check, returning [`IntegrityError::DoubleFree`] rather than
    /// corrupting the free list.
    pub fn mempool_free(&'static self, handle: MemPoolHandle, block: NonNull<u8>) -> Result<(), KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let pool = self.mempool(tok, handle)?;

        let base = pool.base.get(tok) as usize;
        let block_size = pool.block_size.get(tok);
        let block_count = pool.block_count.get(tok);
        let addr = block.as_ptr() as usize;
        let span = block_size * block_count;
        if addr < base || addr >= base + span || (addr - base) % block_size != 0 {
            return Err(IntegrityError::CorruptFreeList.into());
        }

        // Safety: `addr` was just verified to be block-aligned and within
        // the pool's region.
        let guard_word = unsafe { read_guard(block.as_ptr()) };
        if guard_word == MAGIC_FREE {
            #[cfg(feature = "memory_tracking")]
            {
                *pool.double_free_count.write(tok) += 1;
            }
            return Err(IntegrityError::DoubleFree.into());
        }

        // Safety: address validated above; writing the guard and next-
        // pointer reclaims the block for the free list.
        unsafe {
            write_guard(block.as_ptr(), MAGIC_FREE);
            write_next(block.as_ptr(), pool.free_head.get(tok));
        }
        pool.free_head.set(tok, Some(block));
        *pool.free_count.write(tok) += 1;

        let woke = self.wake_one(tok, &pool.waiters, Ok(()));
        drop(guard);
        if woke.is_some() {
            self.check_preemption(H::current_core());
        }
        Ok(())
    }

    pub fn mempool_block_size(&self, handle: MemPoolHandle) -> Result<usize, KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        Ok(self.mempool(tok, handle)?.block_size.get(tok))
    }

    #[cfg(feature = "memory_tracking")]
    pub fn mempool_stats(&self, handle: MemPoolHandle) -> Result<MemPoolStats, KernelError> {
        let guard = crate::klock::lock_cpu::<H>();
        let tok = guard.token();
        let pool = self.mempool(tok, handle)?;
        Ok(MemPoolStats {
            block_count: pool.block_count.get(tok),
            free_count: pool.free_count.get(tok),
            min_free_count: pool.min_free_count.get(tok),
            alloc_count: pool.alloc_count.get(tok),
            double_free_count: pool.double_free_count.get(tok),
        })
    }

    fn mempool_index(&self, tok: &CpuLockToken<H>, handle: MemPoolHandle) -> Result<usize, KernelError> {
        let idx = handle.0 as usize;
        if self.mempools.slots[idx].in_use.get(tok) {
            Ok(idx)
        } else {
            Err(ParameterError::UnknownObjectId.into())
        }
    }

    fn mempool(&self, tok: &CpuLockToken<H>, handle: MemPoolHandle) -> Result<&MemPoolCb<H>, KernelError> {
        let idx = self.mempool_index(tok, handle)?;
        Ok(&self.mempools.slots[idx])
    }
}

/// # Safety
/// `block` must point to at least `2 * size_of::<usize>()` valid bytes.
unsafe fn write_guard(block: *mut u8, value: usize) {
    unsafe { (block as *mut usize).write_unaligned(value) };
}

/// # Safety
/// `block` must point to at least `size_of::<usize>()` valid, initialized bytes.
unsafe fn read_guard(block: *mut u8) -> usize {
    unsafe { (block as *const usize).read_unaligned() }
}

/// # Safety
/// `block` must point to at least `2 * size_of::<usize>()` valid bytes.
unsafe fn write_next(block: *mut u8, next: Option<NonNull<u8>>) {
    let word = core::mem::size_of::<usize>();
    let ptr = next.map_or(core::ptr::null_mut(), |p| p.as_ptr()) as usize;
    unsafe { (block.add(word) as *mut usize).write_unaligned(ptr) };
}

/// # Safety
/// `block` must point to at least `2 * size_of::<usize>()` valid,
/// previously-`write_next`-initialized bytes.
unsafe fn read_next(block: *mut u8) -> Option<NonNull<u8>> {
    let word = core::mem::size_of::<usize>();
    let raw = unsafe { (block.add(word) as *const usize).read_unaligned() };
    NonNull::new(raw as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{lock_test, MockHal};

    fn new_kernel() -> &'static crate::Kernel<MockHal> {
        Box::leak(Box::new(crate::Kernel::new(crate::cfg::KernelConfig::default())))
    }

    fn region(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    #[test]
    fn block_size_below_two_words_is_rejected() {
        let _g = lock_test();
        let kernel = new_kernel();
        assert!(matches!(kernel.mempool_create(region(64), 1), Err(_)));
    }

    #[test]
    fn alloc_exhausts_then_free_makes_a_block_available_again() {
        let _g = lock_test();
        let kernel = new_kernel();
        let word = core::mem::size_of::<usize>();
        let block_size = 2 * word;
        let handle = kernel.mempool_create(region(block_size * 4), block_size).unwrap();

        let mut blocks = Vec::new();
        for _ in 0..4 {
            blocks.push(kernel.mempool_alloc(handle, TIMEOUT_IMMEDIATE).expect("pool not yet exhausted"));
        }
        assert!(matches!(kernel.mempool_alloc(handle, TIMEOUT_IMMEDIATE), Err(_)));

        kernel.mempool_free(handle, blocks.pop().unwrap()).unwrap();
        assert!(kernel.mempool_alloc(handle, TIMEOUT_IMMEDIATE).is_ok());
    }

    #[test]
    fn double_free_is_rejected() {
        let _g = lock_test();
        let kernel = new_kernel();
        let word = core::mem::size_of::<usize>();
        let block_size = 2 * word;
        let handle = kernel.mempool_create(region(block_size * 2), block_size).unwrap();

        let block = kernel.mempool_alloc(handle, TIMEOUT_IMMEDIATE).unwrap();
        kernel.mempool_free(handle, block).unwrap();
        assert!(matches!(kernel.mempool_free(handle, block), Err(_)));
    }

    #[test]
    fn freeing_a_pointer_outside_the_pool_is_rejected() {
        let _g = lock_test();
        let kernel = new_kernel();
        let word = core::mem::size_of::<usize>();
        let block_size = 2 * word;
        let handle = kernel.mempool_create(region(block_size * 2), block_size).unwrap();

        let mut stray = [0u8; 16];
        let bogus = NonNull::new(stray.as_mut_ptr()).unwrap();
        assert!(matches!(kernel.mempool_free(handle, bogus), Err(_)));
    }

    #[test]
    fn deleted_handle_is_rejected_by_every_operation() {
        let _g = lock_test();
        let kernel = new_kernel();
        let word = core::mem::size_of::<usize>();
        let block_size = 2 * word;
        let handle = kernel.mempool_create(region(block_size * 2), block_size).unwrap();
        kernel.mempool_delete(handle).unwrap();

        assert!(matches!(kernel.mempool_alloc(handle, TIMEOUT_IMMEDIATE), Err(_)));
        assert!(matches!(kernel.mempool_block_size(handle), Err(_)));
    }

    #[test]
    fn delete_wakes_blocked_waiters_with_object_deleted() {
        let _g = lock_test();
        let kernel = new_kernel();
        let word = core::mem::size_of::<usize>();
        let block_size = 2 * word;
        let handle = kernel.mempool_create(region(block_size), block_size).unwrap();

        // Exhaust the one block, then confirm an immediate alloc on the
        // empty pool times out rather than blocking forever.
        let _block = kernel.mempool_alloc(handle, TIMEOUT_IMMEDIATE).unwrap();
        assert!(matches!(kernel.mempool_alloc(handle, TIMEOUT_IMMEDIATE), Err(_)));

        kernel.mempool_delete(handle).unwrap();
        assert!(matches!(kernel.mempool_alloc(handle, TIMEOUT_IMMEDIATE), Err(_)));
    }
}
