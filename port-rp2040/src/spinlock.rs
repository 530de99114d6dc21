//! RP2040 SIO hardware spinlocks, backing `rtk_kernel::klock::CrossCoreLock`.
//!
//! Each of the 32 `SIO_BASE + SPINLOCK0..31` registers reads as nonzero
//! (claimed) the first time after being free and zero on every subsequent
//! read until something writes to it (any value) to release it -- the
//! classic test-and-set-via-read semantics the RP2040 datasheet describes
//! for this block. `rtk-kernel` only ever uses index 31 (reserved for the
//! cross-core lock, see `klock::SMP_SPINLOCK_INDEX`), but this takes an
//! index per `Hal::try_acquire_hw_spinlock`'s general signature.
#[inline]
fn sio() -> &'static rp2040_pac::sio::RegisterBlock {
    unsafe { &*rp2040_pac::SIO::ptr() }
}

/// # Safety
/// Only `rtk_kernel::klock` calls this.
pub unsafe fn try_acquire(index: u8, max_spins: u32) -> bool {
    let reg = spinlock_reg(index);
    for _ in 0..max_spins {
        // Safety: reading a SPINLOCK register is always defined; a nonzero
        // result means we just claimed it.
        if unsafe { reg.read_volatile() } != 0 {
            return true;
        }
        core::hint::spin_loop();
    }
    false
}

/// # Safety
/// Must be paired with a preceding successful `try_acquire` of the same
/// `index`, on the same core.
pub unsafe fn release(index: u8) {
    let reg = spinlock_reg(index);
    // Safety: any write releases the lock; value is ignored by hardware.
    unsafe { reg.write_volatile(1) };
}

fn spinlock_reg(index: u8) -> *mut u32 {
    let sio = sio();
    // `spinlock` is modeled as a 32-entry register array in `rp2040-pac`.
    sio.spinlock[index as usize].as_ptr()
}
