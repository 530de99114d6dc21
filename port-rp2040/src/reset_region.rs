//! Placement for `rtk_kernel::health::ResetRecoveryRegion` (§6).
//!
//! RP2040 SRAM is left untouched by a watchdog-triggered reset -- only
//! power-on/brownout actually clears it -- so a plain statically-allocated
//! instance, kept out of the zero-init `.bss` pass via its own linker
//! section (the same trick the teacher's `BOOT_LOADER` uses for
//! `.boot_loader`, just targeting a retained-RAM section instead of flash),
//! is enough; no scratch registers needed.
use rtk_kernel::health::ResetRecoveryRegion;

#[link_section = ".uninit.reset_recovery"]
pub static mut RESET_RECOVERY: ResetRecoveryRegion = ResetRecoveryRegion::new();

/// # Safety
/// Exclusive access to `RESET_RECOVERY` for the duration of the borrow is
/// the caller's responsibility; in practice this is read once at boot
/// before any task touches it.
pub unsafe fn region() -> &'static mut ResetRecoveryRegion {
    unsafe { &mut *core::ptr::addr_of_mut!(RESET_RECOVERY) }
}
