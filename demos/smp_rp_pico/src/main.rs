//! Two-task, two-core demo: a Core0 task toggles the Pico's onboard LED on
//! a periodic software timer while a Core1 task blocks on a message queue
//! fed over `rtk_kernel::ipc`, with the health monitor and SMP load
//! balancer both running. Structured the way the teacher's
//! `examples/smp_rp_pico` splits `main.rs`/`core0.rs`/`core1.rs`: `main.rs`
//! only holds the second-stage bootloader and the reset entry point.
#![no_std]
#![no_main]

mod core0;
mod core1;
mod panic;

use cortex_m_rt::entry;

/// The second-stage bootloader the bootrom copies into SRAM and executes;
/// without it the chip can't even fetch `.text` out of QSPI flash.
#[link_section = ".boot_loader"]
#[used]
pub static BOOT_LOADER: [u8; 256] = rp2040_boot2::BOOT_LOADER;

#[entry]
fn main() -> ! {
    let p = unsafe { rp2040_pac::Peripherals::steal() };

    rtk_port_rp2040::boot::init_clocks(&p.CLOCKS, &p.XOSC, &p.PLL_SYS, &p.PLL_USB, &p.RESETS, &p.WATCHDOG);

    p.RESETS.reset.modify(|_, w| w.pads_bank0().set_bit().io_bank0().set_bit());
    p.RESETS.reset.modify(|_, w| w.pads_bank0().clear_bit().io_bank0().clear_bit());
    while p.RESETS.reset_done.read().pads_bank0().bit_is_clear() {}
    while p.RESETS.reset_done.read().io_bank0().bit_is_clear() {}

    let reset_reason = {
        let region = unsafe { rtk_port_rp2040::reset_region::region() };
        let reason = region.reset_reason(rtk_port_rp2040::watchdog::reset_was_watchdog());
        log::info!("boot: reset reason = {:?}", reason);
        reason
    };
    let _ = reset_reason;

    core1::launch(&p.SIO, &p.PSM);
    core0::run()
}
