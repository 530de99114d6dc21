//! A core-aware panic handler: core1 has no way to reach this demo's log
//! sink (there's no serial/USB stack wired up here, unlike the upstream
//! `usbstdio` support crate), so it just reports over `log` from whichever
//! core actually panicked and halts both.
use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    cortex_m::interrupt::disable();

    let sio = unsafe { &*rp2040_pac::SIO::ptr() };
    match sio.cpuid.read().bits() {
        0 => log::error!("core0 panicked: {}", info),
        1 => log::error!("core1 panicked: {}", info),
        _ => {}
    }

    loop {
        cortex_m::asm::nop();
    }
}
