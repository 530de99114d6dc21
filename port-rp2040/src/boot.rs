//! Early bring-up: clock configuration and the core1 launch sequence.
//! Adapted from `r3_support_rp2040::clock::init_clock` and
//! `examples/smp_rp_pico::core1::core1_launch` (the SDK's
//! `multicore_launch_core1_raw` handshake over the SIO FIFO).
use rp2040_pac::{CLOCKS, PLL_SYS, PLL_USB, PSM, RESETS, SIO, WATCHDOG, XOSC};

/// Configures clocks for a 12 MHz crystal board (the Raspberry Pi Pico):
/// `clk_ref` = 48 MHz, `clk_sys` = 125 MHz, and a 1 MHz reference fed to
/// SysTick and the watchdog tick generator (so `crate::timebase::now_us`
/// and `crate::watchdog`'s timeout units are both plain microseconds).
pub fn init_clocks(clocks: &CLOCKS, xosc: &XOSC, pll_sys: &PLL_SYS, pll_usb: &PLL_USB, resets: &RESETS, watchdog: &WATCHDOG) {
    clocks.clk_sys_resus_ctrl.write(|w| w.enable().clear_bit());

    clocks.clk_ref_ctrl.modify(|_, w| w.src().rosc_clksrc_ph());
    clocks.clk_sys_ctrl.modify(|_, w| w.src().clk_ref());
    while clocks.clk_ref_selected.read().bits() != 1 {}
    while clocks.clk_sys_selected.read().bits() != 1 {}

    resets.reset.modify(|_, w| w.pll_sys().set_bit().pll_usb().set_bit());
    resets.reset.modify(|_, w| w.pll_sys().clear_bit().pll_usb().clear_bit());
    while resets.reset_done.read().pll_sys().bit_is_clear() {}
    while resets.reset_done.read().pll_usb().bit_is_clear() {}

    const MHZ: u32 = 12;
    xosc.ctrl.write(|w| w.freq_range()._1_15mhz());
    xosc.startup.write(|w| unsafe { w.bits((MHZ * 1000 + 128) / 256) });
    xosc.ctrl.modify(|_, w| w.enable().enable());
    while xosc.status.read().stable().bit_is_clear() {}

    macro_rules! cfg_pll {
        ($pll:ident = $fbdiv:literal / $post_div1:literal / $post_div2:literal) => {
            $pll.pwr.write(|w| w.vcopd().set_bit().postdivpd().set_bit().dsmpd().set_bit().pd().set_bit());
            $pll.cs.write(|w| unsafe { w.refdiv().bits(1) });
            $pll.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits($fbdiv) });
            $pll.pwr.modify(|_, w| w.vcopd().clear_bit().pd().clear_bit());
            while $pll.cs.read().lock().bit_is_clear() {}
            $pll.prim.write(|w| unsafe { w.postdiv1().bits($post_div1).postdiv2().bits($post_div2) });
            $pll.pwr.modify(|_, w| w.postdivpd().clear_bit());
        };
    }
    cfg_pll!(pll_sys = 125 / 6 / 2);
    cfg_pll!(pll_usb = 40 / 5 / 2);

    clocks.clk_sys_ctrl.modify(|_, w| w.auxsrc().clksrc_pll_sys());
    clocks.clk_sys_ctrl.modify(|_, w| w.src().clksrc_clk_sys_aux());

    clocks.clk_ref_ctrl.modify(|_, w| w.auxsrc().clksrc_pll_usb());
    clocks.clk_ref_ctrl.modify(|_, w| w.src().clksrc_clk_ref_aux());

    watchdog.tick.write(|w| unsafe { w.cycles().bits(48) });

    clocks.clk_peri_ctrl.write(|w| w.auxsrc().clksrc_pll_usb().enable().set_bit());
}

/// Resets and boots core1 at `entry`, whose own stack top is `stack_top`
/// and whose vector table is `vector_table` (its slot 14, the PendSV-
/// equivalent reschedule exception's index, isn't used by this kernel --
/// see `threading`'s module doc -- but slot 0, the initial MSP, and slot 1,
/// the reset vector, must point at `entry`'s launch stub).
///
/// # Safety
///  - Must be called from core0.
///  - Must not be called more than once.
pub unsafe fn core1_launch(sio: &SIO, psm: &PSM, vector_table: usize, stack_top: usize, entry: extern "C" fn() -> !) {
    psm.frce_off.modify(|_, w| w.proc1().set_bit());
    while psm.frce_off.read().proc1().bit_is_clear() {}
    psm.frce_off.modify(|_, w| w.proc1().clear_bit());

    let cmd_seq = [0u32, 0, 1, vector_table as u32, stack_top as u32, entry as usize as u32];

    let mut it = cmd_seq.iter();
    while let Some(&cmd) = it.next() {
        if cmd == 0 {
            while sio.fifo_st.read().vld().bit_is_set() {
                sio.fifo_rd.read();
            }
            cortex_m::asm::sev();
        }

        while sio.fifo_st.read().rdy().bit_is_clear() {}
        sio.fifo_wr.write(|w| unsafe { w.bits(cmd) });
        cortex_m::asm::sev();

        while sio.fifo_st.read().vld().bit_is_clear() {
            cortex_m::asm::wfe();
        }
        let response = sio.fifo_rd.read().bits();

        if response != cmd {
            it = cmd_seq.iter();
        }
    }
}
