//! The SIO inter-processor FIFO: a single 32-bit lane each direction between
//! the two Cortex-M0+ cores, used as the wakeup doorbell for `rtk_kernel`'s
//! `ipc` module and for `threading::request_reschedule`.
//!
//! Grounded in the teacher's own draining idiom (`examples/smp_rp_pico`'s
//! FIFO interrupt handler: `while sio.fifo_st.read().vld().bit_is_set() {
//! sio.fifo_rd.read() }`) and its `core1_launch`'s send-and-wait-for-echo
//! protocol (`while sio.fifo_st.read().rdy().bit_is_clear() {}` before a
//! write, `while sio.fifo_st.read().vld().bit_is_clear() {}` before a read).
use rtk_kernel::hal::RawFifoWord;

#[inline]
fn sio() -> &'static rp2040_pac::sio::RegisterBlock {
    unsafe { &*rp2040_pac::SIO::ptr() }
}

/// Pushes `word` onto this core's outgoing FIFO. Returns `false` if the
/// hardware FIFO is already full.
pub fn try_send(word: RawFifoWord) -> bool {
    let sio = sio();
    if sio.fifo_st.read().rdy().bit_is_clear() {
        return false;
    }
    sio.fifo_wr.write(|w| unsafe { w.bits(word.0) });
    true
}

/// Pops one word from this core's incoming FIFO, if any is pending.
pub fn try_recv() -> Option<RawFifoWord> {
    let sio = sio();
    if sio.fifo_st.read().vld().bit_is_clear() {
        return None;
    }
    Some(RawFifoWord(sio.fifo_rd.read().bits()))
}
