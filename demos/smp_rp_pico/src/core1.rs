//! Core1 boot and its single worker task: resets core1, hands it a vector
//! table and entry point over the SIO FIFO (the SDK's
//! `multicore_launch_core1_raw` handshake, wrapped by
//! `rtk_port_rp2040::boot::core1_launch`), then lets it create its own task
//! and fall into the scheduler.
use rtk_kernel::hal::CoreId;
use rtk_kernel::task::{Affinity, TaskAttr};

use crate::core0::KERNEL;

static mut WORKER_TASK_STACK: [u8; 1024] = [0; 1024];

#[repr(C, align(128))]
struct VectorTable([unsafe extern "C" fn(); 48]);

extern "C" fn unhandled_exception() {
    panic!("core1: unhandled exception");
}

/// Core1's own NVIC vector table. Slot 0 would normally hold the initial
/// main-stack-pointer value, but the bootrom takes that straight from the
/// FIFO handshake instead, so it's left as `unhandled_exception` here too --
/// it's only ever read if something forces a second core1 reset through
/// this table rather than through `core1_launch`. Slot 14 (PendSV on a
/// normal Cortex-M port) goes unused: `rtk_port_rp2040::threading` switches
/// contexts synchronously rather than through a pendable exception, so
/// there's no handler to install there.
static CORE1_VECTOR_TABLE: VectorTable = {
    let mut table = [unhandled_exception as unsafe extern "C" fn(); 48];
    table[15] = core1_systick as unsafe extern "C" fn();
    // IRQ16 = SIO_IRQ_PROC1, core1's half of the inter-processor FIFO IRQ.
    table[16 + 16] = core1_sio_irq as unsafe extern "C" fn();
    VectorTable(table)
};

extern "C" fn core1_entry() -> ! {
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        scb.vtor.write(&CORE1_VECTOR_TABLE as *const _ as u32);
    }

    // `cortex_m::Peripherals::take()`'s one-shot guard is a single static
    // shared across both cores' address space, already consumed by core0;
    // `steal()` is the documented multicore escape hatch since SYST/NVIC are
    // genuinely separate per-core registers at the same PPB address.
    let mut cp = unsafe { cortex_m::Peripherals::steal() };
    cp.SYST.set_clock_source(cortex_m::peripheral::syst::SystClkSource::External);
    cp.SYST.set_reload(1_000_000 / 1000 - 1);
    cp.SYST.clear_current();
    cp.SYST.enable_counter();
    cp.SYST.enable_interrupt();
    unsafe {
        cp.NVIC.set_priority(rp2040_pac::Interrupt::SIO_IRQ_PROC1, 0x80);
        cortex_m::peripheral::NVIC::unmask(rp2040_pac::Interrupt::SIO_IRQ_PROC1);
    }

    let worker = KERNEL
        .create_task(TaskAttr {
            name: "worker",
            entry: worker_task,
            entry_param: 0,
            stack_base: unsafe { WORKER_TASK_STACK.as_mut_ptr() },
            stack_size: unsafe { WORKER_TASK_STACK.len() },
            base_priority: 8,
            affinity: Affinity::Core1,
        })
        .expect("create_task(worker)");
    KERNEL.activate_task(worker).expect("activate_task(worker)");

    KERNEL.start(CoreId::Core1)
}

fn worker_task(_arg: usize) {
    loop {
        KERNEL.health_heartbeat(CoreId::Core1);
        KERNEL.health_feed_watchdog(CoreId::Core1);

        let sent = KERNEL.ipc_send(CoreId::Core0, rtk_kernel::ipc::MsgKind::UserDefined, 0, 0, 0);
        if !sent {
            log::warn!("core1: ipc ring to core0 full");
        }

        KERNEL.yield_now();
    }
}

/// Resets and boots core1. Must be called exactly once, from core0, before
/// `core0::run` starts its own scheduler.
pub fn launch(sio: &rp2040_pac::SIO, psm: &rp2040_pac::PSM) {
    extern "C" {
        static _core1_stack_start: u32;
    }
    let stack_top = unsafe { core::ptr::addr_of!(_core1_stack_start) as usize };
    let vector_table = &CORE1_VECTOR_TABLE as *const _ as usize;

    unsafe {
        rtk_port_rp2040::boot::core1_launch(sio, psm, vector_table, stack_top, core1_entry);
    }
}

extern "C" fn core1_systick() {
    rtk_port_rp2040::timebase::on_systick_tick();
    KERNEL.tick_handler();
}

extern "C" fn core1_sio_irq() {
    while rtk_port_rp2040::fifo::try_recv().is_some() {}
    KERNEL.check_preemption(CoreId::Core1);
}
