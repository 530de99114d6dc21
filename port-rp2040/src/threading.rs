//! Context switch trampoline and task-stack bring-up for Cortex-M0+.
//!
//! `rtk_kernel::Kernel::check_preemption` calls [`Hal::context_switch`]
//! synchronously, from whatever context asked for a reschedule (a task
//! calling `yield_now`, or the tick ISR discovering a higher-priority task
//! ready) rather than deferring to a PendSV-equivalent exception the way
//! `r3_port_arm_m` does. So instead of riding EXC_RETURN, this is a plain
//! callee-saved-register-and-stack-pointer swap: the same technique
//! stackful-coroutine crates use to switch fibers. A switch requested from
//! inside a real hardware exception (the SysTick or FIFO ISR calling into
//! `tick_handler`) leaves that exception's NVIC active bit set until the
//! interrupted task's slice eventually runs back out through it again --
//! harmless under this kernel's flat interrupt-priority setup, but worth
//! flagging before anyone layers nested interrupt priorities on top; see
//! DESIGN.md.
use core::arch::asm;

use rtk_kernel::hal::CoreId;
use rtk_kernel::task::TaskCb;

use crate::BoardHal;

/// Swaps the machine stack pointer and callee-saved registers (r4-r11)
/// between `prev_sp_slot` and `next_sp_slot`, both addresses of a saved
/// `usize` stack pointer. `prev_sp_slot == 0` means there is no previous
/// task to save (the very first dispatch on this core).
///
/// Mirrors the save/restore shape of `r3_port_arm_m`'s PendSV handler body,
/// minus the EXC_RETURN/CONTROL bookkeeping that only matters when the
/// switch rides an actual hardware exception return -- see the module doc.
#[naked]
unsafe extern "C" fn raw_switch(prev_sp_slot: usize, next_sp_slot: usize) {
    unsafe {
        asm!(
            "
            push {{r4-r7, lr}}
            mov r4, r8
            mov r5, r9
            mov r6, r10
            mov r7, r11
            push {{r4-r7}}

            cmp r0, #0
            beq 1f
            mov r2, sp
            str r2, [r0]
        1:
            ldr r2, [r1]
            mov sp, r2

            pop {{r4-r7}}
            mov r8, r4
            mov r9, r5
            mov r10, r6
            mov r11, r7
            pop {{r4-r7, pc}}
            ",
            options(noreturn)
        )
    }
}

/// Entered by `raw_switch`'s final `pop {{..., pc}}` for a freshly-prepared
/// task: r4 holds the entry parameter, r5 the entry function, r6 the exit
/// trampoline to return to if the entry function ever returns.
#[naked]
unsafe extern "C" fn task_entry_trampoline() -> ! {
    unsafe {
        asm!(
            "
            mov lr, r6
            mov r0, r4
            bx r5
            ",
            options(noreturn)
        )
    }
}

extern "C" fn task_exit_trampoline() -> ! {
    panic!("task entry function returned");
}

/// Saves `prev`'s context (if any) and resumes `next`. See [`Hal::context_switch`].
///
/// # Safety
/// Same preconditions as `Hal::context_switch`: CPU Lock held, `prev`/`next`
/// valid for the call's duration.
pub unsafe fn context_switch(prev: Option<&'static TaskCb<BoardHal>>, next: &'static TaskCb<BoardHal>) {
    let prev_sp_slot = match prev {
        Some(p) => p.port_state.sp.get() as usize,
        None => 0,
    };
    let next_sp_slot = next.port_state.sp.get() as usize;
    unsafe { raw_switch(prev_sp_slot, next_sp_slot) };
}

/// Fabricates `task`'s initial saved context so the next `context_switch`
/// into it starts `entry(entry_param)` on its own stack. See
/// `r3_port_arm_m::threading::imp::State::initialize_task_state` for the
/// armv6m exception-frame analogue this plain-call version simplifies away.
///
/// # Safety
/// `task`'s stack region must be valid, sized correctly, and not in use.
pub unsafe fn prepare_task_stack(task: &'static TaskCb<BoardHal>) {
    let guard = rtk_kernel::klock::lock_cpu::<BoardHal>();
    let tok = guard.token();

    let stack_base = task.stack_base(tok);
    let stack_size = task.stack_size(tok);
    let entry = task.entry(tok);
    let entry_param = task.entry_param(tok);

    // Top of the stack, 8-byte aligned per AAPCS.
    let top = (stack_base as usize + stack_size) & !0b111;
    // 9 words: [r8, r9, r10, r11, r4, r5, r6, r7, pc].
    let frame = (top - 9 * core::mem::size_of::<usize>()) as *mut usize;

    unsafe {
        frame.add(0).write(0); // r8
        frame.add(1).write(0); // r9
        frame.add(2).write(0); // r10
        frame.add(3).write(0); // r11
        frame.add(4).write(entry_param); // r4: entry parameter
        frame.add(5).write(entry as usize); // r5: entry function
        frame.add(6).write(task_exit_trampoline as usize); // r6: exit trampoline
        frame.add(7).write(0); // r7: unused
        frame.add(8).write(task_entry_trampoline as usize); // pc

        *task.port_state.sp.get() = frame as usize;
    }
}

/// Nudges `core` (always the *other* core; `check_preemption` performs the
/// local-core switch itself) to re-evaluate its ready queue. There's no way
/// to set another Cortex-M0+ core's NVIC pending bit directly, so this
/// rides the same SIO FIFO doorbell `crate::ipc` uses -- the other core's
/// FIFO IRQ handler (installed by the application) drains the hardware FIFO
/// and calls `Kernel::check_preemption` unconditionally.
///
/// # Safety
/// Only the scheduler calls this.
pub unsafe fn request_reschedule(_core: CoreId) {
    let _ = crate::fifo::try_send(rtk_kernel::hal::RawFifoWord(0));
}
