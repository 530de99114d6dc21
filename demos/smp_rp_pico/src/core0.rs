//! Core0's task set and interrupt bindings: one task blinks the Pico's
//! onboard LED on a periodic software timer, a second logs the shared
//! counter that timer callback increments under a mutex, and the tick/FIFO
//! ISRs drive the scheduler, the SMP load balancer and the health monitor.
use core::sync::atomic::{AtomicU32, Ordering};

use rtk_kernel::cfg::KernelConfig;
use rtk_kernel::hal::CoreId;
use rtk_kernel::health::FailureType;
use rtk_kernel::mutex::MutexHandle;
use rtk_kernel::task::{Affinity, TaskAttr};
use rtk_kernel::Kernel;
use rtk_port_rp2040::BoardHal;

/// Mirrors [`KernelConfig::default`]; not `const fn` upstream, so the
/// `static KERNEL` initializer spells the fields out itself.
const CONFIG: KernelConfig = KernelConfig {
    tick_rate_hz: 1000,
    load_balance_threshold_pct: 20,
    load_balance_period_us: 100_000,
    watchdog_timeout_us: 5_000_000,
    health_check_interval_us: 1_000_000,
    max_missed_heartbeats: 3,
    recovery_timeout_us: 10_000_000,
    auto_recovery: true,
    graceful_degradation: true,
    time_slice_enabled: true,
    time_slice_ticks: 10,
};

pub static KERNEL: Kernel<BoardHal> = Kernel::new(CONFIG);

static mut LED_TASK_STACK: [u8; 1024] = [0; 1024];
static mut MONITOR_TASK_STACK: [u8; 1024] = [0; 1024];

static COUNTER: AtomicU32 = AtomicU32::new(0);
static mut COUNTER_MUTEX: Option<MutexHandle> = None;

const LED_PIN: u32 = 25;

fn gpio_init_led() {
    let p = unsafe { rp2040_pac::Peripherals::steal() };
    p.SIO.gpio_oe_clr.write(|w| unsafe { w.bits(1 << LED_PIN) });
    p.SIO.gpio_out_clr.write(|w| unsafe { w.bits(1 << LED_PIN) });
    p.PADS_BANK0.gpio25.write(|w| w.ie().bit(true).od().bit(false));
    p.IO_BANK0.gpio25_ctrl.write(|w| w.funcsel().sio_25());
    p.SIO.gpio_oe_set.write(|w| unsafe { w.bits(1 << LED_PIN) });
}

fn gpio_toggle_led() {
    let p = unsafe { rp2040_pac::Peripherals::steal() };
    let set = p.SIO.gpio_out.read().bits() & (1 << LED_PIN) == 0;
    if set {
        p.SIO.gpio_out_set.write(|w| unsafe { w.bits(1 << LED_PIN) });
    } else {
        p.SIO.gpio_out_clr.write(|w| unsafe { w.bits(1 << LED_PIN) });
    }
}

/// Software timer callback (runs in CPU Lock, from `tick_handler`): bumps
/// the shared counter and flips the LED. Grabs the mutex with
/// `TIMEOUT_IMMEDIATE` semantics via `mutex_try_lock` since a timer
/// callback can't block.
fn blink_timer_callback(_arg: usize) {
    let handle = unsafe { COUNTER_MUTEX }.expect("timer fired before mutex_create");
    if KERNEL.mutex_try_lock(handle).is_ok() {
        COUNTER.fetch_add(1, Ordering::Relaxed);
        gpio_toggle_led();
        let _ = KERNEL.mutex_unlock(handle);
    }
}

fn led_task(_arg: usize) {
    let mutex = KERNEL.mutex_create().expect("mutex_create");
    unsafe { COUNTER_MUTEX = Some(mutex) };

    let timer = KERNEL
        .timer_init(None, "blink", blink_timer_callback, 0, 500, true)
        .expect("timer_init");
    KERNEL.timer_start(timer).expect("timer_start");

    KERNEL.health_start();

    loop {
        KERNEL.health_heartbeat(CoreId::Core0);
        KERNEL.health_feed_watchdog(CoreId::Core0);
        KERNEL.yield_now();
    }
}

fn monitor_task(_arg: usize) {
    loop {
        let n = COUNTER.load(Ordering::Relaxed);
        log::info!("core0: blink counter = {}", n);
        if let Some(msg) = KERNEL.ipc_receive(0) {
            log::info!("core0: ipc message from core1: {:?}", msg.kind);
        }
        KERNEL.yield_now();
    }
}

fn health_failure_callback(core: CoreId, failure: FailureType) -> rtk_kernel::health::RecoveryAction {
    log::error!("health: core {:?} failed ({:?})", core, failure);
    rtk_kernel::health::RecoveryAction::Retry
}

/// Configures SysTick from the 1 MHz `clk_ref`-derived watchdog tick (the
/// same reference `r3_support_rp2040`'s `SysTickOptions::FREQUENCY` names)
/// for a 1 ms period, matching `CONFIG.tick_rate_hz`.
fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    syst.set_clock_source(cortex_m::peripheral::syst::SystClkSource::External);
    syst.set_reload(1_000_000 / CONFIG.tick_rate_hz - 1);
    syst.clear_current();
    syst.enable_counter();
    syst.enable_interrupt();
}

pub fn run() -> ! {
    gpio_init_led();

    let mut cp = cortex_m::Peripherals::take().expect("core0: cortex_m peripherals already taken");
    configure_systick(&mut cp.SYST);

    unsafe {
        cp.NVIC.set_priority(rp2040_pac::Interrupt::SIO_IRQ_PROC0, 0x80);
        cortex_m::peripheral::NVIC::unmask(rp2040_pac::Interrupt::SIO_IRQ_PROC0);
        cp.NVIC.set_priority(rp2040_pac::Interrupt::TIMER_IRQ_0, 0x80);
        cortex_m::peripheral::NVIC::unmask(rp2040_pac::Interrupt::TIMER_IRQ_0);
    }

    KERNEL.health_register_callback(health_failure_callback);

    let led = KERNEL
        .create_task(TaskAttr {
            name: "led",
            entry: led_task,
            entry_param: 0,
            stack_base: unsafe { LED_TASK_STACK.as_mut_ptr() },
            stack_size: unsafe { LED_TASK_STACK.len() },
            base_priority: 8,
            affinity: Affinity::Core0,
        })
        .expect("create_task(led)");
    KERNEL.activate_task(led).expect("activate_task(led)");

    let monitor = KERNEL
        .create_task(TaskAttr {
            name: "monitor",
            entry: monitor_task,
            entry_param: 0,
            stack_base: unsafe { MONITOR_TASK_STACK.as_mut_ptr() },
            stack_size: unsafe { MONITOR_TASK_STACK.len() },
            base_priority: 12,
            affinity: Affinity::Core0,
        })
        .expect("create_task(monitor)");
    KERNEL.activate_task(monitor).expect("activate_task(monitor)");

    KERNEL.start(CoreId::Core0)
}

#[cortex_m_rt::exception]
fn SysTick() {
    rtk_port_rp2040::timebase::on_systick_tick();
    KERNEL.tick_handler();
}

#[cortex_m_rt::interrupt]
fn SIO_IRQ_PROC0() {
    while rtk_port_rp2040::fifo::try_recv().is_some() {}
    KERNEL.check_preemption(CoreId::Core0);
}

#[cortex_m_rt::interrupt]
fn TIMER_IRQ_0() {
    rtk_port_rp2040::hires_alarm::ack();
    KERNEL.hires_alarm_irq();
}
