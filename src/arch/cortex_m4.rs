//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements [`Port`] over SysTick, DWT, BASEPRI and PendSV, the first-task
//! launch and the PendSV context-switch handler.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): used by tasks in Thread mode
//!
//! On exception entry the hardware stacks R0–R3, R12, LR, PC and xPSR onto
//! the process stack. PendSV pushes R4–R11 below that, which yields the
//! sixteen-word frame the context coordinator reads and writes:
//!
//! ```text
//!   high ┌──────────┐
//!        │  xPSR    │ ◄─ hardware
//!        │  PC      │
//!        │  LR      │
//!        │  R12     │
//!        │  R3..R0  │
//!        ├──────────┤
//!        │  R11..R4 │ ◄─ PendSV
//!   psp ►└──────────┘
//! ```
//!
//! ## Interrupt Priorities
//!
//! - SysTick: 0xFF (lowest). Masked while preemption is disabled.
//! - PendSV: 0xFF (lowest). Runs only when no other ISR is active.
//!
//! Application ISRs above `KERNEL_BASEPRI` are never masked by the
//! scheduler's preemption control.

use core::arch::{asm, global_asm};
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{DCB, DWT, SCB, SYST};
use cortex_m::register::{basepri, basepri_max};

use super::{MaskState, Port};
use crate::config::{KERNEL_BASEPRI, SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::task::Tick;

/// Scheduler ticks since SysTick was started.
static TICKS: AtomicU32 = AtomicU32::new(0);

/// Zero-sized handle to the core peripherals the scheduler uses.
#[derive(Debug, Default)]
pub struct CortexM4Port;

impl CortexM4Port {
    pub const fn new() -> Self {
        Self
    }
}

impl Port for CortexM4Port {
    #[inline]
    fn ticks(&self) -> Tick {
        TICKS.load(Ordering::Relaxed)
    }

    #[inline]
    fn cycles(&self) -> u32 {
        DWT::cycle_count()
    }

    fn raise_mask(&self) -> MaskState {
        let previous = basepri::read();
        // BASEPRI_MAX only ever tightens the mask.
        basepri_max::write(KERNEL_BASEPRI);
        MaskState(previous as u32)
    }

    fn restore_mask(&self, state: MaskState) {
        // SAFETY: `state` was read from BASEPRI by `raise_mask`, so this
        // only re-opens what the matching raise closed.
        unsafe { basepri::write(state.0 as u8) }
    }

    #[inline]
    fn pend_switch(&self) {
        SCB::set_pendsv();
    }
}

// ---------------------------------------------------------------------------
// Peripheral setup
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the core clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Start the DWT cycle counter used for latency accounting.
pub fn enable_cycle_counter(dcb: &mut DCB, dwt: &mut DWT) {
    dcb.enable_trace();
    dwt.enable_cycle_counter();
}

/// Put PendSV and SysTick at the lowest priority.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // SAFETY: lowering these two handlers cannot break a priority-based
    // critical section; the kernel lock is PRIMASK.
    unsafe {
        scb.set_priority(SystemHandler::PendSV, 0xFF);
        scb.set_priority(SystemHandler::SysTick, 0xFF);
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to PSP and enter the first task.
///
/// `psp` points at a frame built by `ContextSwitch::init_task`. The
/// hardware part of the frame is popped by hand because this is not an
/// exception return. Interrupts are enabled just before the branch.
///
/// # Safety
/// Call once, with interrupts disabled, from Thread mode on MSP.
pub unsafe fn start_first_task(psp: usize) -> ! {
    asm!(
        "adds r0, #32",
        "msr psp, r0",
        "movs r0, #2",
        "msr control, r0",
        "isb",
        "pop {{r0-r3, r12}}",
        "pop {{r4}}",
        "mov lr, r4",
        "pop {{r5}}",
        "pop {{r6}}",
        "orr r5, r5, #1",
        "cpsie i",
        "bx r5",
        in("r0") psp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

// TODO: stack S16-S31 and honour EXC_RETURN bit 4 so tasks may use the FPU.
global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    mrs r0, psp",
    "    stmdb r0!, {{r4-r11}}",
    "    bl rtcore_switch_context",
    "    ldmia r0!, {{r4-r11}}",
    "    msr psp, r0",
    "    mvn lr, #2",
    "    bx lr",
    ".size PendSV, . - PendSV",
);

/// Body of PendSV: hand the outgoing stack pointer to the kernel and get
/// the incoming one back.
#[no_mangle]
extern "C" fn rtcore_switch_context(psp: u32) -> u32 {
    crate::kernel::switch_from_isr(psp as usize) as u32
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// Scheduler tick. Pends PendSV through the preemption control when a
/// switch is due.
#[no_mangle]
pub extern "C" fn SysTick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::kernel::on_tick();
}
