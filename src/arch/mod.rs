//! # Architecture Abstraction Layer
//!
//! The scheduling core talks to the hardware only through [`Port`]: a tick
//! counter, a cycle counter, the interrupt mask and the deferred-switch
//! trigger. The Cortex-M4 port implements it with SysTick, DWT, BASEPRI and
//! PendSV. Host builds use [`host::SimPort`], a deterministic software model
//! that tests can drive directly.

use crate::task::Tick;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod host;

/// Interrupt mask value captured by [`Port::raise_mask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaskState(pub u32);

/// Hardware services needed by the scheduler.
pub trait Port {
    /// Scheduler ticks since start.
    fn ticks(&self) -> Tick;

    /// Free-running cycle counter. Wraps.
    fn cycles(&self) -> u32;

    /// Mask scheduler-level interrupts and return the previous mask.
    fn raise_mask(&self) -> MaskState;

    /// Put back a mask returned by `raise_mask`.
    fn restore_mask(&self, state: MaskState);

    /// Request a deferred context switch.
    fn pend_switch(&self);

    /// CPU executing the caller.
    fn current_cpu(&self) -> u8 {
        0
    }
}

/// Port used by the global kernel instance.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub type ArchPort = cortex_m4::CortexM4Port;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub type ArchPort = host::SimPort;

/// Sleep until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::wfi();

    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    core::hint::spin_loop();
}
