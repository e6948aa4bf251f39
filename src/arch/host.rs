//! Software port for host builds.
//!
//! Every counter is explicit state: ticks advance only when told to, and the
//! cycle counter moves by a fixed step on each read so that measured
//! durations are reproducible.

use core::cell::Cell;

use super::{MaskState, Port};
use crate::task::Tick;

/// Mask value that `raise_mask` installs.
pub const SIM_KERNEL_MASK: u32 = 0x80;

#[derive(Debug)]
pub struct SimPort {
    ticks: Cell<Tick>,
    cycles: Cell<u32>,
    cycle_step: Cell<u32>,
    mask: Cell<u32>,
    pended: Cell<u32>,
    raises: Cell<u32>,
}

impl SimPort {
    pub const fn new() -> Self {
        Self {
            ticks: Cell::new(0),
            cycles: Cell::new(0),
            cycle_step: Cell::new(1),
            mask: Cell::new(0),
            pended: Cell::new(0),
            raises: Cell::new(0),
        }
    }

    pub fn set_ticks(&self, ticks: Tick) {
        self.ticks.set(ticks);
    }

    pub fn advance(&self, ticks: Tick) {
        self.ticks.set(self.ticks.get().wrapping_add(ticks));
    }

    /// Cycles added to the counter on every read.
    pub fn set_cycle_step(&self, step: u32) {
        self.cycle_step.set(step);
    }

    /// Current mask value.
    pub fn mask(&self) -> u32 {
        self.mask.get()
    }

    pub fn set_mask(&self, mask: u32) {
        self.mask.set(mask);
    }

    /// Number of `pend_switch` calls so far.
    pub fn pended(&self) -> u32 {
        self.pended.get()
    }

    /// Number of `raise_mask` calls so far.
    pub fn raises(&self) -> u32 {
        self.raises.get()
    }
}

impl Default for SimPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for SimPort {
    fn ticks(&self) -> Tick {
        self.ticks.get()
    }

    fn cycles(&self) -> u32 {
        let now = self.cycles.get();
        self.cycles.set(now.wrapping_add(self.cycle_step.get()));
        now
    }

    fn raise_mask(&self) -> MaskState {
        self.raises.set(self.raises.get() + 1);
        let previous = MaskState(self.mask.get());
        if previous.0 == 0 || previous.0 > SIM_KERNEL_MASK {
            self.mask.set(SIM_KERNEL_MASK);
        }
        previous
    }

    fn restore_mask(&self, state: MaskState) {
        self.mask.set(state.0);
    }

    fn pend_switch(&self) {
        self.pended.set(self.pended.get() + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycles_advance_by_step() {
        let port = SimPort::new();
        port.set_cycle_step(7);
        let a = port.cycles();
        let b = port.cycles();
        assert_eq!(b.wrapping_sub(a), 7);
    }

    #[test]
    fn test_mask_raise_and_restore() {
        let port = SimPort::new();
        let saved = port.raise_mask();
        assert_eq!(saved, MaskState(0));
        assert_eq!(port.mask(), SIM_KERNEL_MASK);

        // A stricter mask already in place is kept.
        port.set_mask(0x20);
        let inner = port.raise_mask();
        assert_eq!(port.mask(), 0x20);
        port.restore_mask(inner);
        port.restore_mask(saved);
        assert_eq!(port.mask(), 0);
        assert_eq!(port.raises(), 2);
    }
}
