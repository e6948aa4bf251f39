//! # Preemption Control
//!
//! Nestable preemption disable. The outermost `disable` raises the interrupt
//! mask through the port and remembers the previous value; the matching
//! outermost `enable` puts it back. Switch requests made in between are
//! remembered and issued once preemption is enabled again, or at an explicit
//! preemption point.

use crate::arch::{MaskState, Port};
use crate::config::MAX_PREEMPTION_DEPTH;
use crate::error::{fatal, FatalReason};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreemptionStats {
    pub disable_calls: u32,
    pub max_depth: u32,
    pub total_disabled_cycles: u64,
    pub max_disabled_cycles: u32,
    pub deferred_switches: u32,
    pub forced_points: u32,
}

pub struct PreemptionControl {
    depth: u32,
    saved_mask: Option<MaskState>,
    pending: bool,
    disabled_at: u32,
    stats: PreemptionStats,
}

impl PreemptionControl {
    pub const fn new() -> Self {
        Self {
            depth: 0,
            saved_mask: None,
            pending: false,
            disabled_at: 0,
            stats: PreemptionStats {
                disable_calls: 0,
                max_depth: 0,
                total_disabled_cycles: 0,
                max_disabled_cycles: 0,
                deferred_switches: 0,
                forced_points: 0,
            },
        }
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.depth == 0
    }

    /// A switch was requested while preemption was disabled.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    #[inline]
    pub fn stats(&self) -> PreemptionStats {
        self.stats
    }

    /// Enter a non-preemptible section.
    ///
    /// # Panics
    /// Halts the system when nesting exceeds `MAX_PREEMPTION_DEPTH`.
    pub fn disable<P: Port>(&mut self, port: &P) {
        if self.depth >= MAX_PREEMPTION_DEPTH {
            fatal(FatalReason::PreemptionNestingTooDeep);
        }
        if self.depth == 0 {
            self.saved_mask = Some(port.raise_mask());
            self.disabled_at = port.cycles();
        }
        self.depth += 1;
        self.stats.disable_calls += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.depth);
    }

    /// Leave a non-preemptible section. Returns true if a deferred switch
    /// was issued.
    ///
    /// # Panics
    /// Halts the system on an `enable` without a matching `disable`.
    pub fn enable<P: Port>(&mut self, port: &P) -> bool {
        if self.depth == 0 {
            fatal(FatalReason::PreemptionUnderflow);
        }
        self.depth -= 1;
        if self.depth > 0 {
            return false;
        }

        let held = port.cycles().wrapping_sub(self.disabled_at);
        self.stats.total_disabled_cycles += held as u64;
        self.stats.max_disabled_cycles = self.stats.max_disabled_cycles.max(held);
        if let Some(mask) = self.saved_mask.take() {
            port.restore_mask(mask);
        }

        if core::mem::take(&mut self.pending) {
            self.stats.deferred_switches += 1;
            port.pend_switch();
            return true;
        }
        false
    }

    /// Ask for a context switch. Issued now if preemption is enabled,
    /// otherwise deferred. Returns true if issued now.
    pub fn request_switch<P: Port>(&mut self, port: &P) -> bool {
        if self.depth > 0 {
            self.pending = true;
            return false;
        }
        port.pend_switch();
        true
    }

    /// Let a deferred switch happen in the middle of a long non-preemptible
    /// section. The nesting depth is unchanged afterwards.
    pub fn preemption_point<P: Port>(&mut self, port: &P) -> bool {
        if self.depth == 0 || !self.pending {
            return false;
        }
        self.pending = false;
        self.stats.forced_points += 1;
        if let Some(mask) = self.saved_mask {
            port.restore_mask(mask);
            port.pend_switch();
            self.saved_mask = Some(port.raise_mask());
        } else {
            port.pend_switch();
        }
        true
    }
}

impl Default for PreemptionControl {
    fn default() -> Self {
        Self::new()
    }
}
