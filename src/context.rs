//! # Context-Switch Coordinator
//!
//! Moves register frames between task stacks and task records. The PendSV
//! handler pushes `r4-r11` below the hardware-stacked frame, so a saved
//! context on a task stack is sixteen words starting at the saved PSP:
//!
//! ```text
//!   sp + 0x00  r4  r5  r6  r7  r8  r9  r10 r11     software-saved
//!   sp + 0x20  r0  r1  r2  r3  r12 lr  pc  xpsr    hardware-saved
//! ```
//!
//! Every save and restore validates the stack first: the pointer must be
//! 8-byte aligned, leave room for a full frame, stay above the guard words,
//! and the guard words must still hold the fill pattern. A bad stack on
//! save is a stack overflow of the outgoing task and halts the system. A
//! bad stack on restore falls back to the idle task.
//!
//! ## State Machine
//!
//! ```text
//!   Idle ──► Saving ──► Switching ──► Restoring ──► Idle
//!                                          │
//!                                          └──► Error (no runnable context)
//! ```

use crate::arch::Port;
use crate::config::{MAX_SWITCH_CYCLES, MIN_STACK_WORDS, STACK_FILL_PATTERN, STACK_GUARD_WORDS};
use crate::error::{fatal, FatalReason, SchedError};
use crate::task::{TaskEntry, TaskId, TaskRecord, TaskTable};

/// Words in a saved context frame.
pub const FRAME_WORDS: usize = 16;

const FRAME_BYTES: usize = FRAME_WORDS * 4;
const WORD: usize = core::mem::size_of::<u32>();

const R0: usize = 8;
const LR: usize = 13;
const PC: usize = 14;
const XPSR: usize = 15;

/// xPSR with only the Thumb bit set.
pub const INITIAL_XPSR: u32 = 0x0100_0000;

/// Saved register file of a task, in stack order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CpuContext {
    pub regs: [u32; FRAME_WORDS],
}

impl CpuContext {
    pub const fn zeroed() -> Self {
        Self {
            regs: [0; FRAME_WORDS],
        }
    }

    /// `r0`, the task parameter on first entry.
    pub fn argument(&self) -> u32 {
        self.regs[R0]
    }

    pub fn lr(&self) -> u32 {
        self.regs[LR]
    }

    pub fn pc(&self) -> u32 {
        self.regs[PC]
    }

    pub fn xpsr(&self) -> u32 {
        self.regs[XPSR]
    }

    /// Callee-saved `r4..r11`.
    pub fn callee_saved(&self) -> &[u32] {
        &self.regs[..R0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    Idle,
    Saving,
    Switching,
    Restoring,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchStats {
    pub switches: u32,
    pub voluntary: u32,
    pub preemptive: u32,
    pub min_cycles: u32,
    pub max_cycles: u32,
    pub total_cycles: u64,
    pub overruns: u32,
    pub errors: u32,
}

impl SwitchStats {
    const fn new() -> Self {
        Self {
            switches: 0,
            voluntary: 0,
            preemptive: 0,
            min_cycles: u32::MAX,
            max_cycles: 0,
            total_cycles: 0,
            overruns: 0,
            errors: 0,
        }
    }

    pub fn avg_cycles(&self) -> u32 {
        match self.switches {
            0 => 0,
            n => (self.total_cycles / n as u64) as u32,
        }
    }
}

/// Why a stack pointer was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackFault {
    NoStack,
    Misaligned,
    OutOfBounds,
    GuardOverwritten,
}

fn check_stack(task: &TaskRecord, sp: usize) -> Result<usize, StackFault> {
    let stack = task.stack.as_deref().ok_or(StackFault::NoStack)?;
    let base = stack.as_ptr() as usize;
    let end = base + stack.len() * WORD;
    if sp % 8 != 0 {
        return Err(StackFault::Misaligned);
    }
    if sp < base + STACK_GUARD_WORDS * WORD || sp + FRAME_BYTES > end {
        return Err(StackFault::OutOfBounds);
    }
    if stack[..STACK_GUARD_WORDS].iter().any(|w| *w != STACK_FILL_PATTERN) {
        return Err(StackFault::GuardOverwritten);
    }
    Ok((sp - base) / WORD)
}

/// Where a finished task function returns to.
extern "C" fn task_exit() -> ! {
    crate::kernel::exit_current();
    loop {
        crate::arch::wait_for_interrupt();
    }
}

pub struct ContextSwitch {
    state: SwitchState,
    idle: Option<TaskId>,
    stats: SwitchStats,
}

impl ContextSwitch {
    pub const fn new() -> Self {
        Self {
            state: SwitchState::Idle,
            idle: None,
            stats: SwitchStats::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> SwitchState {
        self.state
    }

    #[inline]
    pub fn in_switch(&self) -> bool {
        !matches!(self.state, SwitchState::Idle)
    }

    #[inline]
    pub fn stats(&self) -> SwitchStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = SwitchStats::new();
    }

    /// Task restored when the chosen one has no usable context.
    pub fn set_idle(&mut self, idle: Option<TaskId>) {
        self.idle = idle;
    }

    /// Build the initial frame of a task so that the first restore enters
    /// `entry(param)` in Thread mode, returning into the exit trampoline.
    pub fn init_task(&mut self, tasks: &mut TaskTable, id: TaskId, entry: TaskEntry, param: usize) -> Result<(), SchedError> {
        let task = tasks.get_mut(id)?;
        let stack = task.stack.as_deref_mut().ok_or(SchedError::InvalidParameter)?;
        if stack.len() < MIN_STACK_WORDS {
            return Err(SchedError::InvalidParameter);
        }
        stack.fill(STACK_FILL_PATTERN);

        let base = stack.as_ptr() as usize;
        let top = base + stack.len() * WORD;
        let sp = (top & !7) - FRAME_BYTES;
        let offset = (sp - base) / WORD;

        let mut context = CpuContext::zeroed();
        context.regs[R0] = param as u32;
        context.regs[LR] = task_exit as usize as u32;
        // Exception return takes the PC without the Thumb bit.
        context.regs[PC] = entry as usize as u32 & !1;
        context.regs[XPSR] = INITIAL_XPSR;
        stack[offset..offset + FRAME_WORDS].copy_from_slice(&context.regs);

        task.context = context;
        task.stack_pointer = sp;
        log::trace!("context: {} frame at {:#x}", id, sp);
        Ok(())
    }

    /// Record the frame at `sp` as the saved context of `id`.
    ///
    /// # Panics
    /// Halts the system if the stack of `id` has overflowed.
    pub fn save(&mut self, tasks: &mut TaskTable, id: TaskId, sp: usize) -> Result<(), SchedError> {
        self.state = SwitchState::Saving;
        let task = tasks.get_mut(id)?;
        let offset = match check_stack(task, sp) {
            Ok(offset) => offset,
            Err(fault) => {
                self.stats.errors += 1;
                self.state = SwitchState::Error;
                log::error!("context: {} stack fault {:?} at {:#x}", id, fault, sp);
                fatal(FatalReason::StackOverflow(id));
            }
        };
        if let Some(stack) = task.stack.as_deref() {
            task.context.regs.copy_from_slice(&stack[offset..offset + FRAME_WORDS]);
        }
        task.stack_pointer = sp;
        self.state = SwitchState::Switching;
        Ok(())
    }

    /// Write the saved context of `id` back to its stack and return the
    /// stack pointer to resume from.
    pub fn restore(&mut self, tasks: &mut TaskTable, id: TaskId) -> Result<usize, SchedError> {
        self.state = SwitchState::Restoring;
        let task = tasks.get_mut(id)?;
        let sp = task.stack_pointer;
        let offset = check_stack(task, sp).map_err(|fault| {
            log::warn!("context: {} cannot be restored: {:?}", id, fault);
            SchedError::InvalidState
        })?;
        let regs = task.context.regs;
        if let Some(stack) = task.stack.as_deref_mut() {
            stack[offset..offset + FRAME_WORDS].copy_from_slice(&regs);
        }
        self.state = SwitchState::Idle;
        Ok(sp)
    }

    /// Save `from` (if any) at `from_sp`, then restore `to`. Falls back to
    /// the idle task when `to` cannot be restored.
    ///
    /// Returns the task actually resumed and its stack pointer.
    pub fn switch<P: Port>(
        &mut self,
        tasks: &mut TaskTable,
        from: Option<TaskId>,
        from_sp: usize,
        to: TaskId,
        port: &P,
        voluntary: bool,
    ) -> (TaskId, usize) {
        let start = port.cycles();

        if let Some(from) = from {
            if self.save(tasks, from, from_sp).is_err() {
                log::warn!("context: outgoing {} is gone, frame dropped", from);
            }
        }

        let resumed = match self.restore(tasks, to) {
            Ok(sp) => (to, sp),
            Err(_) => {
                self.stats.errors += 1;
                self.fallback(tasks, to)
            }
        };

        let elapsed = port.cycles().wrapping_sub(start);
        self.record(elapsed, voluntary);
        resumed
    }

    fn fallback(&mut self, tasks: &mut TaskTable, failed: TaskId) -> (TaskId, usize) {
        match self.idle {
            Some(idle) if idle != failed => match self.restore(tasks, idle) {
                Ok(sp) => (idle, sp),
                Err(_) => self.halt(failed),
            },
            _ => self.halt(failed),
        }
    }

    fn halt(&mut self, failed: TaskId) -> ! {
        self.state = SwitchState::Error;
        fatal(FatalReason::NoRunnableContext(failed))
    }

    fn record(&mut self, cycles: u32, voluntary: bool) {
        let stats = &mut self.stats;
        stats.switches += 1;
        if voluntary {
            stats.voluntary += 1;
        } else {
            stats.preemptive += 1;
        }
        stats.min_cycles = stats.min_cycles.min(cycles);
        stats.max_cycles = stats.max_cycles.max(cycles);
        stats.total_cycles += cycles as u64;
        if cycles > MAX_SWITCH_CYCLES {
            stats.overruns += 1;
            log::warn!("context: switch took {} cycles", cycles);
        }
    }

    /// Words of `id`'s stack never written since `init_task`.
    pub fn stack_unused_words(&self, tasks: &TaskTable, id: TaskId) -> Result<usize, SchedError> {
        let stack = tasks.get(id)?.stack.as_deref().ok_or(SchedError::InvalidState)?;
        Ok(stack.iter().take_while(|w| **w == STACK_FILL_PATTERN).count())
    }

    /// Log the saved context of `id`.
    pub fn dump(&self, tasks: &TaskTable, id: TaskId) -> Result<(), SchedError> {
        let task = tasks.get(id)?;
        let ctx = &task.context;
        log::info!(
            "{} {:?} sp={:#010x} pc={:#010x} lr={:#010x} xpsr={:#010x} r0={:#010x}",
            id,
            task.state,
            task.stack_pointer,
            ctx.pc(),
            ctx.lr(),
            ctx.xpsr(),
            ctx.argument()
        );
        for (i, value) in ctx.callee_saved().iter().enumerate() {
            log::info!("  r{}={:#010x}", i + 4, value);
        }
        Ok(())
    }
}

impl Default for ContextSwitch {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
