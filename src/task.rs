//! # Task Records
//!
//! The scheduling core does not own task lifetimes, but it needs a place to
//! keep the per-task fields it reads and writes: priorities, queue
//! membership, inheritance state, timing hints and the saved machine
//! context. [`TaskTable`] is that place, a fixed array of [`TaskRecord`]s
//! addressed by [`TaskId`].
//!
//! ## Priority Convention
//!
//! Higher numeric value is more urgent. Level 0 is reserved for the idle
//! task and `Priority::MAX` is the most urgent level.
//!
//! ## Task State Machine
//!
//! ```text
//!   Created ──insert──► Ready ──dispatch──► Running
//!                         ▲                    │
//!                         │  preempt / yield   │
//!                         ├────────────────────┤
//!                         │                    │ block_on()
//!                         │    unblock()       ▼
//!                         └──────────────── Blocked
//!
//!   Suspended: removed by repair or suspend(), re-readied by resume()
//!   Terminated: task function returned or task was destroyed
//! ```

use core::fmt;

use heapless::Vec;

use crate::config::{MAX_TASKS, PRIORITY_LEVELS};
use crate::context::CpuContext;
use crate::error::SchedError;
use crate::pool::Handle;

/// Monotonic tick count. Wraps; compare with `wrapping_sub`.
pub type Tick = u32;

/// Task entry point. Receives the parameter passed to `init_task`.
pub type TaskEntry = extern "C" fn(usize);

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Index of a task in the [`TaskTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u16);

impl TaskId {
    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Scheduling priority. Higher is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(u8);

impl Priority {
    /// Idle level.
    pub const IDLE: Self = Self(0);
    /// Most urgent level.
    pub const MAX: Self = Self((PRIORITY_LEVELS - 1) as u8);

    /// Validate a raw priority against the configured number of levels.
    #[inline]
    pub const fn new(raw: u8) -> Result<Self, SchedError> {
        if (raw as usize) < PRIORITY_LEVELS {
            Ok(Self(raw))
        } else {
            Err(SchedError::InvalidPriority)
        }
    }

    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw distance `self - other`, negative when `other` is more urgent.
    #[inline]
    pub const fn delta(self, other: Self) -> i16 {
        self.0 as i16 - other.0 as i16
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Allocated, not yet made ready.
    Created,
    /// Eligible to run, waiting in the ready queue.
    Ready,
    /// Currently executing.
    Running,
    /// Waiting on a resource or event.
    Blocked,
    /// Not schedulable until resumed.
    Suspended,
    /// Finished; slot can be destroyed.
    Terminated,
    /// Slot is unused.
    Invalid,
}

// ---------------------------------------------------------------------------
// Creation parameters
// ---------------------------------------------------------------------------

/// Parameters supplied when a task is created.
#[derive(Debug, Clone, Copy)]
pub struct TaskParams {
    pub priority: Priority,
    /// Relative deadline in ticks, re-armed every period.
    pub deadline: Option<u32>,
    /// Release period in ticks. Used by rate-monotonic assignment.
    pub period: Option<u32>,
    /// Preferred CPU. Always 0 on this port.
    pub affinity: u8,
}

impl TaskParams {
    pub const fn new(priority: Priority) -> Self {
        Self {
            priority,
            deadline: None,
            period: None,
            affinity: 0,
        }
    }

    pub const fn with_deadline(mut self, ticks: u32) -> Self {
        self.deadline = Some(ticks);
        self
    }

    pub const fn with_period(mut self, ticks: u32) -> Self {
        self.period = Some(ticks);
        self
    }

    pub const fn with_affinity(mut self, cpu: u8) -> Self {
        self.affinity = cpu;
        self
    }
}

// ---------------------------------------------------------------------------
// Stack storage
// ---------------------------------------------------------------------------

/// Stack memory for one task, aligned for the AAPCS 8-byte rule.
#[repr(C, align(8))]
pub struct Stack<const WORDS: usize>([u32; WORDS]);

impl<const WORDS: usize> Stack<WORDS> {
    pub const fn new() -> Self {
        Self([0; WORDS])
    }

    /// Hand the storage over to the scheduler.
    pub fn words(&'static mut self) -> &'static mut [u32] {
        &mut self.0
    }
}

impl<const WORDS: usize> Default for Stack<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Task record
// ---------------------------------------------------------------------------

const TASK_TAG: u32 = 0x7A5C_0000;

/// Per-task scheduling state.
pub struct TaskRecord {
    pub id: TaskId,
    pub state: TaskState,

    /// Priority assigned by the creator.
    pub static_priority: Priority,
    /// Priority the scheduler actually uses. Never below `static_priority`.
    pub effective_priority: Priority,
    /// Explicit raise requested through `boost`.
    pub(crate) boost: Option<Priority>,

    /// Queue node currently owned by this task, if it is queued.
    pub(crate) queue_node: Option<Handle>,
    /// Inheritance entries pushed onto this task by waiters.
    pub(crate) inheritance: Vec<Handle, MAX_TASKS>,
    /// Owner of the resource this task waits on.
    pub blocked_on: Option<TaskId>,

    /// Absolute deadline of the current release.
    pub deadline: Option<Tick>,
    pub relative_deadline: Option<u32>,
    pub period: Option<u32>,
    pub affinity: u8,

    /// Tick at which the task last got the CPU.
    pub last_run: Tick,
    /// Ticks left in the current time slice.
    pub slice_remaining: u32,
    pub run_ticks: u32,
    pub voluntary_yields: u32,
    pub preemptions: u32,

    /// Stack region handed over by the creator.
    pub(crate) stack: Option<&'static mut [u32]>,
    /// Saved process stack pointer, as an address inside `stack`.
    pub(crate) stack_pointer: usize,
    /// Register frame copied out on the last save.
    pub(crate) context: CpuContext,

    tag: u32,
    pub active: bool,
}

impl TaskRecord {
    const fn vacant() -> Self {
        Self {
            id: TaskId(0),
            state: TaskState::Invalid,
            static_priority: Priority::IDLE,
            effective_priority: Priority::IDLE,
            boost: None,
            queue_node: None,
            inheritance: Vec::new(),
            blocked_on: None,
            deadline: None,
            relative_deadline: None,
            period: None,
            affinity: 0,
            last_run: 0,
            slice_remaining: 0,
            run_ticks: 0,
            voluntary_yields: 0,
            preemptions: 0,
            stack: None,
            stack_pointer: 0,
            context: CpuContext::zeroed(),
            tag: 0,
            active: false,
        }
    }

    fn init(&mut self, id: TaskId, params: &TaskParams, now: Tick) {
        *self = Self::vacant();
        self.id = id;
        self.state = TaskState::Created;
        self.static_priority = params.priority;
        self.effective_priority = params.priority;
        self.relative_deadline = params.deadline;
        self.deadline = params.deadline.map(|d| now.wrapping_add(d));
        self.period = params.period;
        self.affinity = params.affinity;
        self.last_run = now;
        self.tag = TASK_TAG | id.0 as u32;
        self.active = true;
    }

    /// Record tag still matches the slot it was stamped for.
    #[inline]
    pub fn is_intact(&self) -> bool {
        self.active && self.tag == (TASK_TAG | self.id.0 as u32)
    }

    #[inline]
    pub fn is_queued(&self) -> bool {
        self.queue_node.is_some()
    }

    /// Number of inheritance entries pending on this task.
    #[inline]
    pub fn inheritance_len(&self) -> usize {
        self.inheritance.len()
    }

    /// Ticks until the current deadline; negative once it has passed.
    #[inline]
    pub fn time_to_deadline(&self, now: Tick) -> Option<i32> {
        self.deadline.map(|d| d.wrapping_sub(now) as i32)
    }

    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.active && matches!(self.state, TaskState::Ready | TaskState::Running)
    }

    /// Saved stack pointer.
    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer
    }

    #[inline]
    pub fn context(&self) -> &CpuContext {
        &self.context
    }

    /// Start and end addresses of the stack region.
    pub fn stack_bounds(&self) -> Option<(usize, usize)> {
        self.stack.as_ref().map(|s| {
            let base = s.as_ptr() as usize;
            (base, base + s.len() * core::mem::size_of::<u32>())
        })
    }

    /// Move the deadline forward by one period once it has passed.
    pub(crate) fn rearm_deadline(&mut self, now: Tick) -> bool {
        match (self.deadline, self.relative_deadline, self.period) {
            (Some(deadline), Some(relative), Some(period)) if (now.wrapping_sub(deadline) as i32) >= 0 => {
                let release = deadline.wrapping_sub(relative).wrapping_add(period);
                self.deadline = Some(release.wrapping_add(relative));
                true
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Task table
// ---------------------------------------------------------------------------

/// Fixed array of task records.
pub struct TaskTable {
    tasks: [TaskRecord; MAX_TASKS],
    count: usize,
}

impl TaskTable {
    pub const fn new() -> Self {
        Self {
            tasks: [const { TaskRecord::vacant() }; MAX_TASKS],
            count: 0,
        }
    }

    /// Allocate a record in the first free slot. The task starts `Created`.
    pub fn spawn(&mut self, params: &TaskParams, now: Tick) -> Result<TaskId, SchedError> {
        let index = self
            .tasks
            .iter()
            .position(|t| !t.active)
            .ok_or(SchedError::TaskTableFull)?;
        let id = TaskId(index as u16);
        self.tasks[index].init(id, params, now);
        self.count += 1;
        log::trace!("task {} created at {}", id, params.priority);
        Ok(id)
    }

    /// Free a record. The task must not be queued and must not hold
    /// inheritance entries.
    pub fn destroy(&mut self, id: TaskId) -> Result<(), SchedError> {
        let task = self.get(id)?;
        if task.is_queued() || !task.inheritance.is_empty() {
            return Err(SchedError::InvalidState);
        }
        self.tasks[id.index()] = TaskRecord::vacant();
        self.count -= 1;
        log::trace!("task {} destroyed", id);
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Result<&TaskRecord, SchedError> {
        match self.tasks.get(id.index()) {
            Some(t) if t.active => Ok(t),
            _ => Err(SchedError::NotFound),
        }
    }

    pub fn get_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord, SchedError> {
        match self.tasks.get_mut(id.index()) {
            Some(t) if t.active => Ok(t),
            _ => Err(SchedError::NotFound),
        }
    }

    #[inline]
    pub fn contains(&self, id: TaskId) -> bool {
        self.get(id).is_ok()
    }

    /// Active records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.iter().filter(|t| t.active)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TaskRecord> {
        self.tasks.iter_mut().filter(|t| t.active)
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
