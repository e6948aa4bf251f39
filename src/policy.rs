//! # Scheduling Policies
//!
//! A closed set of policies behind one trait. [`Policy`] is the tag stored
//! by the scheduler and dispatches to the unit policy types, so there is no
//! table of function pointers to keep consistent.
//!
//! | Policy          | Selection                          | Quantum              |
//! |-----------------|------------------------------------|----------------------|
//! | `Priority`      | FIFO head of highest level         | decision engine      |
//! | `RoundRobin`    | FIFO head of highest level         | `DEFAULT_TIME_SLICE` |
//! | `Edf`           | earliest deadline in highest level | decision engine      |
//! | `RateMonotonic` | FIFO head of highest level         | decision engine      |
//!
//! Every policy selects from the highest occupied level only, so strict
//! priority ordering holds under all of them. Rate-monotonic differs at
//! creation: the static priority is derived from the period.

use crate::config::{DEFAULT_TIME_SLICE, RM_TICKS_PER_LEVEL};
use crate::error::SchedError;
use crate::ready_queue::ReadyQueue;
use crate::task::{Priority, TaskId, TaskParams, TaskRecord, TaskTable, Tick};

pub trait SchedulingPolicy {
    /// Task that should run next, or `None` if nothing is queued.
    fn select(&self, tasks: &TaskTable, queue: &ReadyQueue, now: Tick) -> Option<TaskId>;

    /// Slice granted to `task`, given the quantum the decision engine
    /// computed for it.
    fn time_slice(&self, task: &TaskRecord, quantum: u32) -> u32;

    /// Static priority a new task gets under this policy.
    fn static_priority_for(&self, params: &TaskParams) -> Result<Priority, SchedError> {
        Ok(params.priority)
    }
}

pub struct PriorityPolicy;
pub struct RoundRobinPolicy;
pub struct EdfPolicy;
pub struct RateMonotonicPolicy;

impl SchedulingPolicy for PriorityPolicy {
    fn select(&self, _tasks: &TaskTable, queue: &ReadyQueue, _now: Tick) -> Option<TaskId> {
        queue.get_highest_priority()
    }

    fn time_slice(&self, _task: &TaskRecord, quantum: u32) -> u32 {
        quantum
    }
}

impl SchedulingPolicy for RoundRobinPolicy {
    fn select(&self, _tasks: &TaskTable, queue: &ReadyQueue, _now: Tick) -> Option<TaskId> {
        queue.get_highest_priority()
    }

    fn time_slice(&self, _task: &TaskRecord, _quantum: u32) -> u32 {
        DEFAULT_TIME_SLICE
    }
}

impl SchedulingPolicy for EdfPolicy {
    fn select(&self, tasks: &TaskTable, queue: &ReadyQueue, now: Tick) -> Option<TaskId> {
        let level = queue.highest_level()?;
        let earliest = queue
            .iter_level(level)
            .filter_map(|(id, _)| {
                let ttd = tasks.get(id).ok()?.time_to_deadline(now)?;
                Some((ttd, id))
            })
            // min_by_key keeps the first of equal keys, i.e. FIFO order
            .min_by_key(|(ttd, _)| *ttd);
        earliest.map(|(_, id)| id).or_else(|| queue.head_of(level))
    }

    fn time_slice(&self, _task: &TaskRecord, quantum: u32) -> u32 {
        quantum
    }
}

impl SchedulingPolicy for RateMonotonicPolicy {
    fn select(&self, _tasks: &TaskTable, queue: &ReadyQueue, _now: Tick) -> Option<TaskId> {
        queue.get_highest_priority()
    }

    fn time_slice(&self, _task: &TaskRecord, quantum: u32) -> u32 {
        quantum
    }

    fn static_priority_for(&self, params: &TaskParams) -> Result<Priority, SchedError> {
        match params.period {
            Some(period) => rate_monotonic_priority(period),
            None => Ok(params.priority),
        }
    }
}

/// Shorter period, higher priority. Periods map onto levels 1..=254 in
/// steps of `RM_TICKS_PER_LEVEL` ticks.
pub fn rate_monotonic_priority(period: u32) -> Result<Priority, SchedError> {
    if period == 0 {
        return Err(SchedError::InvalidParameter);
    }
    let steps = (period / RM_TICKS_PER_LEVEL).min(253);
    Priority::new((254 - steps) as u8)
}

/// Policy selected for the whole scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    #[default]
    Priority,
    RoundRobin,
    Edf,
    RateMonotonic,
}

impl SchedulingPolicy for Policy {
    fn select(&self, tasks: &TaskTable, queue: &ReadyQueue, now: Tick) -> Option<TaskId> {
        match self {
            Policy::Priority => PriorityPolicy.select(tasks, queue, now),
            Policy::RoundRobin => RoundRobinPolicy.select(tasks, queue, now),
            Policy::Edf => EdfPolicy.select(tasks, queue, now),
            Policy::RateMonotonic => RateMonotonicPolicy.select(tasks, queue, now),
        }
    }

    fn time_slice(&self, task: &TaskRecord, quantum: u32) -> u32 {
        match self {
            Policy::Priority => PriorityPolicy.time_slice(task, quantum),
            Policy::RoundRobin => RoundRobinPolicy.time_slice(task, quantum),
            Policy::Edf => EdfPolicy.time_slice(task, quantum),
            Policy::RateMonotonic => RateMonotonicPolicy.time_slice(task, quantum),
        }
    }

    fn static_priority_for(&self, params: &TaskParams) -> Result<Priority, SchedError> {
        match self {
            Policy::RateMonotonic => RateMonotonicPolicy.static_priority_for(params),
            _ => Ok(params.priority),
        }
    }
}
