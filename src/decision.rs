//! # Scheduling Decision Engine
//!
//! Chooses the next task and answers the two questions the tick path asks:
//! should the running task be preempted, and how long a slice does a task
//! get.
//!
//! ## Selection
//!
//! The default candidate is whatever the active [`Policy`] selects from the
//! ready queue, which is O(1) for every policy except EDF's walk of one
//! level. When CPU load exceeds `high_load_threshold`, the engine also
//! scores every task within `rescan_levels` of the highest occupied level:
//!
//! ```text
//!   score = priority * Wp / 100
//!         + (100 - ttd) * Wd / 100     if ttd < 100 (overdue counts as 0)
//!         + Wf                         if not run for STARVATION_THRESHOLD
//!         + Wa / 2                     if affinity == current CPU
//!   (clamped to MAX_SCORE)
//! ```
//!
//! With the default `rescan_levels = 0` only the highest occupied level is
//! scored, so scoring can reorder tasks of equal priority but never pick a
//! lower level over a higher one.

use crate::arch::Port;
use crate::config::{
    DEADLINE_HORIZON, DEFAULT_AFFINITY_WEIGHT, DEFAULT_DEADLINE_WEIGHT, DEFAULT_FAIRNESS_WEIGHT,
    DEFAULT_PRIORITY_WEIGHT, DEFAULT_RESCAN_LEVELS, DEFAULT_TIME_SLICE, HIGH_LOAD_THRESHOLD,
    LOW_LOAD_THRESHOLD, MAX_DECISION_CYCLES, MAX_SCORE, MAX_TIME_SLICE, MAX_WEIGHT_PERCENT, MIN_TIME_SLICE,
    OVERLOAD_WARNING_PERCENT, PREEMPTION_THRESHOLD, STARVATION_THRESHOLD, URGENCY_WINDOW,
};
use crate::error::SchedError;
use crate::policy::{Policy, SchedulingPolicy};
use crate::ready_queue::ReadyQueue;
use crate::task::{TaskId, TaskRecord, TaskTable, Tick};

/// Load sample supplied by the tick path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemMetrics {
    pub cpu_load_percent: u8,
    pub ready_count: u16,
    /// Context switches in the last sample window.
    pub context_switch_rate: u32,
    pub timestamp: Tick,
    pub current_cpu: u8,
}

/// Score weights, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionWeights {
    pub priority: u32,
    pub deadline: u32,
    pub affinity: u32,
    pub fairness: u32,
}

impl DecisionWeights {
    pub const DEFAULT: Self = Self {
        priority: DEFAULT_PRIORITY_WEIGHT,
        deadline: DEFAULT_DEADLINE_WEIGHT,
        affinity: DEFAULT_AFFINITY_WEIGHT,
        fairness: DEFAULT_FAIRNESS_WEIGHT,
    };

    /// Every weight is at most `MAX_WEIGHT_PERCENT`.
    pub const fn is_valid(&self) -> bool {
        self.priority <= MAX_WEIGHT_PERCENT
            && self.deadline <= MAX_WEIGHT_PERCENT
            && self.affinity <= MAX_WEIGHT_PERCENT
            && self.fairness <= MAX_WEIGHT_PERCENT
    }
}

impl Default for DecisionWeights {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionConfig {
    pub weights: DecisionWeights,
    /// Priority levels below the highest occupied one that a high-load
    /// rescan may pick from. Also bounds how far below the running task a
    /// deadline-urgent candidate may be and still preempt it.
    pub rescan_levels: u8,
    pub high_load_threshold: u8,
}

impl DecisionConfig {
    pub const DEFAULT: Self = Self {
        weights: DecisionWeights::DEFAULT,
        rescan_levels: DEFAULT_RESCAN_LEVELS,
        high_load_threshold: HIGH_LOAD_THRESHOLD,
    };
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// Nothing queued; idle task (or nothing) chosen.
    Idle,
    /// Policy selection, no scoring.
    Policy,
    /// High-load rescan picked the best score.
    Scored,
}

/// Outcome of one `make_decision` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub task: Option<TaskId>,
    /// 0..=100; how clearly the winner beat the runner-up.
    pub confidence: u8,
    pub decision_cycles: u32,
    pub preempt: bool,
    pub migrate: bool,
    pub reason: DecisionReason,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionStats {
    pub decisions: u32,
    pub scored_decisions: u32,
    pub preemption_decisions: u32,
    pub total_cycles: u64,
    pub max_cycles: u32,
    pub overruns: u32,
}

impl DecisionStats {
    pub fn avg_cycles(&self) -> u32 {
        match self.decisions {
            0 => 0,
            n => (self.total_cycles / n as u64) as u32,
        }
    }
}

pub struct DecisionEngine {
    config: DecisionConfig,
    metrics: SystemMetrics,
    last: Option<Decision>,
    stats: DecisionStats,
}

impl DecisionEngine {
    pub const fn new() -> Self {
        Self {
            config: DecisionConfig::DEFAULT,
            metrics: SystemMetrics {
                cpu_load_percent: 0,
                ready_count: 0,
                context_switch_rate: 0,
                timestamp: 0,
                current_cpu: 0,
            },
            last: None,
            stats: DecisionStats {
                decisions: 0,
                scored_decisions: 0,
                preemption_decisions: 0,
                total_cycles: 0,
                max_cycles: 0,
                overruns: 0,
            },
        }
    }

    #[inline]
    pub fn config(&self) -> DecisionConfig {
        self.config
    }

    pub fn set_config(&mut self, config: DecisionConfig) -> Result<(), SchedError> {
        if !config.weights.is_valid() || config.high_load_threshold > 100 {
            return Err(SchedError::InvalidParameter);
        }
        self.config = config;
        Ok(())
    }

    pub fn set_weights(&mut self, weights: DecisionWeights) -> Result<(), SchedError> {
        if !weights.is_valid() {
            return Err(SchedError::InvalidParameter);
        }
        self.config.weights = weights;
        Ok(())
    }

    #[inline]
    pub fn metrics(&self) -> SystemMetrics {
        self.metrics
    }

    #[inline]
    pub fn last_decision(&self) -> Option<Decision> {
        self.last
    }

    #[inline]
    pub fn stats(&self) -> DecisionStats {
        self.stats
    }

    /// Record a new load sample.
    pub fn update_metrics(&mut self, metrics: SystemMetrics) {
        if metrics.cpu_load_percent > OVERLOAD_WARNING_PERCENT {
            log::warn!("decision: cpu load {}%", metrics.cpu_load_percent);
        }
        self.metrics = metrics;
    }

    /// Score of `task` under the current weights.
    pub fn score(&self, task: &TaskRecord, now: Tick, cpu: u8) -> u32 {
        let w = &self.config.weights;
        let mut score = (task.effective_priority.get() as u32).saturating_mul(w.priority) / 100;

        if let Some(ttd) = task.time_to_deadline(now) {
            let ttd = ttd.max(0) as u32;
            if ttd < DEADLINE_HORIZON {
                score = score.saturating_add((DEADLINE_HORIZON - ttd).saturating_mul(w.deadline) / 100);
            }
        }
        if now.wrapping_sub(task.last_run) >= STARVATION_THRESHOLD {
            score = score.saturating_add(w.fairness);
        }
        if task.affinity == cpu {
            score = score.saturating_add(w.affinity / 2);
        }
        score.min(MAX_SCORE)
    }

    /// Pick the next task.
    pub fn make_decision<P: Port>(
        &mut self,
        tasks: &TaskTable,
        queue: &ReadyQueue,
        policy: Policy,
        metrics: SystemMetrics,
        port: &P,
    ) -> Decision {
        let start = port.cycles();
        let now = metrics.timestamp;

        let mut decision = Decision {
            task: policy.select(tasks, queue, now),
            confidence: 100,
            decision_cycles: 0,
            preempt: false,
            migrate: false,
            reason: DecisionReason::Policy,
        };

        if queue.is_empty() {
            decision.reason = DecisionReason::Idle;
        } else if metrics.cpu_load_percent > self.config.high_load_threshold {
            if let Some((task, confidence)) = self.rescan(tasks, queue, now, metrics.current_cpu) {
                decision.task = Some(task);
                decision.confidence = confidence;
                decision.reason = DecisionReason::Scored;
                self.stats.scored_decisions += 1;
            }
        }

        if let Some(task) = decision.task.and_then(|id| tasks.get(id).ok()) {
            decision.migrate = task.affinity != metrics.current_cpu;
        }

        let elapsed = port.cycles().wrapping_sub(start);
        decision.decision_cycles = elapsed;
        self.stats.decisions += 1;
        self.stats.total_cycles += elapsed as u64;
        self.stats.max_cycles = self.stats.max_cycles.max(elapsed);
        if elapsed > MAX_DECISION_CYCLES {
            self.stats.overruns += 1;
            log::warn!("decision: took {} cycles", elapsed);
        }
        self.last = Some(decision);
        decision
    }

    /// Best-scoring task over the rescan window and its confidence.
    fn rescan(&self, tasks: &TaskTable, queue: &ReadyQueue, now: Tick, cpu: u8) -> Option<(TaskId, u8)> {
        let top_level = queue.highest_level()?;
        let floor = top_level.get().saturating_sub(self.config.rescan_levels);
        let mut level = Some(top_level);
        let mut best: Option<(TaskId, u32)> = None;
        let mut runner_up = 0u32;

        while let Some(current) = level.filter(|l| l.get() >= floor) {
            for (id, _) in queue.iter_level(current) {
                let Ok(task) = tasks.get(id) else {
                    continue;
                };
                let score = self.score(task, now, cpu);
                match best {
                    Some((_, top)) if score <= top => runner_up = runner_up.max(score),
                    Some((_, top)) => {
                        runner_up = top;
                        best = Some((id, score));
                    }
                    None => best = Some((id, score)),
                }
            }
            level = queue.next_level_below(current);
        }

        let (id, top) = best?;
        let confidence = match top {
            0 => 100,
            _ => (50 + (top - runner_up) * 50 / top).min(100),
        };
        Some((id, confidence as u8))
    }

    /// Whether `candidate` should take the CPU from `current` now.
    pub fn should_preempt(&mut self, tasks: &TaskTable, current: TaskId, candidate: TaskId, now: Tick) -> Result<bool, SchedError> {
        let cur = tasks.get(current)?;
        let cand = tasks.get(candidate)?;
        let delta = cand.effective_priority.delta(cur.effective_priority);

        let by_priority = delta >= PREEMPTION_THRESHOLD as i16;
        let by_slice = cur.slice_remaining == 0 && delta >= 0;
        let by_deadline = delta >= -(self.config.rescan_levels as i16)
            && cand
                .time_to_deadline(now)
                .is_some_and(|ttd| ttd <= URGENCY_WINDOW as i32);

        let preempt = by_priority || by_slice || by_deadline;
        if preempt {
            self.stats.preemption_decisions += 1;
        }
        Ok(preempt)
    }

    /// Slice length for `task` under the current load.
    pub fn calculate_quantum(&self, task: &TaskRecord) -> u32 {
        let base = match task.effective_priority.get() {
            p if p > 200 => MIN_TIME_SLICE,
            p if p > 100 => DEFAULT_TIME_SLICE / 2,
            _ => DEFAULT_TIME_SLICE,
        };
        let load = self.metrics.cpu_load_percent;
        let scaled = if load > self.config.high_load_threshold {
            base * 3 / 4
        } else if load < LOW_LOAD_THRESHOLD {
            base * 5 / 4
        } else {
            base
        };
        scaled.clamp(MIN_TIME_SLICE, MAX_TIME_SLICE)
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
