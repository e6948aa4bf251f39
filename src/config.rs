//! # rtcore Configuration
//!
//! Compile-time constants governing the scheduling core. Everything is
//! statically sized: pool capacities, priority levels and nesting bounds are
//! fixed here and checked against each other at compile time.
//!
//! Values that make sense to tune at run time (decision weights, the rescan
//! window, the integrity cadence) have their defaults here and are carried in
//! small `Copy` config structs by the component that uses them.

use static_assertions::const_assert;

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// Number of priority levels tracked by the ready-queue bitmap.
/// Level 0 is the idle level; the highest numeric level is the most urgent.
pub const PRIORITY_LEVELS: usize = 256;

/// Maximum number of tasks the task table can hold. Also the capacity of
/// the queue-node pool and of each per-level FIFO.
pub const MAX_TASKS: usize = 16;

/// Capacity of the queue-node pool.
pub const NODE_POOL_CAPACITY: usize = MAX_TASKS;

/// Capacity of the inheritance chain-entry pool.
pub const CHAIN_POOL_CAPACITY: usize = MAX_TASKS;

/// Number of resources that can be registered with the priority manager.
pub const MAX_RESOURCES: usize = 16;

/// Upper bound on transitive priority-inheritance propagation. Bounds the
/// worst-case inversion latency; exceeding it is reported to the caller.
pub const MAX_INHERITANCE_CHAIN: usize = 8;

/// Maximum nesting depth of `preemption_disable()`.
pub const MAX_PREEMPTION_DEPTH: u32 = 16;

// ---------------------------------------------------------------------------
// Time slicing
// ---------------------------------------------------------------------------

/// SysTick frequency in Hz.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Shortest time slice the decision engine will hand out, in ticks.
pub const MIN_TIME_SLICE: u32 = 1;

/// Longest time slice the decision engine will hand out, in ticks.
pub const MAX_TIME_SLICE: u32 = 100;

/// Base time slice in ticks for low and mid priority bands.
pub const DEFAULT_TIME_SLICE: u32 = 10;

// ---------------------------------------------------------------------------
// Decision engine
// ---------------------------------------------------------------------------

/// Minimum priority advantage a candidate needs to preempt a running task
/// whose slice has not expired.
pub const PREEMPTION_THRESHOLD: u8 = 10;

/// Default scoring weights, in percent.
pub const DEFAULT_PRIORITY_WEIGHT: u32 = 100;
pub const DEFAULT_DEADLINE_WEIGHT: u32 = 80;
pub const DEFAULT_AFFINITY_WEIGHT: u32 = 60;
pub const DEFAULT_FAIRNESS_WEIGHT: u32 = 20;
/// Largest weight `set_weights` accepts, in percent.
pub const MAX_WEIGHT_PERCENT: u32 = 1000;

/// Upper clamp on a candidate score.
pub const MAX_SCORE: u32 = 1000;

/// Deadlines further away than this many ticks contribute no urgency.
pub const DEADLINE_HORIZON: u32 = 100;

/// CPU load (percent) above which candidates are rescanned and scored.
pub const HIGH_LOAD_THRESHOLD: u8 = 80;

/// CPU load (percent) below which time slices are stretched.
pub const LOW_LOAD_THRESHOLD: u8 = 20;

/// CPU load (percent) above which an overload warning is logged.
pub const OVERLOAD_WARNING_PERCENT: u8 = 95;

/// A candidate whose deadline is at most this many ticks away may preempt.
pub const URGENCY_WINDOW: u32 = 10;

/// Ticks without CPU after which a ready task earns the fairness bonus.
pub const STARVATION_THRESHOLD: u32 = 50;

/// Number of priority levels below the highest occupied one that the
/// high-load rescan may consider. Zero keeps strict priority ordering and
/// limits scoring to tie-breaking within the highest level.
pub const DEFAULT_RESCAN_LEVELS: u8 = 0;

/// Cycle budget for a single scheduling decision. Overruns are logged.
pub const MAX_DECISION_CYCLES: u32 = 1000;

/// Window, in ticks, over which CPU load is sampled.
pub const LOAD_SAMPLE_TICKS: u32 = 100;

/// Period ticks mapped onto one priority step by rate-monotonic assignment.
pub const RM_TICKS_PER_LEVEL: u32 = 4;

// ---------------------------------------------------------------------------
// Integrity
// ---------------------------------------------------------------------------

/// Ready-queue operations between periodic integrity checks.
pub const INTEGRITY_CHECK_INTERVAL: u32 = 64;

// ---------------------------------------------------------------------------
// Context switch and critical sections
// ---------------------------------------------------------------------------

/// Word written across a fresh task stack. The lowest `STACK_GUARD_WORDS`
/// words must still hold it whenever the task is switched out.
pub const STACK_FILL_PATTERN: u32 = 0xDEAD_BEEF;

/// Guard words at the low end of every task stack.
pub const STACK_GUARD_WORDS: usize = 4;

/// Smallest stack, in words, `init_task` accepts.
pub const MIN_STACK_WORDS: usize = 64;

/// Cycle budget for one context switch. Overruns are logged.
pub const MAX_SWITCH_CYCLES: u32 = 400;

/// Cycle budget for one kernel critical section. Overruns are logged as
/// latency violations.
pub const CRITICAL_SECTION_BUDGET_CYCLES: u32 = 2000;

/// BASEPRI value used while preemption is disabled. Interrupts at this
/// priority or numerically higher (less urgent) are masked; PendSV and
/// SysTick sit at 0xFF.
pub const KERNEL_BASEPRI: u8 = 0x80;

// ---------------------------------------------------------------------------
// Compile-time checks
// ---------------------------------------------------------------------------

const_assert!(PRIORITY_LEVELS % 32 == 0);
const_assert!(PRIORITY_LEVELS <= 256);
const_assert!(MAX_TASKS > 0 && MAX_TASKS <= u16::MAX as usize);
const_assert!(NODE_POOL_CAPACITY >= MAX_TASKS);
const_assert!(MAX_INHERITANCE_CHAIN > 0 && MAX_INHERITANCE_CHAIN <= MAX_TASKS);
const_assert!(MIN_TIME_SLICE > 0);
const_assert!(MIN_TIME_SLICE <= DEFAULT_TIME_SLICE && DEFAULT_TIME_SLICE <= MAX_TIME_SLICE);
const_assert!(LOW_LOAD_THRESHOLD < HIGH_LOAD_THRESHOLD && HIGH_LOAD_THRESHOLD <= 100);
const_assert!(INTEGRITY_CHECK_INTERVAL > 0);
const_assert!(MIN_STACK_WORDS > STACK_GUARD_WORDS + 16);
const_assert!(RM_TICKS_PER_LEVEL > 0);
const_assert!(DEFAULT_PRIORITY_WEIGHT <= MAX_WEIGHT_PERCENT && DEFAULT_DEADLINE_WEIGHT <= MAX_WEIGHT_PERCENT);
const_assert!(DEFAULT_AFFINITY_WEIGHT <= MAX_WEIGHT_PERCENT && DEFAULT_FAIRNESS_WEIGHT <= MAX_WEIGHT_PERCENT);
