//! # rtcore
//!
//! Scheduling core of a real-time kernel for single-core ARM Cortex-M4
//! microcontrollers.
//!
//! ## Overview
//!
//! rtcore decides which task runs next and moves the machine between tasks:
//!
//! - **O(1) ready queue**: a two-level bitmap over 256 priority levels with
//!   one FIFO list per level, built from a static node pool
//! - **Integrity monitor**: checksums, a mirror bitmap and cycle detection
//!   on the queue, with graded repair
//! - **Priority manager**: transitive priority inheritance with a bounded
//!   chain, and per-resource ceiling protocols
//! - **Decision engine**: policy selection plus load-triggered scoring
//! - **Context switch coordinator**: frame save/restore with stack checks,
//!   nested preemption control and latency accounting
//!
//! Higher numeric priority is more urgent. Level 0 belongs to the idle task.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Application Tasks                     │
//! ├─────────────────────────────────────────────────────────┤
//! │                Kernel API (kernel.rs)                   │
//! │     init · create_task · start · yield · block_on       │
//! ├─────────────────────────────────────────────────────────┤
//! │              Scheduler facade (scheduler.rs)            │
//! │           tick · schedule · dispatch · lifecycle        │
//! ├──────────────┬──────────────┬─────────────┬─────────────┤
//! │ Ready queue  │  Priority    │  Decision   │  Context    │
//! │ bitmap.rs    │  manager     │  engine     │  switch     │
//! │ ready_queue  │  priority.rs │  decision.rs│  context.rs │
//! │ integrity.rs │              │  policy.rs  │  preemption │
//! ├──────────────┴──────────────┴─────────────┴─────────────┤
//! │       Task table (task.rs) · Static pools (pool.rs)     │
//! ├─────────────────────────────────────────────────────────┤
//! │     Port trait (arch/) · Critical sections (sync.rs)    │
//! │   Cortex-M4: SysTick · DWT · BASEPRI · PendSV           │
//! │   Host:      SimPort                                    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No heap**: every table, pool and list is statically sized in
//!   [`config`]
//! - **Handles, not pointers**: queue nodes and inheritance entries are
//!   addressed by generation-checked pool handles
//! - **Caller-owned stacks**: tasks run on `&'static mut [u32]` regions,
//!   usually [`task::Stack`]
//! - **One lock**: all scheduler state sits behind a
//!   `critical_section::Mutex`

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod pool;
pub mod task;
pub mod bitmap;
pub mod ready_queue;
pub mod integrity;
pub mod priority;
pub mod policy;
pub mod decision;
pub mod context;
pub mod preemption;
pub mod scheduler;
pub mod arch;
pub mod kernel;
pub mod sync;

pub use error::SchedError;
pub use task::{Priority, TaskId};
