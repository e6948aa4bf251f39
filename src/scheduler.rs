//! # Scheduler
//!
//! Ties the components together behind one owner with a typed lifecycle.
//! The kernel keeps a single `Scheduler` in a critical-section mutex; every
//! method here assumes that the caller holds the critical section.
//!
//! ## Scheduling Cycle
//!
//! ```text
//!   SysTick ─► tick()
//!                ├─ charge the running task, count down its slice
//!                ├─ sample CPU load every LOAD_SAMPLE_TICKS
//!                ├─ re-arm periodic deadlines
//!                └─ more urgent work queued? ─► request_switch (PendSV)
//!
//!   PendSV  ─► dispatch(psp)
//!                ├─ schedule(): decision engine + should_preempt
//!                │     preempted task goes back to the tail of its level
//!                └─ ContextSwitch::switch(): save old frame, restore new
//! ```
//!
//! The running task is never in the ready queue. The idle task is never
//! queued either; the queue returns it when nothing else is ready.
//!
//! ## Lifecycle
//!
//! ```text
//!   Uninitialized ──init()──► Ready ──start()──► Running
//!         ▲                     │                  │
//!         │                     └──shutdown()──────┴──► Shutdown ──init()──► Ready
//! ```

use heapless::Vec;

use crate::arch::Port;
use crate::config::{CRITICAL_SECTION_BUDGET_CYCLES, LOAD_SAMPLE_TICKS, MAX_TASKS};
use crate::context::ContextSwitch;
use crate::decision::{Decision, DecisionEngine, SystemMetrics};
use crate::error::SchedError;
use crate::integrity::RepairLevel;
use crate::policy::{Policy, SchedulingPolicy};
use crate::preemption::PreemptionControl;
use crate::priority::{PriorityManager, Protocol, ResourceId};
use crate::ready_queue::ReadyQueue;
use crate::task::{Priority, TaskEntry, TaskId, TaskParams, TaskState, TaskTable, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Ready,
    Running,
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u32,
    pub dispatches: u32,
    pub deadline_misses: u32,
    pub critical_sections: u32,
    pub max_critical_cycles: u32,
    pub critical_violations: u32,
}

/// Busy/total ticks in the current load window.
#[derive(Debug, Clone, Copy, Default)]
struct LoadWindow {
    busy: u32,
    total: u32,
    switches: u32,
}

pub struct Scheduler<P: Port> {
    port: P,
    lifecycle: Lifecycle,
    policy: Policy,

    pub(crate) tasks: TaskTable,
    pub(crate) queue: ReadyQueue,
    pub(crate) priority: PriorityManager,
    pub(crate) decision: DecisionEngine,
    pub(crate) context: ContextSwitch,
    pub(crate) preemption: PreemptionControl,

    current: Option<TaskId>,
    idle: Option<TaskId>,
    /// Set when a switch has been requested and not yet dispatched.
    pub needs_reschedule: bool,
    /// The outgoing task gave up the CPU on its own.
    voluntary: bool,

    load: LoadWindow,
    stats: SchedulerStats,
}

impl<P: Port> Scheduler<P> {
    pub const fn new(port: P) -> Self {
        Self {
            port,
            lifecycle: Lifecycle::Uninitialized,
            policy: Policy::Priority,
            tasks: TaskTable::new(),
            queue: ReadyQueue::new(),
            priority: PriorityManager::new(),
            decision: DecisionEngine::new(),
            context: ContextSwitch::new(),
            preemption: PreemptionControl::new(),
            current: None,
            idle: None,
            needs_reschedule: false,
            voluntary: false,
            load: LoadWindow {
                busy: 0,
                total: 0,
                switches: 0,
            },
            stats: SchedulerStats {
                ticks: 0,
                dispatches: 0,
                deadline_misses: 0,
                critical_sections: 0,
                max_critical_cycles: 0,
                critical_violations: 0,
            },
        }
    }

    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    #[inline]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    #[inline]
    pub fn policy(&self) -> Policy {
        self.policy
    }

    #[inline]
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    #[inline]
    pub fn idle_task(&self) -> Option<TaskId> {
        self.idle
    }

    #[inline]
    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    #[inline]
    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    #[inline]
    pub fn queue(&self) -> &ReadyQueue {
        &self.queue
    }

    #[inline]
    pub fn decision_engine(&self) -> &DecisionEngine {
        &self.decision
    }

    #[inline]
    pub fn priority_manager(&self) -> &PriorityManager {
        &self.priority
    }

    #[inline]
    pub fn context(&self) -> &ContextSwitch {
        &self.context
    }

    #[inline]
    pub fn preemption(&self) -> &PreemptionControl {
        &self.preemption
    }

    #[inline]
    fn now(&self) -> Tick {
        self.port.ticks()
    }

    fn ensure_ready(&self) -> Result<(), SchedError> {
        match self.lifecycle {
            Lifecycle::Ready | Lifecycle::Running => Ok(()),
            Lifecycle::Uninitialized | Lifecycle::Shutdown => Err(SchedError::NotInitialized),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bring the scheduler into service with `policy`.
    pub fn init(&mut self, policy: Policy) -> Result<(), SchedError> {
        match self.lifecycle {
            Lifecycle::Ready | Lifecycle::Running => return Err(SchedError::AlreadyExists),
            Lifecycle::Shutdown => self.reset(),
            Lifecycle::Uninitialized => {}
        }
        self.policy = policy;
        self.lifecycle = Lifecycle::Ready;
        log::info!("scheduler: ready, policy {:?}", policy);
        Ok(())
    }

    fn reset(&mut self) {
        self.tasks = TaskTable::new();
        self.queue = ReadyQueue::new();
        self.priority = PriorityManager::new();
        self.decision = DecisionEngine::new();
        self.context = ContextSwitch::new();
        self.preemption = PreemptionControl::new();
        self.current = None;
        self.idle = None;
        self.needs_reschedule = false;
        self.voluntary = false;
        self.load = LoadWindow::default();
        self.stats = SchedulerStats::default();
    }

    /// Take the scheduler out of service. Queued tasks are dropped from the
    /// queue; task records stay until the next `init`.
    pub fn shutdown(&mut self) -> Result<(), SchedError> {
        self.ensure_ready()?;
        self.queue.clear(&mut self.tasks);
        self.current = None;
        self.lifecycle = Lifecycle::Shutdown;
        log::info!("scheduler: shut down");
        Ok(())
    }

    /// Switch the scheduling policy. Existing static priorities are kept.
    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    // -----------------------------------------------------------------------
    // Task management
    // -----------------------------------------------------------------------

    /// Create a task, build its initial frame and make it ready.
    ///
    /// Level 0 is reserved for the idle task; see [`Self::create_idle_task`].
    pub fn create_task(&mut self, params: TaskParams, stack: &'static mut [u32], entry: TaskEntry, param: usize) -> Result<TaskId, SchedError> {
        self.ensure_ready()?;
        let priority = self.policy.static_priority_for(&params)?;
        if priority == Priority::IDLE {
            return Err(SchedError::InvalidPriority);
        }
        let params = TaskParams { priority, ..params };
        let id = self.spawn_with_stack(&params, stack, entry, param)?;

        let now = self.now();
        self.tasks.get_mut(id)?.state = TaskState::Ready;
        if let Err(err) = self.queue.insert(&mut self.tasks, id, now) {
            self.discard_record(id);
            return Err(err);
        }
        log::info!("scheduler: created {} at {}", id, priority);
        self.check_preemption();
        Ok(id)
    }

    /// Create the idle task. It runs whenever nothing else is ready and is
    /// the fallback when a context cannot be restored.
    pub fn create_idle_task(&mut self, stack: &'static mut [u32], entry: TaskEntry) -> Result<TaskId, SchedError> {
        self.ensure_ready()?;
        if self.idle.is_some() {
            return Err(SchedError::AlreadyExists);
        }
        let id = self.spawn_with_stack(&TaskParams::new(Priority::IDLE), stack, entry, 0)?;
        self.tasks.get_mut(id)?.state = TaskState::Ready;
        self.idle = Some(id);
        self.queue.set_idle_task(Some(id));
        self.context.set_idle(Some(id));
        Ok(id)
    }

    fn spawn_with_stack(&mut self, params: &TaskParams, stack: &'static mut [u32], entry: TaskEntry, param: usize) -> Result<TaskId, SchedError> {
        let id = self.tasks.spawn(params, self.now())?;
        self.tasks.get_mut(id)?.stack = Some(stack);
        if let Err(err) = self.context.init_task(&mut self.tasks, id, entry, param) {
            self.discard_record(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Free a record nothing else references yet.
    fn discard_record(&mut self, id: TaskId) {
        if let Err(err) = self.tasks.destroy(id) {
            log::warn!("scheduler: cannot free {}: {}", id, err);
        }
    }

    /// Free a task's record. The running task must use `exit_current`.
    pub fn destroy_task(&mut self, id: TaskId) -> Result<(), SchedError> {
        self.ensure_ready()?;
        if self.current == Some(id) && self.tasks.get(id)?.state == TaskState::Running {
            return Err(SchedError::InvalidState);
        }
        self.detach(id)?;
        self.tasks.destroy(id)?;
        if self.idle == Some(id) {
            self.idle = None;
            self.queue.set_idle_task(None);
            self.context.set_idle(None);
        }
        if self.current == Some(id) {
            self.current = None;
        }
        Ok(())
    }

    /// Cut every scheduling relation `id` has: queue membership, the
    /// resource it waits on, waiters on it, inheritance and held ceilings.
    fn detach(&mut self, id: TaskId) -> Result<(), SchedError> {
        let now = self.now();
        if self.tasks.get(id)?.blocked_on.is_some() {
            self.stop_waiting(id)?;
        }
        if self.tasks.get(id)?.is_queued() {
            self.queue.remove(&mut self.tasks, id, now)?;
        }
        let waiters: Vec<TaskId, MAX_TASKS> = self
            .tasks
            .iter()
            .filter(|t| t.blocked_on == Some(id) && t.state == TaskState::Blocked)
            .map(|t| t.id)
            .collect();
        for waiter in waiters {
            self.unblock(waiter)?;
        }
        self.priority.discard_entries(&mut self.tasks, id)?;
        self.priority.drop_holds(id);
        Ok(())
    }

    /// Clear `id.blocked_on` and let the tasks it was lending priority to
    /// drop what they no longer need.
    fn stop_waiting(&mut self, id: TaskId) -> Result<(), SchedError> {
        let now = self.now();
        let ancestors = PriorityManager::blocking_chain(&self.tasks, id);
        self.tasks.get_mut(id)?.blocked_on = None;
        for ancestor in ancestors {
            self.priority.inherit_release(&mut self.tasks, &mut self.queue, ancestor, now)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    fn make_ready(&mut self, id: TaskId) -> Result<(), SchedError> {
        let now = self.now();
        self.tasks.get_mut(id)?.state = TaskState::Ready;
        if Some(id) != self.idle {
            self.queue.insert(&mut self.tasks, id, now)?;
        }
        self.check_preemption();
        Ok(())
    }

    /// Give up the CPU; the task goes to the tail of its level.
    pub fn yield_current(&mut self) -> Result<(), SchedError> {
        self.ensure_ready()?;
        let id = self.current.ok_or(SchedError::InvalidState)?;
        let task = self.tasks.get_mut(id)?;
        if task.state != TaskState::Running {
            return Err(SchedError::InvalidState);
        }
        task.voluntary_yields += 1;
        self.make_ready(id)?;
        self.request_switch(true);
        Ok(())
    }

    /// Block `id` on a resource held by `owner` (or on an event when
    /// `owner` is `None`). The owner inherits the waiter's priority.
    ///
    /// The task is blocked even if inheritance reports `ChainTooDeep`; the
    /// error is still returned so the caller sees the bound was hit. On any
    /// other error, such as `ChainPoolExhausted`, nothing changes.
    pub fn block_on(&mut self, id: TaskId, owner: Option<TaskId>) -> Result<(), SchedError> {
        self.block(id, owner, true)
    }

    /// Block `id` until `resource` is released, applying the resource's
    /// protocol.
    pub fn wait_for_resource(&mut self, id: TaskId, resource: ResourceId) -> Result<(), SchedError> {
        self.ensure_ready()?;
        let holder = self.priority.holder(resource)?.ok_or(SchedError::InvalidState)?;
        let inherit = self.priority.protocol(resource)? == Protocol::Inherit;
        self.block(id, Some(holder), inherit)
    }

    fn block(&mut self, id: TaskId, owner: Option<TaskId>, inherit: bool) -> Result<(), SchedError> {
        self.ensure_ready()?;
        if !matches!(self.tasks.get(id)?.state, TaskState::Ready | TaskState::Running) {
            return Err(SchedError::InvalidState);
        }
        if let Some(owner) = owner {
            self.tasks.get(owner)?;
            if owner == id || PriorityManager::blocking_chain(&self.tasks, owner).contains(&id) {
                log::warn!("scheduler: {} waiting on {} would deadlock", id, owner);
                return Err(SchedError::Deadlock);
            }
        }

        let now = self.now();
        let inherited = match owner {
            Some(owner) if inherit => self
                .priority
                .inherit_apply(&mut self.tasks, &mut self.queue, owner, id, now)
                .map(|_| ()),
            _ => Ok(()),
        };
        // Only a truncated chain still blocks; any other failure leaves the
        // task runnable.
        if let Err(err) = inherited {
            if err != SchedError::ChainTooDeep {
                return Err(err);
            }
        }

        if self.tasks.get(id)?.is_queued() {
            self.queue.remove(&mut self.tasks, id, now)?;
        }
        let task = self.tasks.get_mut(id)?;
        task.state = TaskState::Blocked;
        task.blocked_on = owner;
        log::trace!("scheduler: {} blocked on {:?}", id, owner);

        if self.current == Some(id) {
            self.request_switch(true);
        } else {
            self.check_preemption();
        }
        inherited
    }

    /// Make a blocked task ready again. Priority it lent is withdrawn.
    pub fn unblock(&mut self, id: TaskId) -> Result<(), SchedError> {
        self.ensure_ready()?;
        if self.tasks.get(id)?.state != TaskState::Blocked {
            return Err(SchedError::InvalidState);
        }
        self.stop_waiting(id)?;
        self.make_ready(id)
    }

    /// Take a task out of scheduling until `resume`.
    pub fn suspend(&mut self, id: TaskId) -> Result<(), SchedError> {
        self.ensure_ready()?;
        match self.tasks.get(id)?.state {
            TaskState::Ready | TaskState::Running => {}
            TaskState::Blocked => self.stop_waiting(id)?,
            _ => return Err(SchedError::InvalidState),
        }
        let now = self.now();
        if self.tasks.get(id)?.is_queued() {
            self.queue.remove(&mut self.tasks, id, now)?;
        }
        self.tasks.get_mut(id)?.state = TaskState::Suspended;
        if self.current == Some(id) {
            self.request_switch(true);
        }
        Ok(())
    }

    /// Make a suspended task ready. Also re-readies tasks orphaned by a
    /// queue repair.
    pub fn resume(&mut self, id: TaskId) -> Result<(), SchedError> {
        self.ensure_ready()?;
        if self.tasks.get(id)?.state != TaskState::Suspended {
            return Err(SchedError::InvalidState);
        }
        self.make_ready(id)
    }

    /// The running task has finished. Its record stays `Terminated` until
    /// destroyed.
    pub fn exit_current(&mut self) -> Result<(), SchedError> {
        self.ensure_ready()?;
        let id = self.current.ok_or(SchedError::InvalidState)?;
        self.detach(id)?;
        self.tasks.get_mut(id)?.state = TaskState::Terminated;
        log::info!("scheduler: {} exited", id);
        self.request_switch(true);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tick and dispatch
    // -----------------------------------------------------------------------

    fn is_running(&self, id: TaskId) -> bool {
        self.tasks.get(id).is_ok_and(|t| t.state == TaskState::Running)
    }

    fn request_switch(&mut self, voluntary: bool) {
        self.voluntary |= voluntary;
        self.needs_reschedule = true;
        self.preemption.request_switch(&self.port);
    }

    /// Request a switch if something queued outranks the running task.
    fn check_preemption(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        let Some(level) = self.queue.highest_level() else {
            return;
        };
        let outranked = match self.current.and_then(|id| self.tasks.get(id).ok()) {
            Some(task) if task.state == TaskState::Running => level > task.effective_priority,
            _ => true,
        };
        if outranked {
            self.request_switch(false);
        }
    }

    fn metrics_now(&self) -> SystemMetrics {
        SystemMetrics {
            timestamp: self.now(),
            ready_count: self.queue.len() as u16,
            current_cpu: self.port.current_cpu(),
            ..self.decision.metrics()
        }
    }

    /// Scheduler tick. Returns true if a switch was requested.
    pub fn tick(&mut self) -> bool {
        if self.lifecycle != Lifecycle::Running {
            return false;
        }
        let now = self.now();
        self.stats.ticks = self.stats.ticks.wrapping_add(1);

        let mut expired = false;
        if let Some(id) = self.current {
            let idle = self.idle == Some(id);
            if let Ok(task) = self.tasks.get_mut(id) {
                if task.state == TaskState::Running {
                    task.run_ticks = task.run_ticks.wrapping_add(1);
                    if !idle {
                        self.load.busy += 1;
                    }
                    if task.slice_remaining > 0 {
                        task.slice_remaining -= 1;
                        expired = task.slice_remaining == 0;
                    }
                }
            }
        }

        self.load.total += 1;
        if self.load.total >= LOAD_SAMPLE_TICKS {
            self.sample_load(now);
        }

        for task in self.tasks.iter_mut() {
            if task.rearm_deadline(now) && matches!(task.state, TaskState::Ready | TaskState::Running) {
                self.stats.deadline_misses += 1;
                log::debug!("scheduler: {} missed its deadline", task.id);
            }
        }

        if expired {
            self.request_switch(false);
        } else {
            self.check_preemption();
        }
        self.needs_reschedule
    }

    fn sample_load(&mut self, now: Tick) {
        let load = (self.load.busy * 100 / self.load.total.max(1)).min(100) as u8;
        let metrics = SystemMetrics {
            cpu_load_percent: load,
            ready_count: self.queue.len() as u16,
            context_switch_rate: self.load.switches,
            timestamp: now,
            current_cpu: self.port.current_cpu(),
        };
        self.decision.update_metrics(metrics);
        self.load = LoadWindow::default();
    }

    /// Decide which task runs next and update task states accordingly.
    /// Returns the task that should be running.
    pub fn schedule(&mut self) -> Result<Option<TaskId>, SchedError> {
        self.ensure_ready()?;
        let now = self.now();
        let metrics = self.metrics_now();
        let decision = self
            .decision
            .make_decision(&self.tasks, &self.queue, self.policy, metrics, &self.port);
        let running = self.current.filter(|id| self.is_running(*id));

        let Some(candidate) = decision.task.or(self.idle) else {
            return Ok(running);
        };

        if let Some(current) = running {
            if current == candidate || Some(candidate) == self.idle {
                self.refill_if_expired(current)?;
                return Ok(Some(current));
            }
            if Some(current) != self.idle && !self.decision.should_preempt(&self.tasks, current, candidate, now)? {
                self.refill_if_expired(current)?;
                return Ok(Some(current));
            }
            let task = self.tasks.get_mut(current)?;
            task.state = TaskState::Ready;
            task.preemptions += 1;
            if Some(current) != self.idle {
                self.queue.insert(&mut self.tasks, current, now)?;
            }
            log::trace!("scheduler: {} preempted by {}", current, candidate);
        }

        if self.tasks.get(candidate)?.is_queued() {
            self.queue.remove(&mut self.tasks, candidate, now)?;
        }
        self.activate(candidate, now)?;
        Ok(Some(candidate))
    }

    fn refill_if_expired(&mut self, id: TaskId) -> Result<(), SchedError> {
        if self.tasks.get(id)?.slice_remaining == 0 {
            self.grant_slice(id)?;
        }
        Ok(())
    }

    fn grant_slice(&mut self, id: TaskId) -> Result<(), SchedError> {
        let task = self.tasks.get(id)?;
        let slice = self.policy.time_slice(task, self.decision.calculate_quantum(task));
        self.tasks.get_mut(id)?.slice_remaining = slice;
        Ok(())
    }

    fn activate(&mut self, id: TaskId, now: Tick) -> Result<(), SchedError> {
        self.grant_slice(id)?;
        let task = self.tasks.get_mut(id)?;
        task.state = TaskState::Running;
        task.last_run = now;
        self.current = Some(id);
        Ok(())
    }

    /// Switch handler body. `psp` is the outgoing task's stack pointer after
    /// its callee-saved registers were pushed; the return value is the stack
    /// pointer to resume from.
    pub fn dispatch(&mut self, psp: usize) -> usize {
        let from = self.current;
        self.needs_reschedule = false;
        let voluntary = core::mem::take(&mut self.voluntary);

        let next = match self.schedule() {
            Ok(Some(next)) => next,
            Ok(None) => return psp,
            Err(err) => {
                log::warn!("scheduler: selection failed: {}", err);
                return psp;
            }
        };
        if Some(next) == from {
            return psp;
        }

        let outgoing = from.filter(|id| {
            self.tasks
                .get(*id)
                .is_ok_and(|t| t.state != TaskState::Terminated)
        });
        let (resumed, sp) = self
            .context
            .switch(&mut self.tasks, outgoing, psp, next, &self.port, voluntary);

        if resumed != next {
            // `next` had no usable context; the idle task runs instead.
            if let Ok(task) = self.tasks.get_mut(next) {
                task.state = TaskState::Suspended;
            }
            let now = self.now();
            if let Err(err) = self.activate(resumed, now) {
                log::error!("scheduler: cannot activate {}: {}", resumed, err);
            }
        }
        self.stats.dispatches = self.stats.dispatches.wrapping_add(1);
        self.load.switches += 1;
        sp
    }

    /// Pick the first task and return the stack pointer to launch it from.
    pub fn start(&mut self) -> Result<usize, SchedError> {
        if self.lifecycle != Lifecycle::Ready {
            return Err(SchedError::NotInitialized);
        }
        let first = self.schedule()?.ok_or(SchedError::InvalidState)?;
        let (resumed, sp) = self
            .context
            .switch(&mut self.tasks, None, 0, first, &self.port, true);
        if resumed != first {
            let now = self.now();
            self.activate(resumed, now)?;
        }
        self.lifecycle = Lifecycle::Running;
        log::info!("scheduler: started with {}", resumed);
        Ok(sp)
    }

    /// Account for time spent holding the kernel critical section.
    pub fn record_critical_section(&mut self, cycles: u32) {
        self.stats.critical_sections = self.stats.critical_sections.wrapping_add(1);
        self.stats.max_critical_cycles = self.stats.max_critical_cycles.max(cycles);
        if cycles > CRITICAL_SECTION_BUDGET_CYCLES {
            self.stats.critical_violations += 1;
            log::warn!("scheduler: critical section held {} cycles", cycles);
        }
    }

    // -----------------------------------------------------------------------
    // Component operations
    // -----------------------------------------------------------------------

    pub fn ready_queue_insert(&mut self, id: TaskId) -> Result<(), SchedError> {
        let now = self.now();
        self.queue.insert(&mut self.tasks, id, now)?;
        self.check_preemption();
        Ok(())
    }

    pub fn ready_queue_remove(&mut self, id: TaskId) -> Result<(), SchedError> {
        let now = self.now();
        self.queue.remove(&mut self.tasks, id, now)
    }

    pub fn ready_queue_get_highest(&self) -> Option<TaskId> {
        self.queue.get_highest_priority()
    }

    pub fn ready_queue_validate(&mut self) -> Result<(), SchedError> {
        let now = self.now();
        self.queue.validate(now).map_err(SchedError::from)
    }

    pub fn ready_queue_repair(&mut self, level: RepairLevel) -> Result<(), SchedError> {
        let now = self.now();
        self.queue.repair(&mut self.tasks, level, now)
    }

    pub fn priority_set(&mut self, id: TaskId, priority: Priority) -> Result<(), SchedError> {
        let now = self.now();
        self.priority.set(&mut self.tasks, &mut self.queue, id, priority, now)?;
        self.check_preemption();
        Ok(())
    }

    pub fn priority_get(&self, id: TaskId) -> Result<Priority, SchedError> {
        self.priority.get(&self.tasks, id)
    }

    pub fn priority_boost(&mut self, id: TaskId, priority: Priority) -> Result<bool, SchedError> {
        let now = self.now();
        let raised = self.priority.boost(&mut self.tasks, &mut self.queue, id, priority, now)?;
        self.check_preemption();
        Ok(raised)
    }

    pub fn priority_restore(&mut self, id: TaskId) -> Result<(), SchedError> {
        let now = self.now();
        self.priority.restore(&mut self.tasks, &mut self.queue, id, now)?;
        self.check_preemption();
        Ok(())
    }

    pub fn priority_inherit_apply(&mut self, owner: TaskId, requester: TaskId) -> Result<bool, SchedError> {
        let now = self.now();
        let raised = self.priority.inherit_apply(&mut self.tasks, &mut self.queue, owner, requester, now)?;
        self.check_preemption();
        Ok(raised)
    }

    pub fn priority_inherit_release(&mut self, id: TaskId) -> Result<(), SchedError> {
        let now = self.now();
        self.priority.inherit_release(&mut self.tasks, &mut self.queue, id, now)?;
        self.check_preemption();
        Ok(())
    }

    pub fn register_resource(&mut self, resource: ResourceId, protocol: Protocol, ceiling: Priority) -> Result<(), SchedError> {
        self.priority.register_resource(resource, protocol, ceiling)
    }

    pub fn ceiling_set(&mut self, resource: ResourceId, ceiling: Priority) -> Result<(), SchedError> {
        let now = self.now();
        self.priority.ceiling_set(&mut self.tasks, &mut self.queue, resource, ceiling, now)
    }

    pub fn ceiling_get(&self, resource: ResourceId) -> Result<Priority, SchedError> {
        self.priority.ceiling_get(resource)
    }

    pub fn ceiling_enter(&mut self, id: TaskId, resource: ResourceId) -> Result<(), SchedError> {
        let now = self.now();
        self.priority.ceiling_enter(&mut self.tasks, &mut self.queue, id, resource, now)
    }

    pub fn ceiling_exit(&mut self, id: TaskId, resource: ResourceId) -> Result<(), SchedError> {
        let now = self.now();
        self.priority.ceiling_exit(&mut self.tasks, &mut self.queue, id, resource, now)?;
        self.check_preemption();
        Ok(())
    }

    pub fn decision_make(&mut self) -> Decision {
        let metrics = self.metrics_now();
        self.decision
            .make_decision(&self.tasks, &self.queue, self.policy, metrics, &self.port)
    }

    pub fn decision_should_preempt(&mut self, current: TaskId, candidate: TaskId) -> Result<bool, SchedError> {
        let now = self.now();
        self.decision.should_preempt(&self.tasks, current, candidate, now)
    }

    pub fn decision_calculate_quantum(&self, id: TaskId) -> Result<u32, SchedError> {
        Ok(self.decision.calculate_quantum(self.tasks.get(id)?))
    }

    pub fn decision_update_metrics(&mut self, metrics: SystemMetrics) {
        self.decision.update_metrics(metrics);
    }

    pub fn context_save(&mut self, id: TaskId, sp: usize) -> Result<(), SchedError> {
        self.context.save(&mut self.tasks, id, sp)
    }

    pub fn context_restore(&mut self, id: TaskId) -> Result<usize, SchedError> {
        self.context.restore(&mut self.tasks, id)
    }

    pub fn context_init_task(&mut self, id: TaskId, entry: TaskEntry, param: usize) -> Result<(), SchedError> {
        self.context.init_task(&mut self.tasks, id, entry, param)
    }

    pub fn context_switch(&mut self, from: Option<TaskId>, from_sp: usize, to: TaskId, voluntary: bool) -> (TaskId, usize) {
        self.context
            .switch(&mut self.tasks, from, from_sp, to, &self.port, voluntary)
    }

    pub fn preemption_disable(&mut self) {
        self.preemption.disable(&self.port);
    }

    pub fn preemption_enable(&mut self) -> bool {
        self.preemption.enable(&self.port)
    }

    pub fn preemption_point(&mut self) -> bool {
        self.preemption.preemption_point(&self.port)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::SimPort;
    use crate::config::{CHAIN_POOL_CAPACITY, MIN_STACK_WORDS};
    use crate::context::tests::make_stack;
    use crate::ready_queue::tests::p;

    extern "C" fn entry(_: usize) {}

    fn make_scheduler() -> Scheduler<SimPort> {
        let mut s = Scheduler::new(SimPort::new());
        s.init(Policy::Priority).unwrap();
        s.create_idle_task(make_stack(128), entry).unwrap();
        s
    }

    fn spawn(s: &mut Scheduler<SimPort>, prio: u8) -> TaskId {
        s.create_task(TaskParams::new(p(prio)), make_stack(128), entry, 0)
            .unwrap()
    }

    /// Run the switch handler as PendSV would and return who runs now.
    fn switch(s: &mut Scheduler<SimPort>) -> TaskId {
        let psp = s
            .current()
            .and_then(|id| s.tasks().get(id).ok())
            .map_or(0, |t| t.stack_pointer());
        s.dispatch(psp);
        s.current().unwrap()
    }

    fn advance(s: &mut Scheduler<SimPort>, ticks: u32) {
        for _ in 0..ticks {
            s.port().advance(1);
            s.tick();
        }
    }

    fn state(s: &Scheduler<SimPort>, id: TaskId) -> TaskState {
        s.tasks().get(id).unwrap().state
    }

    #[test]
    fn test_api_requires_init() {
        let mut s = Scheduler::new(SimPort::new());
        assert_eq!(
            s.create_task(TaskParams::new(p(3)), make_stack(128), entry, 0),
            Err(SchedError::NotInitialized)
        );
        assert_eq!(s.start(), Err(SchedError::NotInitialized));
        s.init(Policy::Priority).unwrap();
        assert_eq!(s.init(Policy::Priority), Err(SchedError::AlreadyExists));
    }

    #[test]
    fn test_start_runs_highest_priority() {
        let mut s = make_scheduler();
        let low = spawn(&mut s, 5);
        let high = spawn(&mut s, 20);

        let sp = s.start().unwrap();
        assert_eq!(sp, s.tasks().get(high).unwrap().stack_pointer());
        assert_eq!(s.current(), Some(high));
        assert_eq!(state(&s, high), TaskState::Running);
        assert!(!s.queue().contains(s.tasks(), high));
        assert!(s.queue().contains(s.tasks(), low));
        assert_eq!(s.lifecycle(), Lifecycle::Running);
    }

    #[test]
    fn test_idle_runs_when_nothing_ready() {
        let mut s = make_scheduler();
        s.start().unwrap();
        assert_eq!(s.current(), s.idle_task());

        let t = spawn(&mut s, 3);
        assert!(s.needs_reschedule);
        assert_eq!(switch(&mut s), t);
        assert_eq!(state(&s, s.idle_task().unwrap()), TaskState::Ready);
    }

    #[test]
    fn test_slice_expiry_rotates_equal_priority() {
        let mut s = make_scheduler();
        let a = spawn(&mut s, 10);
        let b = spawn(&mut s, 10);
        s.start().unwrap();
        assert_eq!(s.current(), Some(a));

        let slice = s.tasks().get(a).unwrap().slice_remaining;
        assert_eq!(slice, s.decision_calculate_quantum(a).unwrap());
        advance(&mut s, slice - 1);
        assert!(!s.needs_reschedule);
        advance(&mut s, 1);
        assert!(s.needs_reschedule);

        assert_eq!(switch(&mut s), b);
        assert_eq!(state(&s, a), TaskState::Ready);
        assert_eq!(s.tasks().get(a).unwrap().preemptions, 1);
        assert_eq!(s.context().stats().preemptive, 1);
    }

    #[test]
    fn test_preemption_threshold() {
        let mut s = make_scheduler();
        let base = spawn(&mut s, 10);
        s.start().unwrap();

        // Five levels above: wait for the slice.
        let near = spawn(&mut s, 15);
        assert_eq!(switch(&mut s), base);

        // Twenty levels above: immediate.
        let far = spawn(&mut s, 30);
        assert_eq!(switch(&mut s), far);
        assert!(s.queue().contains(s.tasks(), base));
        assert!(s.queue().contains(s.tasks(), near));
    }

    #[test]
    fn test_yield_moves_to_tail() {
        let mut s = make_scheduler();
        let a = spawn(&mut s, 8);
        let b = spawn(&mut s, 8);
        s.start().unwrap();

        s.yield_current().unwrap();
        assert_eq!(switch(&mut s), b);
        assert_eq!(s.tasks().get(a).unwrap().voluntary_yields, 1);
        assert_eq!(s.context().stats().voluntary, 2);

        // Alone at the top level, a yielding task gets the CPU straight back.
        let mut s = make_scheduler();
        let solo = spawn(&mut s, 8);
        s.start().unwrap();
        s.yield_current().unwrap();
        assert_eq!(switch(&mut s), solo);
    }

    #[test]
    fn test_block_and_unblock_with_inheritance() {
        let mut s = make_scheduler();
        let low = spawn(&mut s, 5);
        let high = spawn(&mut s, 40);
        s.start().unwrap();
        assert_eq!(s.current(), Some(high));

        s.block_on(high, Some(low)).unwrap();
        assert_eq!(state(&s, high), TaskState::Blocked);
        assert_eq!(s.priority_get(low), Ok(p(40)));
        assert_eq!(switch(&mut s), low);

        s.unblock(high).unwrap();
        assert_eq!(s.priority_get(low), Ok(p(5)));
        assert_eq!(switch(&mut s), high);
        assert_eq!(state(&s, low), TaskState::Ready);
    }

    #[test]
    fn test_block_detects_deadlock() {
        let mut s = make_scheduler();
        let a = spawn(&mut s, 5);
        let b = spawn(&mut s, 6);
        s.block_on(a, Some(b)).unwrap();
        assert_eq!(s.block_on(b, Some(a)), Err(SchedError::Deadlock));
        assert_eq!(state(&s, b), TaskState::Ready);
    }

    #[test]
    fn test_wait_for_resource_follows_protocol() {
        let mut s = make_scheduler();
        let holder = spawn(&mut s, 3);
        let waiter = spawn(&mut s, 30);
        let shared = ResourceId(1);
        let plain = ResourceId(2);
        s.register_resource(shared, Protocol::Inherit, p(1)).unwrap();
        s.register_resource(plain, Protocol::None, p(1)).unwrap();

        s.ceiling_enter(holder, plain).unwrap();
        s.wait_for_resource(waiter, plain).unwrap();
        assert_eq!(s.priority_get(holder), Ok(p(3)));
        s.unblock(waiter).unwrap();

        s.ceiling_enter(holder, shared).unwrap();
        s.wait_for_resource(waiter, shared).unwrap();
        assert_eq!(s.priority_get(holder), Ok(p(30)));
        assert_eq!(s.tasks().get(waiter).unwrap().blocked_on, Some(holder));
    }

    #[test]
    fn test_exit_releases_waiters() {
        let mut s = make_scheduler();
        let worker = spawn(&mut s, 20);
        let waiter = spawn(&mut s, 10);
        s.block_on(waiter, Some(worker)).unwrap();
        s.start().unwrap();
        assert_eq!(s.current(), Some(worker));

        s.exit_current().unwrap();
        assert_eq!(state(&s, worker), TaskState::Terminated);
        assert_eq!(state(&s, waiter), TaskState::Ready);
        assert_eq!(switch(&mut s), waiter);

        s.destroy_task(worker).unwrap();
        assert!(!s.tasks().contains(worker));
        assert_eq!(s.priority_manager().chain_entries_in_use(), 0);
    }

    #[test]
    fn test_suspend_and_resume() {
        let mut s = make_scheduler();
        let a = spawn(&mut s, 30);
        let b = spawn(&mut s, 4);
        s.start().unwrap();

        s.suspend(a).unwrap();
        assert_eq!(switch(&mut s), b);
        assert_eq!(s.resume(b), Err(SchedError::InvalidState));

        s.resume(a).unwrap();
        assert!(s.queue().contains(s.tasks(), a));
        assert_eq!(switch(&mut s), a);
    }

    #[test]
    fn test_destroy_running_task_refused() {
        let mut s = make_scheduler();
        let a = spawn(&mut s, 12);
        s.start().unwrap();
        assert_eq!(s.destroy_task(a), Err(SchedError::InvalidState));
    }

    #[test]
    fn test_idle_level_reserved() {
        let mut s = make_scheduler();
        assert_eq!(
            s.create_task(TaskParams::new(Priority::IDLE), make_stack(128), entry, 0),
            Err(SchedError::InvalidPriority)
        );
        assert_eq!(
            s.create_idle_task(make_stack(128), entry),
            Err(SchedError::AlreadyExists)
        );
    }

    #[test]
    fn test_rate_monotonic_assigns_priority() {
        let mut s = Scheduler::new(SimPort::new());
        s.init(Policy::RateMonotonic).unwrap();
        let fast = s
            .create_task(TaskParams::new(p(1)).with_period(4), make_stack(128), entry, 0)
            .unwrap();
        let slow = s
            .create_task(TaskParams::new(p(1)).with_period(400), make_stack(128), entry, 0)
            .unwrap();
        assert!(s.priority_get(fast).unwrap() > s.priority_get(slow).unwrap());
    }

    #[test]
    fn test_load_sampling() {
        let mut s = make_scheduler();
        s.start().unwrap();
        advance(&mut s, LOAD_SAMPLE_TICKS);
        assert_eq!(s.decision_engine().metrics().cpu_load_percent, 0);

        spawn(&mut s, 50);
        switch(&mut s);
        advance(&mut s, LOAD_SAMPLE_TICKS);
        assert_eq!(s.decision_engine().metrics().cpu_load_percent, 100);
    }

    #[test]
    fn test_deadline_miss_counted() {
        let mut s = make_scheduler();
        let t = s
            .create_task(
                TaskParams::new(p(9)).with_deadline(5).with_period(20),
                make_stack(128),
                entry,
                0,
            )
            .unwrap();
        s.start().unwrap();
        advance(&mut s, 5);
        assert_eq!(s.stats().deadline_misses, 1);
        assert_eq!(s.tasks().get(t).unwrap().deadline, Some(25));
    }

    #[test]
    fn test_preemption_disable_defers_switch() {
        let mut s = make_scheduler();
        spawn(&mut s, 10);
        s.start().unwrap();
        let pended = s.port().pended();

        s.preemption_disable();
        spawn(&mut s, 100);
        assert_eq!(s.port().pended(), pended);
        assert!(s.preemption_enable());
        assert_eq!(s.port().pended(), pended + 1);
    }

    #[test]
    fn test_critical_section_budget() {
        let mut s = make_scheduler();
        s.record_critical_section(10);
        s.record_critical_section(CRITICAL_SECTION_BUDGET_CYCLES + 1);
        let stats = s.stats();
        assert_eq!(stats.critical_sections, 2);
        assert_eq!(stats.critical_violations, 1);
        assert_eq!(stats.max_critical_cycles, CRITICAL_SECTION_BUDGET_CYCLES + 1);
    }

    #[test]
    fn test_shutdown_and_reinit() {
        let mut s = make_scheduler();
        spawn(&mut s, 10);
        s.shutdown().unwrap();
        assert!(s.queue().is_empty());
        assert_eq!(s.yield_current(), Err(SchedError::NotInitialized));
        s.init(Policy::Edf).unwrap();
        assert!(s.tasks().is_empty());
        assert_eq!(s.policy(), Policy::Edf);
    }

    #[test]
    fn test_short_stack_leaves_no_record() {
        let mut s = make_scheduler();
        let before = s.tasks().iter().count();
        for _ in 0..MAX_TASKS {
            assert_eq!(
                s.create_task(TaskParams::new(p(5)), make_stack(MIN_STACK_WORDS - 1), entry, 0),
                Err(SchedError::InvalidParameter)
            );
        }
        assert_eq!(s.tasks().iter().count(), before);
        // Every slot is still free.
        spawn(&mut s, 5);
    }

    #[test]
    fn test_exhausted_chain_pool_leaves_waiter_ready() {
        let mut s = make_scheduler();
        let chain: Vec<TaskId, 8> = (2..10).map(|prio| spawn(&mut s, prio)).collect();
        for pair in chain.windows(2) {
            s.block_on(pair[0], Some(pair[1])).unwrap();
        }
        let head = chain[0];
        for prio in [20, 30] {
            let waiter = spawn(&mut s, prio);
            s.block_on(waiter, Some(head)).unwrap();
        }
        assert_eq!(s.priority_manager().chain_entries_in_use(), CHAIN_POOL_CAPACITY);

        let late = spawn(&mut s, 40);
        let untouched = |s: &Scheduler<SimPort>| {
            let task = s.tasks().get(late).unwrap();
            assert_eq!(task.state, TaskState::Ready);
            assert!(task.is_queued());
            assert_eq!(task.blocked_on, None);
            for id in &chain {
                assert_eq!(s.priority_get(*id), Ok(p(30)));
            }
            assert_eq!(s.priority_manager().chain_entries_in_use(), CHAIN_POOL_CAPACITY);
        };

        assert_eq!(s.block_on(late, Some(head)), Err(SchedError::ChainPoolExhausted));
        untouched(&s);

        let bus = ResourceId(7);
        s.register_resource(bus, Protocol::Inherit, p(50)).unwrap();
        s.ceiling_enter(head, bus).unwrap();
        assert_eq!(s.wait_for_resource(late, bus), Err(SchedError::ChainPoolExhausted));
        untouched(&s);
    }
}
