//! # Kernel
//!
//! Global scheduler instance and the entry points the rest of the kernel
//! calls.
//!
//! The instance lives in a `critical_section::Mutex<RefCell<…>>`. Every
//! function here takes the critical section, borrows the scheduler, runs one
//! operation and records how long the section was held.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init()             ← select policy
//!         ├─► kernel::create_idle_task() ← fallback context
//!         ├─► kernel::create_task()      ← register tasks (×N)
//!         └─► kernel::start()            ← launch scheduler (no return)
//!               ├─► enable DWT cycle counter
//!               ├─► set PendSV/SysTick priorities
//!               ├─► configure SysTick
//!               └─► arch::start_first_task()
//! ```

use core::cell::RefCell;

use critical_section::Mutex;

use crate::arch::{ArchPort, Port};
use crate::decision::{Decision, SystemMetrics};
use crate::error::SchedError;
use crate::integrity::RepairLevel;
use crate::policy::Policy;
use crate::priority::{Protocol, ResourceId};
use crate::scheduler::Scheduler;
use crate::sync;
use crate::task::{Priority, TaskEntry, TaskId, TaskParams};

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

static KERNEL: Mutex<RefCell<Scheduler<ArchPort>>> =
    Mutex::new(RefCell::new(Scheduler::new(ArchPort::new())));

/// Run `f` on the global scheduler inside the kernel critical section.
///
/// # Panics
/// If called re-entrantly from inside `f`.
pub fn with_kernel<R>(f: impl FnOnce(&mut Scheduler<ArchPort>) -> R) -> R {
    sync::critical_section(|cs| {
        let mut kernel = KERNEL.borrow_ref_mut(cs);
        let start = kernel.port().cycles();
        let result = f(&mut kernel);
        let held = kernel.port().cycles().wrapping_sub(start);
        kernel.record_critical_section(held);
        result
    })
}

// ---------------------------------------------------------------------------
// Lifecycle and tasks
// ---------------------------------------------------------------------------

/// Initialize the scheduler. Must precede every other call.
pub fn init(policy: Policy) -> Result<(), SchedError> {
    with_kernel(|k| k.init(policy))
}

pub fn shutdown() -> Result<(), SchedError> {
    with_kernel(|k| k.shutdown())
}

/// Create a task and make it ready.
///
/// # Example
/// ```ignore
/// static mut STACK: Stack<256> = Stack::new();
/// let params = TaskParams::new(Priority::new(20)?).with_deadline(50).with_period(100);
/// kernel::create_task(params, stack, sensor_task, 0)?;
/// ```
pub fn create_task(params: TaskParams, stack: &'static mut [u32], entry: TaskEntry, param: usize) -> Result<TaskId, SchedError> {
    with_kernel(|k| k.create_task(params, stack, entry, param))
}

pub fn create_idle_task(stack: &'static mut [u32], entry: TaskEntry) -> Result<TaskId, SchedError> {
    with_kernel(|k| k.create_idle_task(stack, entry))
}

pub fn destroy_task(id: TaskId) -> Result<(), SchedError> {
    with_kernel(|k| k.destroy_task(id))
}

pub fn current_task() -> Option<TaskId> {
    with_kernel(|k| k.current())
}

/// Give up the CPU to the next task at the same or higher priority.
pub fn yield_task() -> Result<(), SchedError> {
    with_kernel(|k| k.yield_current())
}

pub fn block_on(id: TaskId, owner: Option<TaskId>) -> Result<(), SchedError> {
    with_kernel(|k| k.block_on(id, owner))
}

pub fn wait_for_resource(id: TaskId, resource: ResourceId) -> Result<(), SchedError> {
    with_kernel(|k| k.wait_for_resource(id, resource))
}

pub fn unblock(id: TaskId) -> Result<(), SchedError> {
    with_kernel(|k| k.unblock(id))
}

pub fn suspend(id: TaskId) -> Result<(), SchedError> {
    with_kernel(|k| k.suspend(id))
}

pub fn resume(id: TaskId) -> Result<(), SchedError> {
    with_kernel(|k| k.resume(id))
}

/// Called when a task function returns.
pub fn exit_current() {
    if let Err(err) = with_kernel(|k| k.exit_current()) {
        log::error!("kernel: exit failed: {}", err);
    }
}

// ---------------------------------------------------------------------------
// Interrupt entry points
// ---------------------------------------------------------------------------

/// Tick handler body. Returns true if a switch was requested.
pub fn on_tick() -> bool {
    with_kernel(|k| k.tick())
}

/// PendSV handler body: `psp` is the outgoing stack pointer after R4–R11
/// were pushed; returns the stack pointer to resume.
pub fn switch_from_isr(psp: usize) -> usize {
    with_kernel(|k| k.dispatch(psp))
}

/// Start scheduling. **Does not return.**
///
/// Interrupts stay disabled from here until the first task is entered.
/// With nothing to run the core sleeps forever.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn start(mut cp: cortex_m::Peripherals) -> ! {
    use crate::arch::cortex_m4;

    cortex_m::interrupt::disable();
    cortex_m4::enable_cycle_counter(&mut cp.DCB, &mut cp.DWT);
    cortex_m4::set_interrupt_priorities(&mut cp.SCB);
    cortex_m4::configure_systick(&mut cp.SYST);

    match with_kernel(|k| k.start()) {
        // SAFETY: interrupts are disabled and we are in Thread mode on MSP.
        Ok(sp) => unsafe { cortex_m4::start_first_task(sp) },
        Err(err) => {
            log::error!("kernel: cannot start: {}", err);
            loop {
                crate::arch::wait_for_interrupt();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ready queue
// ---------------------------------------------------------------------------

pub fn ready_queue_insert(id: TaskId) -> Result<(), SchedError> {
    with_kernel(|k| k.ready_queue_insert(id))
}

pub fn ready_queue_remove(id: TaskId) -> Result<(), SchedError> {
    with_kernel(|k| k.ready_queue_remove(id))
}

pub fn ready_queue_get_highest() -> Option<TaskId> {
    with_kernel(|k| k.ready_queue_get_highest())
}

pub fn ready_queue_validate() -> Result<(), SchedError> {
    with_kernel(|k| k.ready_queue_validate())
}

pub fn ready_queue_repair(level: RepairLevel) -> Result<(), SchedError> {
    with_kernel(|k| k.ready_queue_repair(level))
}

// ---------------------------------------------------------------------------
// Priority management
// ---------------------------------------------------------------------------

pub fn priority_set(id: TaskId, priority: Priority) -> Result<(), SchedError> {
    with_kernel(|k| k.priority_set(id, priority))
}

pub fn priority_get(id: TaskId) -> Result<Priority, SchedError> {
    with_kernel(|k| k.priority_get(id))
}

pub fn priority_boost(id: TaskId, priority: Priority) -> Result<bool, SchedError> {
    with_kernel(|k| k.priority_boost(id, priority))
}

pub fn priority_restore(id: TaskId) -> Result<(), SchedError> {
    with_kernel(|k| k.priority_restore(id))
}

pub fn priority_inherit_apply(owner: TaskId, requester: TaskId) -> Result<bool, SchedError> {
    with_kernel(|k| k.priority_inherit_apply(owner, requester))
}

pub fn priority_inherit_release(id: TaskId) -> Result<(), SchedError> {
    with_kernel(|k| k.priority_inherit_release(id))
}

pub fn register_resource(resource: ResourceId, protocol: Protocol, ceiling: Priority) -> Result<(), SchedError> {
    with_kernel(|k| k.register_resource(resource, protocol, ceiling))
}

pub fn ceiling_set(resource: ResourceId, ceiling: Priority) -> Result<(), SchedError> {
    with_kernel(|k| k.ceiling_set(resource, ceiling))
}

pub fn ceiling_get(resource: ResourceId) -> Result<Priority, SchedError> {
    with_kernel(|k| k.ceiling_get(resource))
}

pub fn ceiling_enter(id: TaskId, resource: ResourceId) -> Result<(), SchedError> {
    with_kernel(|k| k.ceiling_enter(id, resource))
}

pub fn ceiling_exit(id: TaskId, resource: ResourceId) -> Result<(), SchedError> {
    with_kernel(|k| k.ceiling_exit(id, resource))
}

// ---------------------------------------------------------------------------
// Decision engine
// ---------------------------------------------------------------------------

pub fn decision_make() -> Decision {
    with_kernel(|k| k.decision_make())
}

pub fn decision_should_preempt(current: TaskId, candidate: TaskId) -> Result<bool, SchedError> {
    with_kernel(|k| k.decision_should_preempt(current, candidate))
}

pub fn decision_calculate_quantum(id: TaskId) -> Result<u32, SchedError> {
    with_kernel(|k| k.decision_calculate_quantum(id))
}

pub fn decision_update_metrics(metrics: SystemMetrics) {
    with_kernel(|k| k.decision_update_metrics(metrics))
}

// ---------------------------------------------------------------------------
// Context switch and preemption
// ---------------------------------------------------------------------------

pub fn context_save(id: TaskId, sp: usize) -> Result<(), SchedError> {
    with_kernel(|k| k.context_save(id, sp))
}

pub fn context_restore(id: TaskId) -> Result<usize, SchedError> {
    with_kernel(|k| k.context_restore(id))
}

pub fn context_init_task(id: TaskId, entry: TaskEntry, param: usize) -> Result<(), SchedError> {
    with_kernel(|k| k.context_init_task(id, entry, param))
}

pub fn context_switch(from: Option<TaskId>, from_sp: usize, to: TaskId, voluntary: bool) -> (TaskId, usize) {
    with_kernel(|k| k.context_switch(from, from_sp, to, voluntary))
}

pub fn preemption_disable() {
    with_kernel(|k| k.preemption_disable())
}

/// Returns true if a deferred switch was issued.
pub fn preemption_enable() -> bool {
    with_kernel(|k| k.preemption_enable())
}

pub fn preemption_point() -> bool {
    with_kernel(|k| k.preemption_point())
}

/// Preemption disabled for the guard's lifetime.
///
/// ```ignore
/// {
///     let _guard = PreemptionGuard::new();
///     update_shared_buffers();
/// } // deferred switch, if any, happens here
/// ```
pub struct PreemptionGuard {
    _not_send: core::marker::PhantomData<*mut ()>,
}

impl PreemptionGuard {
    pub fn new() -> Self {
        preemption_disable();
        Self {
            _not_send: core::marker::PhantomData,
        }
    }
}

impl Default for PreemptionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptionGuard {
    fn drop(&mut self) {
        preemption_enable();
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::make_stack;
    use crate::task::TaskState;

    extern "C" fn entry(_: usize) {}

    fn p(raw: u8) -> Priority {
        Priority::new(raw).unwrap()
    }

    // The only test touching the global instance.
    #[test]
    fn test_kernel_entry_points() {
        assert_eq!(yield_task(), Err(SchedError::NotInitialized));
        init(Policy::Priority).unwrap();

        let idle = create_idle_task(make_stack(128), entry).unwrap();
        let worker = create_task(TaskParams::new(p(10)), make_stack(128), entry, 7).unwrap();
        let urgent = create_task(TaskParams::new(p(40)), make_stack(128), entry, 0).unwrap();
        assert_eq!(ready_queue_get_highest(), Some(urgent));

        let sp = with_kernel(|k| k.start()).unwrap();
        assert_eq!(current_task(), Some(urgent));

        let pended = with_kernel(|k| k.port().pended());
        {
            let _guard = PreemptionGuard::new();
            yield_task().unwrap();
            assert_eq!(with_kernel(|k| k.port().pended()), pended);
        }
        assert_eq!(with_kernel(|k| k.port().pended()), pended + 1);

        // Alone at its level, the yielding task resumes.
        assert_eq!(switch_from_isr(sp), sp);
        assert_eq!(current_task(), Some(urgent));

        block_on(urgent, Some(worker)).unwrap();
        assert_eq!(priority_get(worker), Ok(p(40)));
        switch_from_isr(sp);
        assert_eq!(current_task(), Some(worker));

        unblock(urgent).unwrap();
        assert_eq!(priority_get(worker), Ok(p(10)));
        let worker_sp = with_kernel(|k| k.tasks().get(worker).unwrap().stack_pointer());
        switch_from_isr(worker_sp);
        assert_eq!(current_task(), Some(urgent));

        exit_current();
        switch_from_isr(sp);
        assert_eq!(current_task(), Some(worker));
        destroy_task(urgent).unwrap();

        with_kernel(|k| k.port().advance(1));
        on_tick();
        assert_eq!(ready_queue_validate(), Ok(()));
        assert_eq!(with_kernel(|k| k.tasks().get(idle).unwrap().state), TaskState::Ready);

        let stats = with_kernel(|k| k.stats());
        assert!(stats.critical_sections > 0);
        assert_eq!(stats.critical_violations, 0);
        shutdown().unwrap();
    }
}
