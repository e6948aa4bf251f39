//! # rtcore Example Firmware
//!
//! Four tasks and an idle task on a Cortex-M4:
//!
//! | Task            | Priority | Behavior                                        |
//! |-----------------|----------|-------------------------------------------------|
//! | `sensor_task`   | 40       | 10 ms deadline every 50 ms, short burst, yields |
//! | `control_task`  | 30       | Takes the shared bus under the ceiling protocol |
//! | `logger_task`   | 8        | Takes the shared bus, yields often              |
//! | `number_cruncher` | 8      | Never yields; rotated on slice expiry           |
//! | `idle_task`     | 0        | Sleeps until the next interrupt                 |
//!
//! The bus ceiling is 30, so `logger_task` runs its critical region at 30
//! and cannot be preempted by `control_task` in the middle of it, while
//! `sensor_task` still preempts both.

#![no_std]
#![no_main]

use cortex_m_rt::entry;
use panic_halt as _;

use rtcore::kernel;
use rtcore::policy::Policy;
use rtcore::priority::{Protocol, ResourceId};
use rtcore::task::{Priority, Stack, TaskId, TaskParams};

const BUS: ResourceId = ResourceId(1);

fn busy_work(iterations: u32) -> u32 {
    let mut acc: u32 = 0;
    for i in 0..iterations {
        acc = acc.wrapping_add(i);
    }
    acc
}

fn me() -> TaskId {
    // Only ever called from task context, where a current task exists.
    kernel::current_task().unwrap_or(TaskId::new(0))
}

extern "C" fn sensor_task(_: usize) {
    loop {
        busy_work(2_000);
        let _ = kernel::yield_task();
    }
}

extern "C" fn control_task(_: usize) {
    loop {
        if kernel::ceiling_enter(me(), BUS).is_ok() {
            busy_work(5_000);
            let _ = kernel::ceiling_exit(me(), BUS);
        }
        let _ = kernel::yield_task();
    }
}

extern "C" fn logger_task(_: usize) {
    loop {
        if kernel::ceiling_enter(me(), BUS).is_ok() {
            busy_work(500);
            let _ = kernel::ceiling_exit(me(), BUS);
        }
        let _ = kernel::yield_task();
    }
}

extern "C" fn number_cruncher(_: usize) {
    let mut _total: u32 = 0;
    loop {
        _total = _total.wrapping_add(busy_work(100));
    }
}

extern "C" fn idle_task(_: usize) {
    loop {
        cortex_m::asm::wfi();
    }
}

fn priority(raw: u8) -> Priority {
    Priority::new(raw).expect("demo priorities are in range")
}

#[entry]
fn main() -> ! {
    let cp = cortex_m::Peripherals::take().expect("peripherals taken once");

    let idle_stack = cortex_m::singleton!(: Stack<128> = Stack::new()).expect("idle stack");
    let sensor_stack = cortex_m::singleton!(: Stack<256> = Stack::new()).expect("sensor stack");
    let control_stack = cortex_m::singleton!(: Stack<256> = Stack::new()).expect("control stack");
    let logger_stack = cortex_m::singleton!(: Stack<256> = Stack::new()).expect("logger stack");
    let cruncher_stack = cortex_m::singleton!(: Stack<256> = Stack::new()).expect("cruncher stack");

    kernel::init(Policy::Priority).expect("kernel init");
    kernel::register_resource(BUS, Protocol::Ceiling, priority(30)).expect("bus resource");

    kernel::create_idle_task(idle_stack.words(), idle_task).expect("idle task");
    kernel::create_task(
        TaskParams::new(priority(40)).with_deadline(10).with_period(50),
        sensor_stack.words(),
        sensor_task,
        0,
    )
    .expect("sensor task");
    kernel::create_task(TaskParams::new(priority(30)), control_stack.words(), control_task, 0)
        .expect("control task");
    kernel::create_task(TaskParams::new(priority(8)), logger_stack.words(), logger_task, 0)
        .expect("logger task");
    kernel::create_task(TaskParams::new(priority(8)), cruncher_stack.words(), number_cruncher, 0)
        .expect("cruncher task");

    kernel::start(cp)
}
