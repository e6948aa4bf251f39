//! # Synchronization Primitives
//!
//! Interrupt-safe critical sections built on the `critical-section` crate.
//! On Cortex-M the implementation comes from `cortex-m` (single-core,
//! PRIMASK); on the host it comes from `critical-section/std`.
//!
//! Two forms are provided. [`critical_section`] runs a closure, which is
//! what every kernel entry point uses. [`CriticalGuard`] is the scoped form
//! for code that cannot be written as a closure, such as an ISR prologue
//! that hands its token to several calls. Both nest; only the outermost
//! acquisition changes the interrupt mask.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

use critical_section::{CriticalSection, RestoreState};

static DEPTH: AtomicU32 = AtomicU32::new(0);

/// Execute a closure within a critical section.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     KERNEL.borrow_ref_mut(cs).tick();
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(|cs| {
        let _depth = DepthGuard::enter();
        f(cs)
    })
}

/// Counts one nesting level for as long as it lives.
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        DEPTH.fetch_add(1, Ordering::Relaxed);
        Self
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Scoped critical section. Acquired on construction, released on drop,
/// including during unwinding.
pub struct CriticalGuard {
    state: RestoreState,
    // Must be released on the context that acquired it.
    _not_send: PhantomData<*mut ()>,
}

impl CriticalGuard {
    pub fn enter() -> Self {
        // SAFETY: released exactly once, in `drop`, with the state returned
        // here. Guards are not `Send`, so release happens on this context.
        let state = unsafe { critical_section::acquire() };
        DEPTH.fetch_add(1, Ordering::Relaxed);
        Self {
            state,
            _not_send: PhantomData,
        }
    }

    /// Token proving the critical section is held, valid for the guard's
    /// lifetime.
    pub fn token(&self) -> CriticalSection<'_> {
        // SAFETY: the section stays held until `self` is dropped, and the
        // returned token cannot outlive `self`.
        unsafe { CriticalSection::new() }
    }
}

impl Drop for CriticalGuard {
    fn drop(&mut self) {
        DEPTH.fetch_sub(1, Ordering::Relaxed);
        // SAFETY: `state` came from the matching `acquire` in `enter`.
        unsafe { critical_section::release(self.state) }
    }
}

/// Critical sections currently held on this core.
pub fn depth() -> u32 {
    DEPTH.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use critical_section::Mutex;

    static COUNTER: Mutex<Cell<u32>> = Mutex::new(Cell::new(0));

    #[test]
    fn test_guard_and_closure_share_state() {
        {
            let guard = CriticalGuard::enter();
            let cs = guard.token();
            COUNTER.borrow(cs).set(COUNTER.borrow(cs).get() + 1);
            assert!(depth() >= 1);
        }
        let value = critical_section(|cs| COUNTER.borrow(cs).get());
        assert!(value >= 1);
    }

    #[test]
    fn test_nested_sections() {
        let inner = critical_section(|_| {
            let guard = CriticalGuard::enter();
            let _ = guard.token();
            critical_section(|_| 7)
        });
        assert_eq!(inner, 7);
    }

    #[test]
    fn test_depth_restored_after_panic_in_section() {
        // Holding the section keeps other threads from moving the count.
        let guard = CriticalGuard::enter();
        let before = depth();
        let result = std::panic::catch_unwind(|| critical_section(|_| panic!("task fault")));
        assert!(result.is_err());
        assert_eq!(depth(), before);
        drop(guard);
    }
}
