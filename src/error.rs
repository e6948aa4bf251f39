//! # Errors and Fatal Stops
//!
//! Every fallible scheduler operation returns `Result<_, SchedError>`.
//! Errors fall into four classes:
//!
//! | Class      | Examples                                     | Effect                      |
//! |------------|----------------------------------------------|-----------------------------|
//! | Validation | bad parameter, bad priority, double insert   | returned, no state change   |
//! | State      | wrong task state, unknown task, duplicate    | returned                    |
//! | Resource   | pool exhausted, list full, chain too deep    | returned, handled by caller |
//! | Integrity  | bitmap/count mismatch, cycle, bad node tag   | repair escalation           |
//!
//! Conditions the scheduler cannot recover from go through [`fatal`], which
//! logs the reason and panics. On target the panic handler halts the core.

use core::fmt;

use crate::task::TaskId;

/// Named integrity fault raised by queue validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityStatus {
    /// The queue's structural magic value was overwritten.
    MagicFail,
    /// A list's stored count disagrees with its linked nodes, or the
    /// per-list counts disagree with the queue total.
    CountMismatch,
    /// Primary and mirror bitmaps differ, or a bit disagrees with its list.
    BitmapMismatch,
    /// A linked node failed its tag check or carries inconsistent links.
    NodeCorrupted,
    /// A priority list loops back on itself.
    CycleDetected,
    /// A priority list's own tag does not match its fields.
    ChecksumFail,
}

impl fmt::Display for IntegrityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MagicFail => "queue magic overwritten",
            Self::CountMismatch => "count mismatch",
            Self::BitmapMismatch => "bitmap mismatch",
            Self::NodeCorrupted => "queue node corrupted",
            Self::CycleDetected => "cycle in priority list",
            Self::ChecksumFail => "priority list checksum failed",
        };
        f.write_str(s)
    }
}

/// Broad class of a [`SchedError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    State,
    Resource,
    Integrity,
}

/// Scheduler error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    // Validation
    InvalidParameter,
    InvalidPriority,
    /// The task already owns a queue node.
    DuplicateMembership,

    // State
    InvalidState,
    NotFound,
    AlreadyExists,
    NotInitialized,
    /// Following `blocked_on` links leads back to the requester.
    Deadlock,
    /// A ceiling-protocol entry was attempted above the resource ceiling.
    CeilingViolation,

    // Resource
    NodePoolExhausted,
    ChainPoolExhausted,
    ListFull,
    ChainTooDeep,
    ResourceTableFull,
    TaskTableFull,

    // Integrity
    Corrupted(IntegrityStatus),
}

impl SchedError {
    /// Error class, used by callers that only care about the category.
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidParameter | Self::InvalidPriority | Self::DuplicateMembership => {
                ErrorClass::Validation
            }
            Self::InvalidState
            | Self::NotFound
            | Self::AlreadyExists
            | Self::NotInitialized
            | Self::Deadlock
            | Self::CeilingViolation => ErrorClass::State,
            Self::NodePoolExhausted
            | Self::ChainPoolExhausted
            | Self::ListFull
            | Self::ChainTooDeep
            | Self::ResourceTableFull
            | Self::TaskTableFull => ErrorClass::Resource,
            Self::Corrupted(_) => ErrorClass::Integrity,
        }
    }
}

impl From<IntegrityStatus> for SchedError {
    fn from(status: IntegrityStatus) -> Self {
        Self::Corrupted(status)
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::InvalidPriority => write!(f, "priority out of range"),
            Self::DuplicateMembership => write!(f, "task is already queued"),
            Self::InvalidState => write!(f, "invalid task state"),
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::NotInitialized => write!(f, "scheduler not initialized"),
            Self::Deadlock => write!(f, "blocking cycle detected"),
            Self::CeilingViolation => write!(f, "priority above resource ceiling"),
            Self::NodePoolExhausted => write!(f, "queue node pool exhausted"),
            Self::ChainPoolExhausted => write!(f, "inheritance chain pool exhausted"),
            Self::ListFull => write!(f, "priority list full"),
            Self::ChainTooDeep => write!(f, "inheritance chain too deep"),
            Self::ResourceTableFull => write!(f, "resource table full"),
            Self::TaskTableFull => write!(f, "task table full"),
            Self::Corrupted(status) => write!(f, "ready queue corrupted: {}", status),
        }
    }
}

// ---------------------------------------------------------------------------
// Fatal stop
// ---------------------------------------------------------------------------

/// Reason for a fatal stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// Saved stack pointer out of bounds, misaligned, or guard words clobbered.
    StackOverflow(TaskId),
    /// Validation still failed after an aggressive or full rebuild.
    UnrepairableQueue(IntegrityStatus),
    PreemptionNestingTooDeep,
    PreemptionUnderflow,
    /// Restore failed and no idle task can take over.
    NoRunnableContext(TaskId),
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow(id) => write!(f, "stack overflow in task {}", id),
            Self::UnrepairableQueue(status) => write!(f, "unrepairable ready queue: {}", status),
            Self::PreemptionNestingTooDeep => write!(f, "preemption disable nested too deep"),
            Self::PreemptionUnderflow => write!(f, "preemption enable without disable"),
            Self::NoRunnableContext(id) => {
                write!(f, "cannot restore task {} and no idle task available", id)
            }
        }
    }
}

/// Stop the system. Never returns.
#[cold]
#[inline(never)]
pub fn fatal(reason: FatalReason) -> ! {
    log::error!("fatal: {}", reason);
    panic!("scheduler halted: {}", reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(SchedError::DuplicateMembership.class(), ErrorClass::Validation);
        assert_eq!(SchedError::NotFound.class(), ErrorClass::State);
        assert_eq!(SchedError::ChainTooDeep.class(), ErrorClass::Resource);
        assert_eq!(
            SchedError::from(IntegrityStatus::CycleDetected).class(),
            ErrorClass::Integrity
        );
    }

    #[test]
    fn test_display() {
        let msg = format!("{}", SchedError::Corrupted(IntegrityStatus::BitmapMismatch));
        assert_eq!(msg, "ready queue corrupted: bitmap mismatch");
    }

    #[test]
    #[should_panic(expected = "scheduler halted")]
    fn test_fatal_panics() {
        fatal(FatalReason::PreemptionUnderflow);
    }
}
