//! # Queue Integrity Monitor
//!
//! Validation and repair of the [`ReadyQueue`].
//!
//! The queue is built from handles into a checked pool, so software bugs
//! cannot produce dangling pointers. What remains is protection against
//! hardware faults (radiation or EMI bit-flips in SRAM). For that the queue
//! carries a light, deliberately reduced defense:
//!
//! - a mirror copy of the presence bitmap
//! - a magic value on the queue
//! - a rotating-XOR tag per list (head, tail, count)
//! - a magic value and rotating-XOR checksum per node over its fixed fields
//!
//! None of these is cryptographic; they catch isolated flipped bits.
//!
//! ## Check Order
//!
//! Short-circuits on the first failure:
//!
//! 1. primary bitmap == mirror bitmap            → `BitmapMismatch`
//! 2. queue magic                                → `MagicFail`
//! 3. per level: list tag                        → `ChecksumFail`
//!    Floyd cycle detection                      → `CycleDetected`
//!    every node intact and linked consistently  → `NodeCorrupted`
//!    counted nodes == stored count              → `CountMismatch`
//!    non-empty list ⇔ bitmap bit                → `BitmapMismatch`
//! 4. sum of counts == total                     → `CountMismatch`
//!
//! ## Repair Levels
//!
//! | Level      | Action                                                          |
//! |------------|-----------------------------------------------------------------|
//! | Minimal    | re-stamp list tags and queue magic                              |
//! | Moderate   | Minimal + copy primary bitmap into mirror                       |
//! | Aggressive | drop nodes failing validation, relink, recompute bitmaps/total  |
//! | Rebuild    | clear bitmaps, Aggressive on every level, re-stamp every tag    |
//!
//! A task whose node is discarded loses its queue back-reference and is
//! moved to `Suspended`. If validation still fails after Aggressive or
//! Rebuild the scheduler stops.

use heapless::Vec;

use crate::config::{INTEGRITY_CHECK_INTERVAL, MAX_TASKS, NODE_POOL_CAPACITY, PRIORITY_LEVELS};
use crate::error::{fatal, FatalReason, IntegrityStatus, SchedError};
use crate::ready_queue::{NodeHandle, ReadyQueue, QUEUE_MAGIC};
use crate::task::{Priority, TaskState, TaskTable, Tick};

/// How hard `repair` works.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RepairLevel {
    Minimal,
    Moderate,
    Aggressive,
    Rebuild,
}

/// Running record of validation and repair activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub last_status: Option<IntegrityStatus>,
    pub error_count: u32,
    pub last_check_tick: Tick,
    pub check_count: u32,
    pub repairs_attempted: u32,
    pub repairs_successful: u32,
    pub cycles_detected: u32,
    pub nodes_corrupted: u32,
    pub tasks_orphaned: u32,
}

/// Cadence counter and report owned by the ready queue.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityMonitor {
    interval: u32,
    ops_since_check: u32,
    pub(crate) report: IntegrityReport,
}

impl IntegrityMonitor {
    pub const fn new() -> Self {
        Self {
            interval: INTEGRITY_CHECK_INTERVAL,
            ops_since_check: 0,
            report: IntegrityReport {
                last_status: None,
                error_count: 0,
                last_check_tick: 0,
                check_count: 0,
                repairs_attempted: 0,
                repairs_successful: 0,
                cycles_detected: 0,
                nodes_corrupted: 0,
                tasks_orphaned: 0,
            },
        }
    }

    /// Count one queue operation; true when a periodic check is due.
    fn note_operation(&mut self) -> bool {
        self.ops_since_check += 1;
        if self.ops_since_check >= self.interval {
            self.ops_since_check = 0;
            true
        } else {
            false
        }
    }
}

impl Default for IntegrityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueue {
    /// Run every structural check without recording anything.
    pub fn check(&self) -> Result<(), IntegrityStatus> {
        if self.bitmap != self.mirror || !self.bitmap.summary_consistent() {
            return Err(IntegrityStatus::BitmapMismatch);
        }
        if self.magic != QUEUE_MAGIC {
            return Err(IntegrityStatus::MagicFail);
        }
        let mut total = 0u32;
        for level in 0..PRIORITY_LEVELS {
            total += self.check_level(level)?;
        }
        if total != self.stats.total_tasks {
            return Err(IntegrityStatus::CountMismatch);
        }
        Ok(())
    }

    fn next_of(&self, handle: NodeHandle) -> Option<NodeHandle> {
        self.nodes.get(handle).and_then(|n| n.next)
    }

    fn check_level(&self, level: usize) -> Result<u32, IntegrityStatus> {
        let list = &self.lists[level];
        if !list.is_intact() {
            return Err(IntegrityStatus::ChecksumFail);
        }

        // Floyd: fast walks two links per step, slow walks one.
        let mut slow = list.head;
        let mut fast = list.head;
        loop {
            fast = fast.and_then(|f| self.next_of(f)).and_then(|f| self.next_of(f));
            slow = slow.and_then(|s| self.next_of(s));
            match (slow, fast) {
                (_, None) => break,
                (Some(s), Some(f)) if s == f => return Err(IntegrityStatus::CycleDetected),
                _ => {}
            }
        }

        let mut count = 0u32;
        let mut prev = None;
        let mut cursor = list.head;
        while let Some(handle) = cursor {
            let node = self.nodes.get(handle).ok_or(IntegrityStatus::NodeCorrupted)?;
            if !node.is_intact() || node.priority.index() != level || node.prev != prev {
                return Err(IntegrityStatus::NodeCorrupted);
            }
            count += 1;
            prev = Some(handle);
            cursor = node.next;
        }
        if list.tail != prev {
            return Err(IntegrityStatus::NodeCorrupted);
        }
        if count != list.count as u32 {
            return Err(IntegrityStatus::CountMismatch);
        }
        if (count > 0) != self.bitmap.is_set(level_priority(level)) {
            return Err(IntegrityStatus::BitmapMismatch);
        }
        Ok(count)
    }

    /// Check the queue and record the outcome.
    pub fn validate(&mut self, now: Tick) -> Result<(), IntegrityStatus> {
        let result = self.check();
        let report = &mut self.monitor.report;
        report.check_count = report.check_count.wrapping_add(1);
        report.last_check_tick = now;
        report.last_status = result.err();
        if let Err(status) = result {
            report.error_count += 1;
            if status == IntegrityStatus::CycleDetected {
                report.cycles_detected += 1;
            }
            self.stats.corruptions_detected += 1;
            log::warn!("ready queue validation failed: {}", status);
        }
        result
    }

    /// Repair at `level`, then re-validate. Failure after `Aggressive` or
    /// `Rebuild` stops the system.
    pub fn repair(&mut self, tasks: &mut TaskTable, level: RepairLevel, now: Tick) -> Result<(), SchedError> {
        self.monitor.report.repairs_attempted += 1;
        log::warn!("ready queue repair: {:?}", level);

        match level {
            RepairLevel::Minimal => self.restamp_structure(),
            RepairLevel::Moderate => {
                self.restamp_structure();
                self.mirror = self.bitmap;
            }
            RepairLevel::Aggressive => self.salvage(tasks, false),
            RepairLevel::Rebuild => {
                self.bitmap.clear_all();
                self.mirror.clear_all();
                self.salvage(tasks, true);
            }
        }

        match self.validate(now) {
            Ok(()) => {
                self.monitor.report.repairs_successful += 1;
                self.stats.repairs_performed += 1;
                log::info!("ready queue repaired at {:?}", level);
                Ok(())
            }
            Err(status) if level >= RepairLevel::Aggressive => {
                fatal(FatalReason::UnrepairableQueue(status))
            }
            Err(status) => Err(status.into()),
        }
    }

    /// Validate, then escalate Moderate → Aggressive on failure.
    pub fn periodic_check(&mut self, tasks: &mut TaskTable, now: Tick) -> Result<(), SchedError> {
        if self.validate(now).is_ok() {
            return Ok(());
        }
        if self.repair(tasks, RepairLevel::Moderate, now).is_ok() {
            return Ok(());
        }
        self.repair(tasks, RepairLevel::Aggressive, now)
    }

    pub(crate) fn after_operation(&mut self, tasks: &mut TaskTable, now: Tick) -> Result<(), SchedError> {
        if self.monitor.note_operation() {
            self.periodic_check(tasks, now)
        } else {
            Ok(())
        }
    }

    /// Queue operations between periodic checks.
    pub fn set_integrity_interval(&mut self, ops: u32) -> Result<(), SchedError> {
        if ops == 0 {
            return Err(SchedError::InvalidParameter);
        }
        self.monitor.interval = ops;
        self.monitor.ops_since_check = 0;
        Ok(())
    }

    #[inline]
    pub fn integrity_report(&self) -> IntegrityReport {
        self.monitor.report
    }

    fn restamp_structure(&mut self) {
        for list in self.lists.iter_mut() {
            list.stamp();
        }
        self.magic = QUEUE_MAGIC;
    }

    /// Keep only nodes that pass validation, relink them, and rebuild
    /// bitmaps, counts and the total from what survives.
    fn salvage(&mut self, tasks: &mut TaskTable, restamp_nodes: bool) {
        let mut survivors: Vec<NodeHandle, NODE_POOL_CAPACITY> = Vec::new();
        self.bitmap.clear_all();
        self.mirror.clear_all();

        for level in 0..PRIORITY_LEVELS {
            let mut kept: Vec<NodeHandle, MAX_TASKS> = Vec::new();
            let mut cursor = self.lists[level].head;
            let mut steps = 0;

            while let Some(handle) = cursor {
                // Revisiting a node means a cycle or a cross-linked list.
                if steps >= self.nodes.capacity() || kept.contains(&handle) || survivors.contains(&handle) {
                    break;
                }
                steps += 1;
                let Some(node) = self.nodes.get(handle).copied() else {
                    break;
                };
                cursor = node.next;

                let owned = tasks
                    .get(node.task)
                    .is_ok_and(|t| t.queue_node == Some(handle));
                if node.is_intact() && node.priority.index() == level && owned && !survivors.is_full() {
                    if kept.push(handle).is_err() {
                        break;
                    }
                } else {
                    log::warn!("repair: dropping node for {} at level {}", node.task, level);
                }
            }

            for (i, &handle) in kept.iter().enumerate() {
                let prev = if i == 0 { None } else { Some(kept[i - 1]) };
                let next = kept.get(i + 1).copied();
                if let Some(node) = self.nodes.get_mut(handle) {
                    node.prev = prev;
                    node.next = next;
                    if restamp_nodes {
                        node.stamp();
                    }
                }
            }

            let list = &mut self.lists[level];
            list.head = kept.first().copied();
            list.tail = kept.last().copied();
            list.count = kept.len() as u16;
            list.stamp();

            if !kept.is_empty() {
                let prio = level_priority(level);
                self.bitmap.set(prio);
                self.mirror.set(prio);
            }
            for &handle in kept.iter() {
                // Bounded by the pool capacity; checked above.
                let _ = survivors.push(handle);
            }
        }

        let before = self.nodes.in_use();
        self.nodes.retain(|handle, _| survivors.contains(&handle));
        let discarded = (before - self.nodes.in_use()) as u32;

        let mut orphaned = 0u32;
        for task in tasks.iter_mut() {
            if let Some(handle) = task.queue_node {
                if !survivors.contains(&handle) {
                    task.queue_node = None;
                    task.state = TaskState::Suspended;
                    orphaned += 1;
                    log::warn!("repair: task {} lost its queue node, suspended", task.id);
                }
            }
        }

        self.stats.total_tasks = survivors.len() as u32;
        self.magic = QUEUE_MAGIC;
        self.monitor.report.nodes_corrupted += discarded;
        self.monitor.report.tasks_orphaned += orphaned;
    }
}

#[inline]
fn level_priority(level: usize) -> Priority {
    Priority::new(level as u8).unwrap_or(Priority::MAX)
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ready_queue::tests::{assert_invariants, make_tasks, p};
    use crate::task::TaskId;

    fn make_queue(prios: &[u8]) -> (ReadyQueue, TaskTable, std::vec::Vec<TaskId>) {
        let (mut tasks, ids) = make_tasks(prios);
        let mut q = ReadyQueue::new();
        for &id in &ids {
            q.insert(&mut tasks, id, 0).unwrap();
        }
        (q, tasks, ids)
    }

    fn node_of(q: &ReadyQueue, tasks: &TaskTable, id: TaskId) -> NodeHandle {
        let handle = tasks.get(id).unwrap().queue_node.unwrap();
        assert!(q.nodes.contains(handle));
        handle
    }

    #[test]
    fn test_healthy_queue_validates() {
        let (mut q, _, _) = make_queue(&[1, 5, 5, 200]);
        assert_eq!(q.validate(3), Ok(()));
        let report = q.integrity_report();
        assert_eq!(report.check_count, 1);
        assert_eq!(report.last_check_tick, 3);
        assert_eq!(report.last_status, None);
    }

    #[test]
    fn test_corrupt_node_removed_by_aggressive_repair() {
        let (mut q, mut tasks, ids) = make_queue(&[20, 20, 20]);
        let victim = node_of(&q, &tasks, ids[1]);
        q.nodes.get_mut(victim).unwrap().magic ^= 0x0100;

        assert_eq!(q.validate(1), Err(IntegrityStatus::NodeCorrupted));
        assert_eq!(q.stats().corruptions_detected, 1);

        let total_before = q.stats().total_tasks;
        q.repair(&mut tasks, RepairLevel::Aggressive, 2).unwrap();

        assert_eq!(q.stats().total_tasks, total_before - 1);
        assert_eq!(q.validate(3), Ok(()));
        assert_eq!(q.integrity_report().cycles_detected, 0);
        assert_eq!(q.integrity_report().nodes_corrupted, 1);

        let order: std::vec::Vec<TaskId> = q.iter_level(p(20)).map(|(id, _)| id).collect();
        assert_eq!(order, vec![ids[0], ids[2]]);

        let orphan = tasks.get(ids[1]).unwrap();
        assert!(!orphan.is_queued());
        assert_eq!(orphan.state, TaskState::Suspended);
        assert_invariants(&q);
    }

    #[test]
    fn test_mirror_mismatch_fixed_by_moderate() {
        let (mut q, mut tasks, _) = make_queue(&[9, 77]);
        q.mirror.set(p(3));
        assert_eq!(q.validate(0), Err(IntegrityStatus::BitmapMismatch));

        assert_eq!(
            q.repair(&mut tasks, RepairLevel::Minimal, 0),
            Err(SchedError::Corrupted(IntegrityStatus::BitmapMismatch))
        );
        q.repair(&mut tasks, RepairLevel::Moderate, 0).unwrap();
        assert_eq!(q.validate(0), Ok(()));
        assert_eq!(q.stats().total_tasks, 2);
    }

    #[test]
    fn test_magic_restored_by_minimal() {
        let (mut q, mut tasks, _) = make_queue(&[4]);
        q.magic = 0;
        assert_eq!(q.validate(0), Err(IntegrityStatus::MagicFail));
        q.repair(&mut tasks, RepairLevel::Minimal, 0).unwrap();
        assert_eq!(q.validate(0), Ok(()));
    }

    #[test]
    fn test_list_tag_and_count_mismatch() {
        let (mut q, mut tasks, _) = make_queue(&[6, 6]);
        q.lists[6].count = 3;
        assert_eq!(q.validate(0), Err(IntegrityStatus::ChecksumFail));

        // Tag recomputed over the bad count: now the count itself is wrong.
        q.lists[6].stamp();
        assert_eq!(q.validate(0), Err(IntegrityStatus::CountMismatch));
        assert!(q.repair(&mut tasks, RepairLevel::Minimal, 0).is_err());

        q.repair(&mut tasks, RepairLevel::Aggressive, 0).unwrap();
        assert_eq!(q.count_at(p(6)), 2);
        assert_invariants(&q);
    }

    #[test]
    fn test_cycle_detected_and_broken() {
        let (mut q, mut tasks, ids) = make_queue(&[30, 30, 30]);
        let head = node_of(&q, &tasks, ids[0]);
        let tail = node_of(&q, &tasks, ids[2]);
        q.nodes.get_mut(tail).unwrap().next = Some(head);

        assert_eq!(q.validate(0), Err(IntegrityStatus::CycleDetected));
        assert_eq!(q.integrity_report().cycles_detected, 1);

        q.repair(&mut tasks, RepairLevel::Aggressive, 0).unwrap();
        assert_eq!(q.stats().total_tasks, 3);
        let order: std::vec::Vec<TaskId> = q.iter_level(p(30)).map(|(id, _)| id).collect();
        assert_eq!(order, ids);
        assert_invariants(&q);
    }

    #[test]
    fn test_rebuild_sweeps_unreachable_nodes() {
        let (mut q, mut tasks, ids) = make_queue(&[50, 50, 50, 8]);
        // Free the middle node behind the list's back: the link from the
        // head now dangles and the tail node is unreachable.
        let middle = node_of(&q, &tasks, ids[1]);
        q.nodes.free(middle);

        assert_eq!(q.validate(0), Err(IntegrityStatus::NodeCorrupted));
        q.repair(&mut tasks, RepairLevel::Rebuild, 0).unwrap();

        assert!(q.contains(&tasks, ids[0]));
        assert!(!tasks.get(ids[1]).unwrap().is_queued());
        assert!(!tasks.get(ids[2]).unwrap().is_queued());
        assert_eq!(tasks.get(ids[2]).unwrap().state, TaskState::Suspended);
        assert!(q.contains(&tasks, ids[3]));
        assert_eq!(q.stats().total_tasks, 2);
        assert_eq!(q.nodes_in_use(), 2);
        assert_eq!(q.integrity_report().tasks_orphaned, 2);
        assert_invariants(&q);
    }

    #[test]
    fn test_periodic_check_repairs_during_insert() {
        let (mut tasks, ids) = make_tasks(&[10, 11]);
        let mut q = ReadyQueue::new();
        q.set_integrity_interval(1).unwrap();
        q.insert(&mut tasks, ids[0], 0).unwrap();

        q.mirror.set(p(250));
        q.insert(&mut tasks, ids[1], 1).unwrap();

        let report = q.integrity_report();
        assert_eq!(report.repairs_attempted, 1);
        assert_eq!(report.repairs_successful, 1);
        assert_eq!(q.check(), Ok(()));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut q = ReadyQueue::new();
        assert_eq!(q.set_integrity_interval(0), Err(SchedError::InvalidParameter));
    }
}
