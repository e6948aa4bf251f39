//! # Ready Queue
//!
//! The central scheduling structure: one FIFO per priority level plus a
//! [`PriorityBitmap`] recording which levels are non-empty.
//!
//! ```text
//!   bitmap ──► highest set level ──► lists[level].head ──► QueueNode ──► TaskId
//!
//!   lists[200]: [T3] ⇄ [T7]            (FIFO: T3 inserted first)
//!   lists[ 50]: [T1]
//!   lists[  x]: empty                   (bit x clear)
//! ```
//!
//! ## Invariants (held at every public call boundary)
//!
//! - bit *i* of the bitmap is set iff list *i* is non-empty
//! - primary bitmap == mirror bitmap
//! - each list's `count` equals its number of linked nodes
//! - the sum of list counts equals `total_tasks`
//! - a task owns at most one node, and the node points back at it
//!
//! Nodes live in a static [`Pool`] and are linked by generation-checked
//! handles. The mirror bitmap and the per-node tags are kept only to catch
//! hardware bit-flips; see [`crate::integrity`] for validation and repair.
//!
//! All operations assume the caller holds the kernel critical section.

use crate::bitmap::PriorityBitmap;
use crate::config::{MAX_TASKS, NODE_POOL_CAPACITY, PRIORITY_LEVELS};
use crate::error::{IntegrityStatus, SchedError};
use crate::integrity::IntegrityMonitor;
use crate::pool::{Handle, Pool};
use crate::task::{Priority, TaskId, TaskTable, Tick};

pub type NodeHandle = Handle;

pub(crate) const NODE_MAGIC: u16 = 0x51ED;
pub(crate) const QUEUE_MAGIC: u32 = 0x5244_5951;

#[inline]
fn encode(handle: Option<NodeHandle>) -> u32 {
    handle.map_or(u32::MAX, |h| ((h.index() as u32) << 16) | h.generation() as u32)
}

const NODE_SEED: u32 = 0x811C_9DC5;
const LIST_SEED: u32 = 0x0000_1157;

/// Rotating XOR over `words`. Catches isolated bit-flips, nothing stronger.
const fn mix(seed: u32, words: &[u32]) -> u32 {
    let mut acc = seed;
    let mut i = 0;
    while i < words.len() {
        acc = acc.rotate_left(5) ^ words[i];
        i += 1;
    }
    acc
}

// ---------------------------------------------------------------------------
// Queue node
// ---------------------------------------------------------------------------

/// One queued task, linked into its level's FIFO.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueNode {
    pub(crate) task: TaskId,
    pub(crate) priority: Priority,
    pub(crate) prev: Option<NodeHandle>,
    pub(crate) next: Option<NodeHandle>,
    pub(crate) inserted_at: Tick,
    pub(crate) magic: u16,
    pub(crate) checksum: u32,
}

impl QueueNode {
    fn new(task: TaskId, priority: Priority, now: Tick) -> Self {
        let mut node = Self {
            task,
            priority,
            prev: None,
            next: None,
            inserted_at: now,
            magic: NODE_MAGIC,
            checksum: 0,
        };
        node.stamp();
        node
    }

    /// Checksum over the fields that never change while the node is linked.
    pub(crate) fn compute_checksum(&self) -> u32 {
        mix(
            NODE_SEED,
            &[
                self.task.index() as u32,
                self.priority.get() as u32,
                self.inserted_at,
                self.magic as u32,
            ],
        )
    }

    pub(crate) fn stamp(&mut self) {
        self.magic = NODE_MAGIC;
        self.checksum = self.compute_checksum();
    }

    #[inline]
    pub(crate) fn is_intact(&self) -> bool {
        self.magic == NODE_MAGIC && self.checksum == self.compute_checksum()
    }
}

// ---------------------------------------------------------------------------
// Priority list
// ---------------------------------------------------------------------------

/// FIFO of nodes at one priority level.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PriorityList {
    pub(crate) head: Option<NodeHandle>,
    pub(crate) tail: Option<NodeHandle>,
    pub(crate) count: u16,
    pub(crate) tag: u32,
}

impl PriorityList {
    const EMPTY: Self = Self {
        head: None,
        tail: None,
        count: 0,
        tag: mix(LIST_SEED, &[u32::MAX, u32::MAX, 0]),
    };

    pub(crate) fn compute_tag(&self) -> u32 {
        mix(LIST_SEED, &[encode(self.head), encode(self.tail), self.count as u32])
    }

    #[inline]
    pub(crate) fn stamp(&mut self) {
        self.tag = self.compute_tag();
    }

    #[inline]
    pub(crate) fn is_intact(&self) -> bool {
        self.tag == self.compute_tag()
    }

    pub(crate) fn reset(&mut self) {
        self.head = None;
        self.tail = None;
        self.count = 0;
        self.stamp();
    }
}

// ---------------------------------------------------------------------------
// Statistics and snapshots
// ---------------------------------------------------------------------------

/// Aggregate queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total_tasks: u32,
    pub insertions: u32,
    pub removals: u32,
    pub corruptions_detected: u32,
    pub repairs_performed: u32,
    /// Sum of ticks spent queued by removed tasks.
    pub total_wait_ticks: u64,
    pub peak_tasks: u32,
}

/// Structural state of the queue, for before/after comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub bitmap: PriorityBitmap,
    pub mirror: PriorityBitmap,
    pub counts: [u16; PRIORITY_LEVELS],
    pub total_tasks: u32,
    pub nodes_in_use: usize,
}

// ---------------------------------------------------------------------------
// Ready queue
// ---------------------------------------------------------------------------

/// Per-priority FIFOs plus presence bitmap.
pub struct ReadyQueue {
    pub(crate) lists: [PriorityList; PRIORITY_LEVELS],
    pub(crate) bitmap: PriorityBitmap,
    pub(crate) mirror: PriorityBitmap,
    pub(crate) nodes: Pool<QueueNode, NODE_POOL_CAPACITY>,
    pub(crate) magic: u32,
    pub(crate) stats: QueueStats,
    pub(crate) monitor: IntegrityMonitor,
    idle: Option<TaskId>,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            lists: [PriorityList::EMPTY; PRIORITY_LEVELS],
            bitmap: PriorityBitmap::new(),
            mirror: PriorityBitmap::new(),
            nodes: Pool::new(),
            magic: QUEUE_MAGIC,
            stats: QueueStats {
                total_tasks: 0,
                insertions: 0,
                removals: 0,
                corruptions_detected: 0,
                repairs_performed: 0,
                total_wait_ticks: 0,
                peak_tasks: 0,
            },
            monitor: IntegrityMonitor::new(),
            idle: None,
        }
    }

    /// Task returned by `get_highest_priority` when nothing is queued.
    pub fn set_idle_task(&mut self, idle: Option<TaskId>) {
        self.idle = idle;
    }

    #[inline]
    pub fn idle_task(&self) -> Option<TaskId> {
        self.idle
    }

    fn node_mut(&mut self, handle: NodeHandle) -> Result<&mut QueueNode, SchedError> {
        self.nodes
            .get_mut(handle)
            .ok_or(SchedError::Corrupted(IntegrityStatus::NodeCorrupted))
    }

    /// Append `id` at the tail of its effective-priority level.
    pub fn insert(&mut self, tasks: &mut TaskTable, id: TaskId, now: Tick) -> Result<(), SchedError> {
        let task = tasks.get(id)?;
        if task.queue_node.is_some() {
            return Err(SchedError::DuplicateMembership);
        }
        if !task.is_intact() {
            return Err(SchedError::InvalidState);
        }
        let priority = Priority::new(task.effective_priority.get())?;
        let level = priority.index();

        let list = self.lists[level];
        if list.count as usize >= MAX_TASKS {
            return Err(SchedError::ListFull);
        }
        if let Some(tail) = list.tail {
            if !self.nodes.contains(tail) {
                return Err(IntegrityStatus::NodeCorrupted.into());
            }
        }

        let mut node = QueueNode::new(id, priority, now);
        node.prev = list.tail;
        let handle = self
            .nodes
            .alloc(node)
            .map_err(|_| SchedError::NodePoolExhausted)?;

        match list.tail {
            Some(tail) => self.node_mut(tail)?.next = Some(handle),
            None => self.lists[level].head = Some(handle),
        }
        let list = &mut self.lists[level];
        list.tail = Some(handle);
        list.count += 1;
        list.stamp();

        self.bitmap.set(priority);
        self.mirror.set(priority);
        tasks.get_mut(id)?.queue_node = Some(handle);

        self.stats.total_tasks += 1;
        self.stats.insertions = self.stats.insertions.wrapping_add(1);
        self.stats.peak_tasks = self.stats.peak_tasks.max(self.stats.total_tasks);
        log::trace!("queue: insert {} at {}", id, priority);

        self.after_operation(tasks, now)
    }

    /// Unlink `id` from its level and return its node to the pool.
    pub fn remove(&mut self, tasks: &mut TaskTable, id: TaskId, now: Tick) -> Result<(), SchedError> {
        let handle = tasks.get(id)?.queue_node.ok_or(SchedError::NotFound)?;
        let node = *self
            .nodes
            .get(handle)
            .ok_or(SchedError::Corrupted(IntegrityStatus::NodeCorrupted))?;
        if node.task != id {
            return Err(IntegrityStatus::NodeCorrupted.into());
        }
        let level = node.priority.index();
        if self.lists[level].count == 0 {
            return Err(IntegrityStatus::CountMismatch.into());
        }
        for link in [node.prev, node.next].into_iter().flatten() {
            if !self.nodes.contains(link) {
                return Err(IntegrityStatus::NodeCorrupted.into());
            }
        }

        match node.prev {
            Some(prev) => self.node_mut(prev)?.next = node.next,
            None => self.lists[level].head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next)?.prev = node.prev,
            None => self.lists[level].tail = node.prev,
        }
        let list = &mut self.lists[level];
        list.count -= 1;
        list.stamp();
        if list.head.is_none() {
            self.bitmap.clear(node.priority);
            self.mirror.clear(node.priority);
        }

        self.nodes.free(handle);
        tasks.get_mut(id)?.queue_node = None;

        self.stats.total_tasks = self.stats.total_tasks.saturating_sub(1);
        self.stats.removals = self.stats.removals.wrapping_add(1);
        self.stats.total_wait_ticks += now.wrapping_sub(node.inserted_at) as u64;
        log::trace!("queue: remove {} from {}", id, node.priority);

        self.after_operation(tasks, now)
    }

    /// Move `id` to the tail of its level. Round-robin rotation.
    pub fn requeue(&mut self, tasks: &mut TaskTable, id: TaskId, now: Tick) -> Result<(), SchedError> {
        self.remove(tasks, id, now)?;
        self.insert(tasks, id, now)
    }

    /// Head of the highest occupied level, or the idle task when empty.
    #[inline]
    pub fn get_highest_priority(&self) -> Option<TaskId> {
        match self.bitmap.highest() {
            Some(level) => self.head_of(level),
            None => self.idle,
        }
    }

    /// Highest occupied level.
    #[inline]
    pub fn highest_level(&self) -> Option<Priority> {
        self.bitmap.highest()
    }

    /// Occupied level strictly below `level`.
    #[inline]
    pub fn next_level_below(&self, level: Priority) -> Option<Priority> {
        self.bitmap.next_below(level)
    }

    /// First task queued at `level`.
    pub fn head_of(&self, level: Priority) -> Option<TaskId> {
        let head = self.lists[level.index()].head?;
        self.nodes.get(head).map(|n| n.task)
    }

    pub fn contains(&self, tasks: &TaskTable, id: TaskId) -> bool {
        tasks
            .get(id)
            .ok()
            .and_then(|t| t.queue_node)
            .and_then(|h| self.nodes.get(h))
            .is_some_and(|n| n.task == id)
    }

    #[inline]
    pub fn count_at(&self, level: Priority) -> usize {
        self.lists[level.index()].count as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stats.total_tasks as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    /// Queued tasks, most urgent level first, FIFO within a level.
    pub fn iter(&self) -> Iter<'_> {
        let level = self.bitmap.highest();
        Iter {
            queue: self,
            level,
            cursor: level.and_then(|l| self.lists[l.index()].head),
            single_level: false,
            budget: self.nodes.capacity(),
        }
    }

    /// Queued tasks at one level, FIFO order.
    pub fn iter_level(&self, level: Priority) -> Iter<'_> {
        Iter {
            queue: self,
            level: Some(level),
            cursor: self.lists[level.index()].head,
            single_level: true,
            budget: self.nodes.capacity(),
        }
    }

    /// Drop every queued task. Back-references in `tasks` are cleared.
    pub fn clear(&mut self, tasks: &mut TaskTable) {
        for handle in self.nodes.handles() {
            if let Some(node) = self.nodes.get(handle) {
                if let Ok(task) = tasks.get_mut(node.task) {
                    if task.queue_node == Some(handle) {
                        task.queue_node = None;
                    }
                }
            }
        }
        self.nodes.clear();
        for list in self.lists.iter_mut() {
            list.reset();
        }
        self.bitmap.clear_all();
        self.mirror.clear_all();
        self.stats.total_tasks = 0;
        self.magic = QUEUE_MAGIC;
    }

    #[inline]
    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Nodes currently allocated from the pool.
    #[inline]
    pub fn nodes_in_use(&self) -> usize {
        self.nodes.in_use()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut counts = [0u16; PRIORITY_LEVELS];
        for (count, list) in counts.iter_mut().zip(self.lists.iter()) {
            *count = list.count;
        }
        QueueSnapshot {
            bitmap: self.bitmap,
            mirror: self.mirror,
            counts,
            total_tasks: self.stats.total_tasks,
            nodes_in_use: self.nodes.in_use(),
        }
    }

    /// Tick at which `id` was queued.
    pub fn inserted_at(&self, tasks: &TaskTable, id: TaskId) -> Option<Tick> {
        let handle = tasks.get(id).ok()?.queue_node?;
        self.nodes.get(handle).map(|n| n.inserted_at)
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over queued tasks and their levels.
pub struct Iter<'a> {
    queue: &'a ReadyQueue,
    level: Option<Priority>,
    cursor: Option<NodeHandle>,
    single_level: bool,
    budget: usize,
}

impl Iterator for Iter<'_> {
    type Item = (TaskId, Priority);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.budget == 0 {
                return None;
            }
            if let Some(handle) = self.cursor {
                let node = self.queue.nodes.get(handle)?;
                self.cursor = node.next;
                self.budget -= 1;
                return Some((node.task, node.priority));
            }
            if self.single_level {
                return None;
            }
            let level = self.queue.bitmap.next_below(self.level?);
            self.level = level;
            self.cursor = self.queue.lists[level?.index()].head;
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::task::{TaskParams, TaskState};
    use proptest::prelude::*;

    pub(crate) fn p(raw: u8) -> Priority {
        Priority::new(raw).unwrap()
    }

    pub(crate) fn make_tasks(prios: &[u8]) -> (TaskTable, Vec<TaskId>) {
        let mut table = TaskTable::new();
        let ids = prios
            .iter()
            .map(|&raw| {
                let id = table.spawn(&TaskParams::new(p(raw)), 0).unwrap();
                table.get_mut(id).unwrap().state = TaskState::Ready;
                id
            })
            .collect();
        (table, ids)
    }

    /// Invariants that must hold after every public operation.
    pub(crate) fn assert_invariants(queue: &ReadyQueue) {
        let mut sum = 0u32;
        for level in 0..PRIORITY_LEVELS {
            let prio = p(level as u8);
            let linked = queue.iter_level(prio).count();
            assert_eq!(linked, queue.count_at(prio), "count at {}", level);
            assert_eq!(queue.bitmap.is_set(prio), linked > 0, "bit {}", level);
            sum += linked as u32;
        }
        assert_eq!(queue.bitmap, queue.mirror);
        assert_eq!(sum, queue.stats().total_tasks);
        assert_eq!(queue.nodes_in_use() as u32, sum);
    }

    #[test]
    fn test_fifo_within_level() {
        let (mut tasks, ids) = make_tasks(&[7, 7, 7]);
        let mut q = ReadyQueue::new();
        for &id in &ids {
            q.insert(&mut tasks, id, 0).unwrap();
        }

        let mut order = Vec::new();
        while let Some(id) = q.get_highest_priority() {
            order.push(id);
            q.remove(&mut tasks, id, 1).unwrap();
        }
        assert_eq!(order, ids);
        assert!(q.is_empty());
    }

    #[test]
    fn test_highest_level_wins() {
        let (mut tasks, ids) = make_tasks(&[3, 200, 50]);
        let mut q = ReadyQueue::new();
        for &id in &ids {
            q.insert(&mut tasks, id, 0).unwrap();
        }
        assert_eq!(q.get_highest_priority(), Some(ids[1]));
        q.remove(&mut tasks, ids[1], 0).unwrap();
        assert_eq!(q.get_highest_priority(), Some(ids[2]));
        assert_invariants(&q);
    }

    #[test]
    fn test_empty_queue_returns_idle() {
        let (_, ids) = make_tasks(&[0]);
        let mut q = ReadyQueue::new();
        assert_eq!(q.get_highest_priority(), None);
        q.set_idle_task(Some(ids[0]));
        assert_eq!(q.get_highest_priority(), Some(ids[0]));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let (mut tasks, ids) = make_tasks(&[4]);
        let mut q = ReadyQueue::new();
        q.insert(&mut tasks, ids[0], 0).unwrap();
        let before = q.snapshot();
        assert_eq!(
            q.insert(&mut tasks, ids[0], 0),
            Err(SchedError::DuplicateMembership)
        );
        assert_eq!(q.snapshot(), before);
    }

    #[test]
    fn test_remove_unqueued_is_not_found() {
        let (mut tasks, ids) = make_tasks(&[4]);
        let mut q = ReadyQueue::new();
        assert_eq!(q.remove(&mut tasks, ids[0], 0), Err(SchedError::NotFound));
        assert_eq!(
            q.remove(&mut tasks, TaskId::new(99), 0),
            Err(SchedError::NotFound)
        );
    }

    #[test]
    fn test_insert_then_remove_restores_state() {
        let (mut tasks, ids) = make_tasks(&[9, 9, 40, 9]);
        let mut q = ReadyQueue::new();
        for &id in &ids[..3] {
            q.insert(&mut tasks, id, 0).unwrap();
        }
        let before = q.snapshot();
        q.insert(&mut tasks, ids[3], 5).unwrap();
        assert_ne!(q.snapshot(), before);
        q.remove(&mut tasks, ids[3], 6).unwrap();
        assert_eq!(q.snapshot(), before);
    }

    #[test]
    fn test_requeue_rotates_level() {
        let (mut tasks, ids) = make_tasks(&[12, 12, 12]);
        let mut q = ReadyQueue::new();
        for &id in &ids {
            q.insert(&mut tasks, id, 0).unwrap();
        }
        q.requeue(&mut tasks, ids[0], 1).unwrap();
        let order: Vec<TaskId> = q.iter_level(p(12)).map(|(id, _)| id).collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    }

    #[test]
    fn test_iter_orders_by_level_then_fifo() {
        let (mut tasks, ids) = make_tasks(&[1, 90, 1, 90, 33]);
        let mut q = ReadyQueue::new();
        for &id in &ids {
            q.insert(&mut tasks, id, 0).unwrap();
        }
        let order: Vec<TaskId> = q.iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![ids[1], ids[3], ids[4], ids[0], ids[2]]);
        assert!(q.contains(&tasks, ids[4]));
        assert_eq!(q.count_at(p(90)), 2);
    }

    #[test]
    fn test_node_pool_exhaustion_is_handled() {
        let (mut tasks, ids) = make_tasks(&[5]);
        let mut q = ReadyQueue::new();
        while q.nodes.alloc(QueueNode::new(ids[0], p(1), 0)).is_ok() {}
        assert_eq!(
            q.insert(&mut tasks, ids[0], 0),
            Err(SchedError::NodePoolExhausted)
        );
        assert!(!tasks.get(ids[0]).unwrap().is_queued());
        assert!(!q.bitmap.is_set(p(5)));
    }

    #[test]
    fn test_wait_time_accumulates() {
        let (mut tasks, ids) = make_tasks(&[2]);
        let mut q = ReadyQueue::new();
        q.insert(&mut tasks, ids[0], 100).unwrap();
        assert_eq!(q.inserted_at(&tasks, ids[0]), Some(100));
        q.remove(&mut tasks, ids[0], 130).unwrap();
        assert_eq!(q.stats().total_wait_ticks, 30);
        assert_eq!(q.stats().insertions, 1);
        assert_eq!(q.stats().removals, 1);
    }

    #[test]
    fn test_clear_drops_back_references() {
        let (mut tasks, ids) = make_tasks(&[2, 3]);
        let mut q = ReadyQueue::new();
        for &id in &ids {
            q.insert(&mut tasks, id, 0).unwrap();
        }
        q.clear(&mut tasks);
        assert!(q.is_empty());
        assert!(ids.iter().all(|&id| !tasks.get(id).unwrap().is_queued()));
        assert_invariants(&q);
    }

    proptest! {
        #[test]
        fn prop_invariants_hold_for_any_sequence(
            prios in prop::collection::vec(any::<u8>(), MAX_TASKS),
            ops in prop::collection::vec((0..MAX_TASKS, any::<bool>()), 1..200),
        ) {
            let (mut tasks, ids) = make_tasks(&prios);
            let mut q = ReadyQueue::new();
            for (tick, (which, insert)) in ops.into_iter().enumerate() {
                let id = ids[which];
                let queued = tasks.get(id).unwrap().is_queued();
                let result = if insert {
                    q.insert(&mut tasks, id, tick as Tick)
                } else {
                    q.remove(&mut tasks, id, tick as Tick)
                };
                match (insert, queued) {
                    (true, true) => prop_assert_eq!(result, Err(SchedError::DuplicateMembership)),
                    (false, false) => prop_assert_eq!(result, Err(SchedError::NotFound)),
                    _ => prop_assert!(result.is_ok()),
                }
                assert_invariants(&q);
            }
        }

        #[test]
        fn prop_head_is_highest_queued(
            prios in prop::collection::vec(any::<u8>(), 1..MAX_TASKS),
        ) {
            let (mut tasks, ids) = make_tasks(&prios);
            let mut q = ReadyQueue::new();
            for &id in &ids {
                q.insert(&mut tasks, id, 0).unwrap();
            }
            let top = q.get_highest_priority().unwrap();
            let max = prios.iter().copied().max().unwrap();
            prop_assert_eq!(tasks.get(top).unwrap().effective_priority.get(), max);
            // First task inserted at that level.
            let first = ids.iter().copied().find(|&id| tasks.get(id).unwrap().effective_priority.get() == max);
            prop_assert_eq!(Some(top), first);
        }
    }
}
