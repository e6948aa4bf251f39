//! # Priority Manager
//!
//! Owns everything that can move a task's effective priority away from its
//! static priority:
//!
//! - explicit `boost` / `restore`
//! - priority inheritance entries pushed by blocked requesters
//! - ceilings of held resources (ceiling and protect protocols)
//!
//! The effective priority is always recomputed from those sources as
//!
//! ```text
//!   effective = max(static, boost, inherited entries, held ceilings)
//! ```
//!
//! so `effective >= static` holds by construction. When the result differs
//! from the current value and the task is queued, it is removed from its old
//! level and re-inserted at the new one inside the same critical section.
//!
//! ## Inheritance
//!
//! ```text
//!   A(10) ──blocked_on──► B(5) ──blocked_on──► C(2)
//!
//!   inherit_apply(B, A):  entry{A,10} on B, B→10
//!                         entry{A,10} on C, C→10   (transitive)
//! ```
//!
//! Propagation stops after `MAX_INHERITANCE_CHAIN` tasks and reports
//! `ChainTooDeep`. Entries come from a static pool; each task keeps the
//! handles of the entries pushed onto it in a bounded vector.

use heapless::Vec;

use crate::config::{CHAIN_POOL_CAPACITY, MAX_INHERITANCE_CHAIN, MAX_RESOURCES, MAX_TASKS};
use crate::error::SchedError;
use crate::pool::{Handle, Pool};
use crate::ready_queue::ReadyQueue;
use crate::task::{Priority, TaskId, TaskTable, Tick};

pub type ChainHandle = Handle;

/// Identifier of a lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u16);

/// Priority protocol attached to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// No priority adjustment.
    None,
    /// Holders inherit the priority of blocked requesters.
    Inherit,
    /// Holders run at the ceiling; entry requires static priority <= ceiling.
    Ceiling,
    /// As `Ceiling`, but the entry check uses the effective priority.
    Protect,
}

impl Protocol {
    #[inline]
    const fn raises_to_ceiling(self) -> bool {
        matches!(self, Protocol::Ceiling | Protocol::Protect)
    }
}

/// One inherited priority pushed onto a resource owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub owner: TaskId,
    pub requester: TaskId,
    pub inherited: Priority,
    pub timestamp: Tick,
}

/// Registered resource with its ceiling and current holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CeilingEntry {
    pub resource: ResourceId,
    pub ceiling: Priority,
    pub holders: u16,
    pub owner: Option<TaskId>,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorityStats {
    pub inversions_detected: u32,
    pub inheritance_applications: u32,
    pub ceiling_violations: u32,
    pub max_chain_depth: u32,
    pub chain_limit_hits: u32,
    pub priority_changes: u32,
}

pub struct PriorityManager {
    chain: Pool<ChainEntry, CHAIN_POOL_CAPACITY>,
    resources: Vec<CeilingEntry, MAX_RESOURCES>,
    stats: PriorityStats,
}

impl PriorityManager {
    pub const fn new() -> Self {
        Self {
            chain: Pool::new(),
            resources: Vec::new(),
            stats: PriorityStats {
                inversions_detected: 0,
                inheritance_applications: 0,
                ceiling_violations: 0,
                max_chain_depth: 0,
                chain_limit_hits: 0,
                priority_changes: 0,
            },
        }
    }

    #[inline]
    pub fn stats(&self) -> PriorityStats {
        self.stats
    }

    /// Chain entries currently allocated.
    #[inline]
    pub fn chain_entries_in_use(&self) -> usize {
        self.chain.in_use()
    }

    /// Clamp an arbitrary value into the valid priority range.
    pub fn normalize(raw: i32) -> Priority {
        let max = Priority::MAX.get() as i32;
        Priority::new(raw.clamp(0, max) as u8).unwrap_or(Priority::MAX)
    }

    // -----------------------------------------------------------------------
    // Effective priority
    // -----------------------------------------------------------------------

    /// Effective priority of `id`.
    pub fn get(&self, tasks: &TaskTable, id: TaskId) -> Result<Priority, SchedError> {
        Ok(tasks.get(id)?.effective_priority)
    }

    /// Priority `id` should be running at right now.
    pub fn target_priority(&self, tasks: &TaskTable, id: TaskId) -> Result<Priority, SchedError> {
        let task = tasks.get(id)?;
        let mut target = task.static_priority;
        if let Some(boost) = task.boost {
            target = target.max(boost);
        }
        for entry in task.inheritance.iter().filter_map(|h| self.chain.get(*h)) {
            target = target.max(entry.inherited);
        }
        if let Some(ceiling) = self.held_ceiling(id) {
            target = target.max(ceiling);
        }
        Ok(target)
    }

    fn held_ceiling(&self, id: TaskId) -> Option<Priority> {
        self.resources
            .iter()
            .filter(|r| r.owner == Some(id) && r.holders > 0 && r.protocol.raises_to_ceiling())
            .map(|r| r.ceiling)
            .max()
    }

    /// Recompute the effective priority of `id` and move it between queue
    /// levels if it changed.
    pub fn apply(&mut self, tasks: &mut TaskTable, queue: &mut ReadyQueue, id: TaskId, now: Tick) -> Result<(), SchedError> {
        let target = self.target_priority(tasks, id)?;
        let task = tasks.get_mut(id)?;
        if task.effective_priority == target {
            return Ok(());
        }
        let from = task.effective_priority;
        if task.is_queued() {
            queue.remove(tasks, id, now)?;
            tasks.get_mut(id)?.effective_priority = target;
            queue.insert(tasks, id, now)?;
        } else {
            task.effective_priority = target;
        }
        self.stats.priority_changes += 1;
        log::debug!("priority: {} {} -> {}", id, from, target);
        Ok(())
    }

    /// Change the static priority of `id`.
    pub fn set(&mut self, tasks: &mut TaskTable, queue: &mut ReadyQueue, id: TaskId, priority: Priority, now: Tick) -> Result<(), SchedError> {
        tasks.get_mut(id)?.static_priority = priority;
        self.apply(tasks, queue, id, now)
    }

    /// Raise `id` to at least `priority`. Returns false (and changes nothing)
    /// when that would not raise the effective priority.
    pub fn boost(&mut self, tasks: &mut TaskTable, queue: &mut ReadyQueue, id: TaskId, priority: Priority, now: Tick) -> Result<bool, SchedError> {
        let task = tasks.get_mut(id)?;
        if priority <= task.effective_priority {
            return Ok(false);
        }
        task.boost = Some(task.boost.map_or(priority, |b| b.max(priority)));
        self.apply(tasks, queue, id, now)?;
        Ok(true)
    }

    /// Drop any boost. Pending inheritance and held ceilings still apply.
    pub fn restore(&mut self, tasks: &mut TaskTable, queue: &mut ReadyQueue, id: TaskId, now: Tick) -> Result<(), SchedError> {
        tasks.get_mut(id)?.boost = None;
        self.apply(tasks, queue, id, now)
    }

    // -----------------------------------------------------------------------
    // Inheritance
    // -----------------------------------------------------------------------

    /// `requester` is blocked on a resource held by `owner`. Lend the
    /// requester's priority to `owner` and, transitively, to whatever
    /// `owner` is itself blocked on.
    ///
    /// # Returns
    /// - `Ok(true)` if at least one priority was raised
    /// - `Ok(false)` if the requester is not more urgent than the owner
    /// - `Err(ChainTooDeep)` after raising `MAX_INHERITANCE_CHAIN` tasks
    /// - `Err(ChainPoolExhausted)` with nothing raised if the entries for
    ///   the whole chain do not fit
    pub fn inherit_apply(
        &mut self,
        tasks: &mut TaskTable,
        queue: &mut ReadyQueue,
        owner: TaskId,
        requester: TaskId,
        now: Tick,
    ) -> Result<bool, SchedError> {
        if owner == requester {
            return Err(SchedError::InvalidParameter);
        }
        let lent = tasks.get(requester)?.effective_priority;
        if lent <= tasks.get(owner)?.effective_priority {
            return Ok(false);
        }
        self.stats.inversions_detected += 1;

        // Raising one task never changes the priorities further along the
        // chain, so the whole path is known before anything is raised.
        let mut path: Vec<TaskId, MAX_INHERITANCE_CHAIN> = Vec::new();
        let mut current = owner;
        let walked = loop {
            if current == requester || path.contains(&current) {
                log::warn!("inheritance: blocking cycle through {}", current);
                break Err(SchedError::Deadlock);
            }
            if path.push(current).is_err() {
                self.stats.chain_limit_hits += 1;
                log::warn!("inheritance: chain from {} exceeds {} tasks", requester, MAX_INHERITANCE_CHAIN);
                break Err(SchedError::ChainTooDeep);
            }
            match tasks.get(current).ok().and_then(|t| t.blocked_on) {
                Some(next) if tasks.get(next).is_ok_and(|t| t.effective_priority < lent) => current = next,
                _ => break Ok(true),
            }
        };

        let result = if self.has_room_for(tasks, &path) {
            self.raise_path(tasks, queue, &path, requester, lent, now).and(walked)
        } else {
            log::warn!("inheritance: no room for {} entries from {}", path.len(), requester);
            Err(SchedError::ChainPoolExhausted)
        };

        self.stats.inheritance_applications += 1;
        self.stats.max_chain_depth = self.stats.max_chain_depth.max(path.len() as u32);
        result
    }

    /// Every task on `path` can take one more entry and the pool holds them all.
    fn has_room_for(&self, tasks: &TaskTable, path: &[TaskId]) -> bool {
        let free = self.chain.capacity() - self.chain.in_use();
        path.len() <= free
            && path.iter().all(|id| {
                tasks
                    .get(*id)
                    .is_ok_and(|t| t.inheritance.len() < t.inheritance.capacity())
            })
    }

    fn raise_path(
        &mut self,
        tasks: &mut TaskTable,
        queue: &mut ReadyQueue,
        path: &[TaskId],
        requester: TaskId,
        lent: Priority,
        now: Tick,
    ) -> Result<(), SchedError> {
        for id in path {
            self.push_entry(tasks, *id, requester, lent, now)?;
            self.apply(tasks, queue, *id, now)?;
        }
        Ok(())
    }

    fn push_entry(&mut self, tasks: &mut TaskTable, owner: TaskId, requester: TaskId, inherited: Priority, now: Tick) -> Result<(), SchedError> {
        let entry = ChainEntry {
            owner,
            requester,
            inherited,
            timestamp: now,
        };
        let handle = self
            .chain
            .alloc(entry)
            .map_err(|_| SchedError::ChainPoolExhausted)?;
        if tasks.get_mut(owner)?.inheritance.push(handle).is_err() {
            self.chain.free(handle);
            return Err(SchedError::ChainPoolExhausted);
        }
        Ok(())
    }

    /// Pop every inheritance entry on `id`, keep the ones whose requester is
    /// still waiting on `id` (directly or transitively), and recompute.
    pub fn inherit_release(&mut self, tasks: &mut TaskTable, queue: &mut ReadyQueue, id: TaskId, now: Tick) -> Result<(), SchedError> {
        let entries = core::mem::take(&mut tasks.get_mut(id)?.inheritance);
        let mut pending: Vec<ChainHandle, MAX_TASKS> = Vec::new();
        for handle in entries {
            let Some(entry) = self.chain.get(handle).copied() else {
                continue;
            };
            if Self::waits_on(tasks, entry.requester, id) && pending.push(handle).is_ok() {
                continue;
            }
            self.chain.free(handle);
        }
        tasks.get_mut(id)?.inheritance = pending;
        self.apply(tasks, queue, id, now)
    }

    /// Free every entry pushed onto `id` without recomputing. Used when the
    /// task is torn down.
    pub fn discard_entries(&mut self, tasks: &mut TaskTable, id: TaskId) -> Result<(), SchedError> {
        let entries = core::mem::take(&mut tasks.get_mut(id)?.inheritance);
        for handle in entries {
            self.chain.free(handle);
        }
        Ok(())
    }

    /// `requester` reaches `holder` by following `blocked_on` links.
    fn waits_on(tasks: &TaskTable, requester: TaskId, holder: TaskId) -> bool {
        let mut current = requester;
        for _ in 0..=MAX_INHERITANCE_CHAIN {
            match tasks.get(current).ok().and_then(|t| t.blocked_on) {
                Some(next) if next == holder => return true,
                Some(next) => current = next,
                None => return false,
            }
        }
        false
    }

    /// Tasks `id` transitively waits on, nearest first.
    pub fn blocking_chain(tasks: &TaskTable, id: TaskId) -> Vec<TaskId, MAX_INHERITANCE_CHAIN> {
        let mut chain = Vec::new();
        let mut current = tasks.get(id).ok().and_then(|t| t.blocked_on);
        while let Some(next) = current {
            if next == id || chain.contains(&next) || chain.push(next).is_err() {
                break;
            }
            current = tasks.get(next).ok().and_then(|t| t.blocked_on);
        }
        chain
    }

    /// Number of tasks `id` is transitively blocked behind.
    pub fn inheritance_depth(&self, tasks: &TaskTable, id: TaskId) -> usize {
        Self::blocking_chain(tasks, id).len()
    }

    /// `id` is waiting behind a task whose own priority is lower.
    pub fn inversion_detected(&self, tasks: &TaskTable, id: TaskId) -> bool {
        let Ok(task) = tasks.get(id) else {
            return false;
        };
        Self::blocking_chain(tasks, id)
            .iter()
            .filter_map(|t| tasks.get(*t).ok())
            .any(|holder| holder.static_priority < task.effective_priority)
    }

    // -----------------------------------------------------------------------
    // Ceilings
    // -----------------------------------------------------------------------

    fn find(&self, resource: ResourceId) -> Result<usize, SchedError> {
        self.resources
            .iter()
            .position(|r| r.resource == resource)
            .ok_or(SchedError::NotFound)
    }

    /// Register a resource with a protocol and ceiling.
    pub fn register_resource(&mut self, resource: ResourceId, protocol: Protocol, ceiling: Priority) -> Result<(), SchedError> {
        if self.find(resource).is_ok() {
            return Err(SchedError::AlreadyExists);
        }
        self.resources
            .push(CeilingEntry {
                resource,
                ceiling,
                holders: 0,
                owner: None,
                protocol,
            })
            .map_err(|_| SchedError::ResourceTableFull)
    }

    /// Protocol of a registered resource.
    pub fn protocol(&self, resource: ResourceId) -> Result<Protocol, SchedError> {
        Ok(self.resources[self.find(resource)?].protocol)
    }

    /// Current holder of a registered resource.
    pub fn holder(&self, resource: ResourceId) -> Result<Option<TaskId>, SchedError> {
        Ok(self.resources[self.find(resource)?].owner)
    }

    /// Set the ceiling of `resource`, registering it under the ceiling
    /// protocol if unknown. A current holder is re-evaluated.
    pub fn ceiling_set(&mut self, tasks: &mut TaskTable, queue: &mut ReadyQueue, resource: ResourceId, ceiling: Priority, now: Tick) -> Result<(), SchedError> {
        match self.find(resource) {
            Ok(index) => {
                self.resources[index].ceiling = ceiling;
                if let Some(owner) = self.resources[index].owner {
                    self.apply(tasks, queue, owner, now)?;
                }
                Ok(())
            }
            Err(_) => self.register_resource(resource, Protocol::Ceiling, ceiling),
        }
    }

    pub fn ceiling_get(&self, resource: ResourceId) -> Result<Priority, SchedError> {
        Ok(self.resources[self.find(resource)?].ceiling)
    }

    /// Holder count of `resource`.
    pub fn holders(&self, resource: ResourceId) -> Result<u16, SchedError> {
        Ok(self.resources[self.find(resource)?].holders)
    }

    /// Take `resource` for `id`. Nested entry by the same task increments
    /// the holder count. A violation leaves everything unchanged.
    pub fn ceiling_enter(&mut self, tasks: &mut TaskTable, queue: &mut ReadyQueue, id: TaskId, resource: ResourceId, now: Tick) -> Result<(), SchedError> {
        let index = self.find(resource)?;
        let entry = self.resources[index];
        let task = tasks.get(id)?;

        if entry.holders > 0 && entry.owner != Some(id) {
            return Err(SchedError::InvalidState);
        }
        let checked = match entry.protocol {
            Protocol::Ceiling => Some(task.static_priority),
            Protocol::Protect => Some(task.effective_priority),
            Protocol::None | Protocol::Inherit => None,
        };
        if checked.is_some_and(|p| p > entry.ceiling) {
            self.stats.ceiling_violations += 1;
            log::warn!("ceiling: {} at {} exceeds ceiling {} of {:?}", id, task.static_priority, entry.ceiling, resource);
            return Err(SchedError::CeilingViolation);
        }

        let slot = &mut self.resources[index];
        slot.owner = Some(id);
        slot.holders += 1;
        self.apply(tasks, queue, id, now)
    }

    /// Release one hold on `resource`. The priority drops back only when
    /// the last hold is released.
    pub fn ceiling_exit(&mut self, tasks: &mut TaskTable, queue: &mut ReadyQueue, id: TaskId, resource: ResourceId, now: Tick) -> Result<(), SchedError> {
        let index = self.find(resource)?;
        let slot = &mut self.resources[index];
        if slot.owner != Some(id) || slot.holders == 0 {
            return Err(SchedError::InvalidState);
        }
        slot.holders -= 1;
        if slot.holders == 0 {
            slot.owner = None;
            self.apply(tasks, queue, id, now)?;
        }
        Ok(())
    }

    /// Forget every hold `id` has, e.g. when it terminates.
    pub fn drop_holds(&mut self, id: TaskId) {
        for slot in self.resources.iter_mut().filter(|r| r.owner == Some(id)) {
            slot.owner = None;
            slot.holders = 0;
        }
    }
}

impl Default for PriorityManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ready_queue::tests::{assert_invariants, make_tasks, p};

    fn assert_effective_at_least_static(tasks: &TaskTable) {
        for t in tasks.iter() {
            assert!(t.effective_priority >= t.static_priority, "{}", t.id);
        }
    }

    fn eff(tasks: &TaskTable, id: TaskId) -> u8 {
        tasks.get(id).unwrap().effective_priority.get()
    }

    #[test]
    fn test_transitive_inheritance_and_release() {
        let (mut tasks, ids) = make_tasks(&[10, 5, 2]);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        let mut q = ReadyQueue::new();
        let mut pm = PriorityManager::new();
        q.insert(&mut tasks, c, 0).unwrap();

        tasks.get_mut(b).unwrap().blocked_on = Some(c);
        tasks.get_mut(a).unwrap().blocked_on = Some(b);
        assert_eq!(pm.inherit_apply(&mut tasks, &mut q, b, a, 1), Ok(true));

        assert_eq!(eff(&tasks, b), 10);
        assert_eq!(eff(&tasks, c), 10);
        // C was queued: it moved to level 10.
        assert_eq!(q.count_at(p(2)), 0);
        assert_eq!(q.get_highest_priority(), Some(c));
        assert_eq!(pm.stats().max_chain_depth, 2);
        assert_effective_at_least_static(&tasks);
        assert!(pm.inversion_detected(&tasks, a));
        assert_eq!(pm.inheritance_depth(&tasks, a), 2);

        // A stops waiting; owners release what they inherited.
        tasks.get_mut(a).unwrap().blocked_on = None;
        pm.inherit_release(&mut tasks, &mut q, b, 2).unwrap();
        pm.inherit_release(&mut tasks, &mut q, c, 2).unwrap();

        assert_eq!(eff(&tasks, b), 5);
        assert_eq!(eff(&tasks, c), 2);
        assert_eq!(pm.chain_entries_in_use(), 0);
        assert_eq!(q.count_at(p(2)), 1);
        assert_effective_at_least_static(&tasks);
        assert_invariants(&q);
    }

    #[test]
    fn test_inherit_noop_when_requester_not_higher() {
        let (mut tasks, ids) = make_tasks(&[3, 8]);
        let mut q = ReadyQueue::new();
        let mut pm = PriorityManager::new();
        assert_eq!(pm.inherit_apply(&mut tasks, &mut q, ids[1], ids[0], 0), Ok(false));
        assert_eq!(eff(&tasks, ids[1]), 8);
        assert_eq!(pm.chain_entries_in_use(), 0);
    }

    #[test]
    fn test_release_keeps_entries_of_waiting_requesters() {
        let (mut tasks, ids) = make_tasks(&[40, 30, 1]);
        let (hi, mid, owner) = (ids[0], ids[1], ids[2]);
        let mut q = ReadyQueue::new();
        let mut pm = PriorityManager::new();

        tasks.get_mut(mid).unwrap().blocked_on = Some(owner);
        pm.inherit_apply(&mut tasks, &mut q, owner, mid, 0).unwrap();
        tasks.get_mut(hi).unwrap().blocked_on = Some(owner);
        pm.inherit_apply(&mut tasks, &mut q, owner, hi, 0).unwrap();
        assert_eq!(eff(&tasks, owner), 40);

        // The high requester gets the resource; the mid one keeps waiting.
        tasks.get_mut(hi).unwrap().blocked_on = None;
        pm.inherit_release(&mut tasks, &mut q, owner, 1).unwrap();
        assert_eq!(eff(&tasks, owner), 30);
        assert_eq!(tasks.get(owner).unwrap().inheritance_len(), 1);
    }

    #[test]
    fn test_chain_pool_exhaustion_raises_nothing() {
        // Eight-task chain, each link waiting on a more urgent task.
        let (mut tasks, ids) = make_tasks(&[2, 3, 4, 5, 6, 7, 8, 9, 20, 30, 40]);
        let (chain, requesters) = ids.split_at(8);
        let mut q = ReadyQueue::new();
        let mut pm = PriorityManager::new();
        for pair in chain.windows(2) {
            tasks.get_mut(pair[0]).unwrap().blocked_on = Some(pair[1]);
        }

        for r in &requesters[..2] {
            tasks.get_mut(*r).unwrap().blocked_on = Some(chain[0]);
            assert_eq!(pm.inherit_apply(&mut tasks, &mut q, chain[0], *r, 0), Ok(true));
        }
        assert_eq!(pm.chain_entries_in_use(), CHAIN_POOL_CAPACITY);

        let last = requesters[2];
        tasks.get_mut(last).unwrap().blocked_on = Some(chain[0]);
        assert_eq!(
            pm.inherit_apply(&mut tasks, &mut q, chain[0], last, 1),
            Err(SchedError::ChainPoolExhausted)
        );
        assert!(chain.iter().all(|id| eff(&tasks, *id) == 30));
        assert_eq!(pm.chain_entries_in_use(), CHAIN_POOL_CAPACITY);
        assert_eq!(pm.stats().inheritance_applications, 3);
        assert_effective_at_least_static(&tasks);
    }

    #[test]
    fn test_chain_depth_bound_reported() {
        let prios: std::vec::Vec<u8> = (0..(MAX_INHERITANCE_CHAIN as u8 + 2)).map(|_| 1).chain([100]).collect();
        let (mut tasks, ids) = make_tasks(&prios);
        let requester = *ids.last().unwrap();
        let holders = &ids[..ids.len() - 1];
        for pair in holders.windows(2) {
            tasks.get_mut(pair[0]).unwrap().blocked_on = Some(pair[1]);
        }
        let mut q = ReadyQueue::new();
        let mut pm = PriorityManager::new();

        let result = pm.inherit_apply(&mut tasks, &mut q, holders[0], requester, 0);
        assert_eq!(result, Err(SchedError::ChainTooDeep));
        assert_eq!(pm.stats().chain_limit_hits, 1);
        // The bounded prefix was raised, nothing beyond it.
        assert_eq!(eff(&tasks, holders[MAX_INHERITANCE_CHAIN - 1]), 100);
        assert_eq!(eff(&tasks, holders[MAX_INHERITANCE_CHAIN]), 1);
        assert_effective_at_least_static(&tasks);
    }

    #[test]
    fn test_boost_and_restore() {
        let (mut tasks, ids) = make_tasks(&[20, 60]);
        let (t, requester) = (ids[0], ids[1]);
        let mut q = ReadyQueue::new();
        let mut pm = PriorityManager::new();
        q.insert(&mut tasks, t, 0).unwrap();

        assert_eq!(pm.boost(&mut tasks, &mut q, t, p(10), 0), Ok(false));
        assert_eq!(eff(&tasks, t), 20);
        assert_eq!(pm.boost(&mut tasks, &mut q, t, p(45), 0), Ok(true));
        assert_eq!(eff(&tasks, t), 45);
        assert_eq!(q.count_at(p(45)), 1);

        pm.restore(&mut tasks, &mut q, t, 0).unwrap();
        assert_eq!(eff(&tasks, t), 20);

        // With an inheritance entry pending, restore stops at the entry.
        tasks.get_mut(requester).unwrap().blocked_on = Some(t);
        pm.inherit_apply(&mut tasks, &mut q, t, requester, 0).unwrap();
        pm.boost(&mut tasks, &mut q, t, p(90), 0).unwrap();
        pm.restore(&mut tasks, &mut q, t, 0).unwrap();
        assert_eq!(eff(&tasks, t), 60);
        assert_invariants(&q);
    }

    #[test]
    fn test_set_moves_queued_task() {
        let (mut tasks, ids) = make_tasks(&[5]);
        let mut q = ReadyQueue::new();
        let mut pm = PriorityManager::new();
        q.insert(&mut tasks, ids[0], 0).unwrap();
        pm.set(&mut tasks, &mut q, ids[0], p(99), 1).unwrap();
        assert_eq!(pm.get(&tasks, ids[0]), Ok(p(99)));
        assert_eq!(q.count_at(p(5)), 0);
        assert_eq!(q.count_at(p(99)), 1);
        assert_eq!(pm.stats().priority_changes, 1);
    }

    #[test]
    fn test_ceiling_violation_has_no_effect() {
        let (mut tasks, ids) = make_tasks(&[60]);
        let mut q = ReadyQueue::new();
        let mut pm = PriorityManager::new();
        let r = ResourceId(1);
        pm.ceiling_set(&mut tasks, &mut q, r, p(50), 0).unwrap();

        assert_eq!(
            pm.ceiling_enter(&mut tasks, &mut q, ids[0], r, 0),
            Err(SchedError::CeilingViolation)
        );
        assert_eq!(eff(&tasks, ids[0]), 60);
        assert_eq!(pm.holders(r), Ok(0));
        assert_eq!(pm.stats().ceiling_violations, 1);
    }

    #[test]
    fn test_nested_ceiling_enter_exit() {
        let (mut tasks, ids) = make_tasks(&[20, 30]);
        let mut q = ReadyQueue::new();
        let mut pm = PriorityManager::new();
        let r = ResourceId(7);
        pm.register_resource(r, Protocol::Ceiling, p(50)).unwrap();
        assert_eq!(pm.ceiling_get(r), Ok(p(50)));

        pm.ceiling_enter(&mut tasks, &mut q, ids[0], r, 0).unwrap();
        assert_eq!(eff(&tasks, ids[0]), 50);
        pm.ceiling_enter(&mut tasks, &mut q, ids[0], r, 0).unwrap();
        assert_eq!(pm.holders(r), Ok(2));

        // Another task cannot enter while it is held.
        assert_eq!(
            pm.ceiling_enter(&mut tasks, &mut q, ids[1], r, 0),
            Err(SchedError::InvalidState)
        );

        pm.ceiling_exit(&mut tasks, &mut q, ids[0], r, 0).unwrap();
        assert_eq!(eff(&tasks, ids[0]), 50);
        pm.ceiling_exit(&mut tasks, &mut q, ids[0], r, 0).unwrap();
        assert_eq!(eff(&tasks, ids[0]), 20);
        assert_eq!(pm.holder(r), Ok(None));
        assert_eq!(
            pm.ceiling_exit(&mut tasks, &mut q, ids[0], r, 0),
            Err(SchedError::InvalidState)
        );
    }

    #[test]
    fn test_protect_checks_effective_priority() {
        let (mut tasks, ids) = make_tasks(&[20]);
        let mut q = ReadyQueue::new();
        let mut pm = PriorityManager::new();
        let r = ResourceId(2);
        pm.register_resource(r, Protocol::Protect, p(40)).unwrap();
        pm.boost(&mut tasks, &mut q, ids[0], p(45), 0).unwrap();
        assert_eq!(
            pm.ceiling_enter(&mut tasks, &mut q, ids[0], r, 0),
            Err(SchedError::CeilingViolation)
        );
    }

    #[test]
    fn test_resource_table_errors() {
        let mut pm = PriorityManager::new();
        pm.register_resource(ResourceId(0), Protocol::Inherit, p(1)).unwrap();
        assert_eq!(
            pm.register_resource(ResourceId(0), Protocol::None, p(1)),
            Err(SchedError::AlreadyExists)
        );
        for i in 1..MAX_RESOURCES as u16 {
            pm.register_resource(ResourceId(i), Protocol::None, p(1)).unwrap();
        }
        assert_eq!(
            pm.register_resource(ResourceId(999), Protocol::None, p(1)),
            Err(SchedError::ResourceTableFull)
        );
        assert_eq!(pm.ceiling_get(ResourceId(1000)), Err(SchedError::NotFound));
    }

    #[test]
    fn test_normalize_clamps() {
        assert_eq!(PriorityManager::normalize(-5), Priority::IDLE);
        assert_eq!(PriorityManager::normalize(1000), Priority::MAX);
        assert_eq!(PriorityManager::normalize(42), p(42));
    }
}
