//! # Static Object Pool
//!
//! Fixed-capacity arena used for queue nodes and inheritance chain entries.
//! Objects are addressed by a [`Handle`] (slot index plus generation) rather
//! than by pointer. Freeing a slot bumps its generation, so a handle that
//! outlives its object is rejected instead of aliasing the next occupant.
//!
//! Allocation is O(1): freed slots form an intrusive free list, and slots
//! that were never used are handed out from a high-water mark. This lets
//! the pool be built in a `const` context with no initialization pass.

/// Generation-checked reference into a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u16,
    generation: u16,
}

impl Handle {
    /// Slot index inside the owning pool.
    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub const fn generation(self) -> u16 {
        self.generation
    }
}

enum Slot<T> {
    Vacant { next_free: Option<u16> },
    Occupied(T),
}

struct Entry<T> {
    generation: u16,
    slot: Slot<T>,
}

impl<T> Entry<T> {
    const fn vacant() -> Self {
        Self {
            generation: 0,
            slot: Slot::Vacant { next_free: None },
        }
    }
}

/// Fixed-capacity arena of `N` objects of type `T`.
pub struct Pool<T, const N: usize> {
    entries: [Entry<T>; N],
    free_head: Option<u16>,
    /// Slots at or above this index have never been allocated.
    untouched: u16,
    in_use: u16,
    peak: u16,
}

impl<T, const N: usize> Pool<T, N> {
    pub const fn new() -> Self {
        Self {
            entries: [const { Entry::vacant() }; N],
            free_head: None,
            untouched: 0,
            in_use: 0,
            peak: 0,
        }
    }

    /// Store `value` and return its handle, or give the value back if the
    /// pool is full.
    pub fn alloc(&mut self, value: T) -> Result<Handle, T> {
        let index = if let Some(index) = self.free_head {
            index
        } else if (self.untouched as usize) < N {
            let index = self.untouched;
            self.untouched += 1;
            index
        } else {
            return Err(value);
        };

        let entry = &mut self.entries[index as usize];
        if let Slot::Vacant { next_free } = entry.slot {
            if self.free_head == Some(index) {
                self.free_head = next_free;
            }
        }
        entry.slot = Slot::Occupied(value);

        self.in_use += 1;
        if self.in_use > self.peak {
            self.peak = self.in_use;
        }

        Ok(Handle {
            index,
            generation: entry.generation,
        })
    }

    /// Release the object behind `handle`. Stale handles return `None`.
    pub fn free(&mut self, handle: Handle) -> Option<T> {
        let entry = self.entries.get_mut(handle.index())?;
        if entry.generation != handle.generation || !matches!(entry.slot, Slot::Occupied(_)) {
            return None;
        }

        let old = core::mem::replace(
            &mut entry.slot,
            Slot::Vacant {
                next_free: self.free_head,
            },
        );
        entry.generation = entry.generation.wrapping_add(1);
        self.free_head = Some(handle.index);
        self.in_use -= 1;

        match old {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let entry = self.entries.get(handle.index())?;
        match &entry.slot {
            Slot::Occupied(value) if entry.generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let entry = self.entries.get_mut(handle.index())?;
        match &mut entry.slot {
            Slot::Occupied(value) if entry.generation == handle.generation => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Free every object for which `keep` returns false.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(Handle, &T) -> bool,
    {
        for index in 0..(self.untouched as usize) {
            let handle = {
                let entry = &self.entries[index];
                match &entry.slot {
                    Slot::Occupied(value) => {
                        let handle = Handle {
                            index: index as u16,
                            generation: entry.generation,
                        };
                        if keep(handle, value) {
                            continue;
                        }
                        handle
                    }
                    Slot::Vacant { .. } => continue,
                }
            };
            self.free(handle);
        }
    }

    /// Handles of all live objects, in slot order.
    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.entries[..self.untouched as usize]
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry.slot {
                Slot::Occupied(_) => Some(Handle {
                    index: index as u16,
                    generation: entry.generation,
                }),
                Slot::Vacant { .. } => None,
            })
    }

    /// Drop every object and return the pool to its initial state.
    /// Generations keep counting so handles issued before the reset stay stale.
    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            if matches!(entry.slot, Slot::Occupied(_)) {
                entry.generation = entry.generation.wrapping_add(1);
            }
            entry.slot = Slot::Vacant { next_free: None };
        }
        self.free_head = None;
        self.untouched = 0;
        self.in_use = 0;
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub const fn in_use(&self) -> usize {
        self.in_use as usize
    }

    #[inline]
    pub const fn peak(&self) -> usize {
        self.peak as usize
    }

    #[inline]
    pub const fn is_full(&self) -> bool {
        self.free_head.is_none() && self.untouched as usize >= N
    }
}

impl<T, const N: usize> Default for Pool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_until_exhausted() {
        let mut pool: Pool<u32, 3> = Pool::new();
        let a = pool.alloc(1).unwrap();
        let _b = pool.alloc(2).unwrap();
        let _c = pool.alloc(3).unwrap();
        assert!(pool.is_full());
        assert_eq!(pool.alloc(4), Err(4));
        assert_eq!(pool.get(a), Some(&1));
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut pool: Pool<u32, 2> = Pool::new();
        let a = pool.alloc(10).unwrap();
        assert_eq!(pool.free(a), Some(10));
        let b = pool.alloc(20).unwrap();
        // Same slot, new generation.
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(pool.get(a).is_none());
        assert!(pool.free(a).is_none());
        assert_eq!(pool.get(b), Some(&20));
    }

    #[test]
    fn test_free_list_reuse_and_peak() {
        let mut pool: Pool<u8, 4> = Pool::new();
        let handles: Vec<_> = (0..4).map(|i| pool.alloc(i).unwrap()).collect();
        pool.free(handles[1]);
        pool.free(handles[2]);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.peak(), 4);
        let x = pool.alloc(9).unwrap();
        let y = pool.alloc(8).unwrap();
        assert!(pool.is_full());
        assert_eq!(pool.get(x), Some(&9));
        assert_eq!(pool.get(y), Some(&8));
    }

    #[test]
    fn test_retain_and_clear() {
        let mut pool: Pool<u32, 4> = Pool::new();
        for v in 0..4 {
            pool.alloc(v).unwrap();
        }
        pool.retain(|_, v| v % 2 == 0);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.handles().count(), 2);

        let kept: Vec<_> = pool.handles().collect();
        pool.clear();
        assert_eq!(pool.in_use(), 0);
        assert!(kept.iter().all(|h| pool.get(*h).is_none()));
        for v in 0..4 {
            assert!(pool.alloc(v).is_ok());
        }
    }
}
