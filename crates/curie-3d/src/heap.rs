//! Hardware resource heaps
//!
//! Two of these exist per channel: one for program-store instruction slots
//! and one for constant-register slots. Every compiled program on the
//! channel competes for the same address space, so allocation failure is
//! resolved by evicting the oldest-bound ranges of *other* programs. The
//! evicted owners are returned to the caller, which must mark those
//! programs untranslated so they recompile lazily on next use.

use curie_core::AllocationError;

/// Identity of a compiled program, used as range owner
pub type ProgramId = u64;

/// A named range inside a [`ResourceHeap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRange {
    pub start: u32,
    pub len: u32,
    pub owner: ProgramId,
}

/// Fixed-capacity hardware address space
///
/// Ranges are kept in bind order; eviction walks from the front.
#[derive(Debug)]
pub struct ResourceHeap {
    capacity: u32,
    ranges: Vec<HeapRange>,
}

impl ResourceHeap {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            ranges: Vec::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Sum of live range lengths
    pub fn used(&self) -> u32 {
        self.ranges.iter().map(|r| r.len).sum()
    }

    /// First-fit allocation. Does not evict; see [`ResourceHeap::evict_until`].
    pub fn allocate(&mut self, len: u32, owner: ProgramId) -> Result<HeapRange, AllocationError> {
        if len == 0 || len > self.capacity {
            return Err(AllocationError::OutOfSpace {
                requested: len,
                capacity: self.capacity,
            });
        }

        match self.find_gap(len) {
            Some(start) => {
                let range = HeapRange { start, len, owner };
                self.ranges.push(range);
                Ok(range)
            }
            None => Err(AllocationError::OutOfSpace {
                requested: len,
                capacity: self.capacity,
            }),
        }
    }

    /// Release a range previously returned by [`ResourceHeap::allocate`]
    pub fn free(&mut self, range: &HeapRange) {
        self.ranges
            .retain(|r| !(r.start == range.start && r.owner == range.owner));
    }

    /// Evict oldest-bound ranges not owned by `keep` until a gap of `len`
    /// slots exists. Returns the owners whose ranges were reclaimed, so the
    /// caller can mark every one of them for recompile.
    ///
    /// Fails when the heap is physically too small even with every other
    /// owner evicted. Failure leaves the heap untouched: a range is only
    /// reclaimed once the eviction as a whole is known to make room,
    /// otherwise a live program would keep a range the heap no longer
    /// tracks.
    pub fn evict_until(
        &mut self,
        len: u32,
        keep: ProgramId,
    ) -> Result<Vec<ProgramId>, AllocationError> {
        let mut surviving = self.ranges.clone();
        let mut evicted = Vec::new();

        while Self::gap_in(&surviving, self.capacity, len).is_none() {
            let victim = surviving.iter().position(|r| r.owner != keep);
            match victim {
                Some(pos) => {
                    let range = surviving.remove(pos);
                    evicted.push(range.owner);
                }
                None => {
                    // Everything left belongs to `keep`
                    return Err(AllocationError::OutOfSpace {
                        requested: len,
                        capacity: self.capacity,
                    });
                }
            }
        }

        for owner in &evicted {
            tracing::debug!(owner = *owner, "evicting heap ranges");
        }
        self.ranges = surviving;
        Ok(evicted)
    }

    /// Lowest start offset of a gap at least `len` slots long
    fn find_gap(&self, len: u32) -> Option<u32> {
        Self::gap_in(&self.ranges, self.capacity, len)
    }

    fn gap_in(ranges: &[HeapRange], capacity: u32, len: u32) -> Option<u32> {
        let mut sorted: Vec<&HeapRange> = ranges.iter().collect();
        sorted.sort_by_key(|r| r.start);

        let mut cursor = 0u32;
        for r in sorted {
            if r.start - cursor >= len {
                return Some(cursor);
            }
            cursor = r.start + r.len;
        }
        if capacity - cursor >= len {
            Some(cursor)
        } else {
            None
        }
    }

    /// Live ranges in bind order (oldest first)
    pub fn ranges(&self) -> &[HeapRange] {
        &self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit() {
        let mut heap = ResourceHeap::new(16);
        let a = heap.allocate(4, 1).unwrap();
        let b = heap.allocate(4, 2).unwrap();
        assert_eq!((a.start, b.start), (0, 4));

        heap.free(&a);
        let c = heap.allocate(2, 3).unwrap();
        assert_eq!(c.start, 0); // reuses the freed gap
        let d = heap.allocate(4, 4).unwrap();
        assert_eq!(d.start, 8); // 2-slot hole at 2 is too small
    }

    #[test]
    fn test_out_of_space() {
        let mut heap = ResourceHeap::new(8);
        heap.allocate(8, 1).unwrap();
        let err = heap.allocate(1, 2).unwrap_err();
        assert!(matches!(err, AllocationError::OutOfSpace { .. }));
    }

    #[test]
    fn test_evict_oldest_first() {
        let mut heap = ResourceHeap::new(8);
        heap.allocate(4, 1).unwrap();
        heap.allocate(4, 2).unwrap();

        let evicted = heap.evict_until(4, 3).unwrap();
        assert_eq!(evicted, vec![1]);
        heap.allocate(4, 3).unwrap();
    }

    #[test]
    fn test_evict_never_reclaims_keeper() {
        let mut heap = ResourceHeap::new(8);
        heap.allocate(6, 7).unwrap();
        heap.allocate(2, 1).unwrap();

        // Only owner 1's two slots can go; six are pinned by the keeper
        let err = heap.evict_until(4, 7).unwrap_err();
        assert!(matches!(err, AllocationError::OutOfSpace { .. }));
    }

    #[test]
    fn test_failed_eviction_leaves_ranges_tracked() {
        let mut heap = ResourceHeap::new(8);
        let a = heap.allocate(2, 1).unwrap();
        heap.allocate(6, 7).unwrap();

        // The request cannot be met, so owner 1 keeps its range: nothing
        // is reclaimed without the owner being reported for recompile
        heap.evict_until(4, 7).unwrap_err();
        assert_eq!(heap.ranges().len(), 2);
        assert!(heap.ranges().contains(&a));
        assert_eq!(heap.used(), 8);
    }

    #[test]
    fn test_larger_than_capacity() {
        let mut heap = ResourceHeap::new(8);
        assert!(heap.allocate(9, 1).is_err());
        assert!(heap.evict_until(9, 1).is_err());
    }
}
