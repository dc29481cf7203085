//! A hard-real-time, O(1) two-level segregated-fit offset allocator.
//!
//! [`Allocator`] sub-divides an abstract `[0, size)` range into
//! variable-sized regions and hands back offsets into that range, never
//! owning or touching any backing memory itself. It is meant for managing
//! regions of a GPU buffer, a virtual address range, or any other resource
//! identified by an offset and a size, where allocation and free must both
//! complete in bounded time regardless of fragmentation.
//!
//! Binning and bit-hierarchy details are internal; the public surface is
//! [`Allocator::new`], [`Allocator::allocate`], [`Allocator::free`],
//! [`Allocator::allocation_size`], [`Allocator::storage_report`],
//! [`Allocator::storage_report_full`], and [`Allocator::reset`].

#![cfg_attr(not(any(test, feature = "error-scanning-std")), no_std)]
#![warn(missing_docs)]

extern crate alloc;

mod bitfield;
mod node;
mod smallfloat;

use bitfield::{NUM_LEAF_BINS, UsedBins};
use node::{NodeHandle, NodeStore, UNUSED};

/// The result of a successful [`Allocator::allocate`] call.
///
/// `metadata` is an opaque handle the allocator needs back in
/// [`Allocator::free`] and [`Allocator::allocation_size`]; callers should not
/// interpret it beyond passing it back unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    /// Offset into the allocator's `[0, size)` range.
    pub offset: u32,
    pub(crate) metadata: NodeHandle,
}

impl Allocation {
    /// The `NO_SPACE` sentinel value: an `Allocation` that owns no storage.
    ///
    /// This is a convenient default for a not-yet-allocated slot, but it is
    /// not a valid argument to [`Allocator::free`] or
    /// [`Allocator::allocation_size`] — passing it is a programmer error,
    /// caught by a debug assertion, exactly as passing any other token that
    /// was never returned by `allocate` would be.
    pub const EMPTY: Allocation = Allocation { offset: u32::MAX, metadata: UNUSED };
}

impl Default for Allocation {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A coarse summary of the allocator's free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageReport {
    /// Sum of the sizes of every free region.
    pub total_free_space: u32,
    /// Size of the single largest free region.
    pub largest_free_region: u32,
}

/// A per-bin breakdown of free space, for detailed fragmentation inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// The size class this bin represents.
    pub size: u32,
    /// The number of free regions currently in this bin.
    pub count: u32,
}

/// A full, per-bin report of free space across all 256 leaf bins.
#[derive(Debug, Clone)]
pub struct StorageReportFull {
    /// One entry per leaf bin, indexed the same way bins are addressed
    /// internally; most entries will have `count == 0`.
    pub free_regions: alloc::boxed::Box<[Region]>,
}

/// Allocation and free counters, available when built with the `counters`
/// feature.
///
/// This does not attempt to estimate fragmentation beyond what
/// [`StorageReport`]/[`StorageReportFull`] already expose; it is a plain
/// tally of activity, the same role counters play elsewhere in this crate
/// family.
#[cfg(feature = "counters")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Total number of successful [`Allocator::allocate`] calls.
    pub allocation_count: u64,
    /// Total number of [`Allocator::free`] calls on a live allocation.
    pub free_count: u64,
    /// Total number of [`Allocator::allocate`] calls that returned `None`.
    pub failed_allocation_count: u64,
    /// Bytes currently allocated (sum of live allocation sizes).
    pub bytes_allocated: u64,
    /// The highest `bytes_allocated` has ever reached.
    pub peak_bytes_allocated: u64,
}

/// A two-level segregated-fit offset allocator.
///
/// See the [crate-level docs](crate) for the broad strokes. `Allocator` does
/// not implement [`Clone`] — duplicating the node arena without duplicating
/// whatever external resource the offsets refer to would be misleading —
/// but it is a plain Rust value otherwise, so moving one is just a move;
/// nothing needs to reach into a moved-from instance and neuter it.
#[derive(Debug)]
pub struct Allocator {
    size: u32,
    free_storage: u32,
    used_bins: UsedBins,
    bin_indices: alloc::boxed::Box<[NodeHandle]>,
    nodes: NodeStore,

    #[cfg(feature = "counters")]
    counters: Counters,
}

impl Allocator {
    /// Creates an allocator managing the abstract range `[0, size)`, capable
    /// of holding at most `max_allocs` concurrent regions (free or used).
    ///
    /// `max_allocs` bounds the node arena, not the address range; once
    /// `max_allocs` regions exist (through a combination of live allocations
    /// and leftover free fragments), further splits fail even if address
    /// space remains. A generous default, mirroring the reference
    /// implementation's default, is `128 * 1024`.
    ///
    /// # Panics
    /// Panics if `size` or `max_allocs` is zero, or if `max_allocs` exceeds
    /// this build's node handle capacity (`65536` with the `u16-handles`
    /// feature, `u32::MAX - 1` otherwise). The `u16-handles` cap of exactly
    /// `65536` matches the 16-bit reference implementation literally; at
    /// that exact value the last handle (`65535`) is numerically equal to
    /// the `UNUSED` sentinel, a known quirk of the original this crate
    /// reproduces rather than silently tightens.
    pub fn new(size: u32, max_allocs: u32) -> Self {
        assert!(size > 0, "size must be positive");

        let nodes = NodeStore::new(max_allocs);
        let bin_indices = alloc::vec![UNUSED; NUM_LEAF_BINS as usize].into_boxed_slice();

        let mut allocator = Self {
            size,
            free_storage: 0,
            used_bins: UsedBins::new(),
            bin_indices,
            nodes,

            #[cfg(feature = "counters")]
            counters: Counters::default(),
        };

        allocator.insert_region(size, 0);

        allocator
    }

    /// Rebuilds the allocator to a freshly-constructed state, without
    /// reallocating the node arena.
    ///
    /// All outstanding [`Allocation`]s become invalid; using one after
    /// `reset` is a logic error (caught by debug assertions, not by a
    /// panic in release builds).
    pub fn reset(&mut self) {
        self.free_storage = 0;
        self.used_bins = UsedBins::new();
        self.bin_indices.fill(UNUSED);
        self.nodes.reset();

        #[cfg(feature = "counters")]
        {
            self.counters = Counters::default();
        }

        let size = self.size;
        self.insert_region(size, 0);
    }

    /// Allocates a region of exactly `size`, or returns `None` if no free
    /// region is large enough or the node arena is exhausted.
    ///
    /// `size` is used exactly as given; this allocator does not round up for
    /// alignment. Callers needing aligned offsets must pre-round `size`
    /// (and post-round the returned `offset`) themselves.
    pub fn allocate(&mut self, size: u32) -> Option<Allocation> {
        if self.nodes.is_exhausted() {
            #[cfg(feature = "counters")]
            {
                self.counters.failed_allocation_count += 1;
            }
            return None;
        }

        // Round up so the chosen bin's size class is never smaller than `size`.
        let min_bin = smallfloat::round_up(size);

        let bin = match self.used_bins.find_first_at_least(min_bin) {
            Some(bin) => bin,
            None => {
                #[cfg(feature = "counters")]
                {
                    self.counters.failed_allocation_count += 1;
                }
                return None;
            }
        };

        let node_handle = self.bin_indices[bin as usize];
        debug_assert_ne!(node_handle, UNUSED);

        let node_total_size = self.nodes.get(node_handle).data_size;
        {
            let node = self.nodes.get_mut(node_handle);
            node.data_size = size;
            node.used = true;
        }

        self.bin_indices[bin as usize] = self.nodes.get(node_handle).bin_next;
        if self.bin_indices[bin as usize] != UNUSED {
            self.nodes.get_mut(self.bin_indices[bin as usize]).bin_prev = UNUSED;
        }

        self.free_storage -= node_total_size;

        if self.bin_indices[bin as usize] == UNUSED {
            self.used_bins.clear(bin);
        }

        let remainder_size = node_total_size - size;
        if remainder_size > 0 {
            let remainder_offset = self.nodes.get(node_handle).data_offset + size;
            let remainder_handle = self.insert_region(remainder_size, remainder_offset);

            let old_next = self.nodes.get(node_handle).neighbor_next;
            if old_next != UNUSED {
                self.nodes.get_mut(old_next).neighbor_prev = remainder_handle;
            }
            {
                let remainder = self.nodes.get_mut(remainder_handle);
                remainder.neighbor_prev = node_handle;
                remainder.neighbor_next = old_next;
            }
            self.nodes.get_mut(node_handle).neighbor_next = remainder_handle;
        }

        #[cfg(feature = "counters")]
        {
            self.counters.allocation_count += 1;
            self.counters.bytes_allocated += size as u64;
            self.counters.peak_bytes_allocated =
                self.counters.peak_bytes_allocated.max(self.counters.bytes_allocated);
        }

        Some(Allocation { offset: self.nodes.get(node_handle).data_offset, metadata: node_handle })
    }

    /// Frees a region previously returned by [`Allocator::allocate`].
    ///
    /// Passing [`Allocation::EMPTY`], freeing the same live allocation
    /// twice, or freeing an allocation from a different (or since-reset)
    /// `Allocator` are all logic errors; each is caught by a debug
    /// assertion, never silently tolerated, matching the precondition the
    /// reference implementation asserts at the top of its own `free`.
    pub fn free(&mut self, allocation: Allocation) {
        debug_assert_ne!(allocation.metadata, UNUSED, "freed a NO_SPACE / never-allocated token");

        let node_handle = allocation.metadata;
        debug_assert!(self.nodes.get(node_handle).used, "double free or free of a foreign allocation");

        let mut offset = self.nodes.get(node_handle).data_offset;
        let mut size = self.nodes.get(node_handle).data_size;

        #[cfg(feature = "counters")]
        {
            self.counters.free_count += 1;
            self.counters.bytes_allocated -= size as u64;
        }

        let neighbor_prev = self.nodes.get(node_handle).neighbor_prev;
        if neighbor_prev != UNUSED && !self.nodes.get(neighbor_prev).used {
            offset = self.nodes.get(neighbor_prev).data_offset;
            size += self.nodes.get(neighbor_prev).data_size;

            self.remove_region(neighbor_prev);

            debug_assert_eq!(self.nodes.get(neighbor_prev).neighbor_next, node_handle);
            self.nodes.get_mut(node_handle).neighbor_prev = self.nodes.get(neighbor_prev).neighbor_prev;
        }

        let neighbor_next = self.nodes.get(node_handle).neighbor_next;
        if neighbor_next != UNUSED && !self.nodes.get(neighbor_next).used {
            size += self.nodes.get(neighbor_next).data_size;

            self.remove_region(neighbor_next);

            debug_assert_eq!(self.nodes.get(neighbor_next).neighbor_prev, node_handle);
            self.nodes.get_mut(node_handle).neighbor_next = self.nodes.get(neighbor_next).neighbor_next;
        }

        let final_next = self.nodes.get(node_handle).neighbor_next;
        let final_prev = self.nodes.get(node_handle).neighbor_prev;

        self.nodes.recycle(node_handle);

        let combined_handle = self.insert_region(size, offset);

        if final_next != UNUSED {
            self.nodes.get_mut(combined_handle).neighbor_next = final_next;
            self.nodes.get_mut(final_next).neighbor_prev = combined_handle;
        }
        if final_prev != UNUSED {
            self.nodes.get_mut(combined_handle).neighbor_prev = final_prev;
            self.nodes.get_mut(final_prev).neighbor_next = combined_handle;
        }
    }

    /// Returns the size of the allocation `allocation` refers to, or `0` if
    /// it does not refer to a currently-live allocation (including after
    /// [`Allocator::reset`], or for [`Allocation::EMPTY`]).
    ///
    /// An invalid or stale token is treated as "no allocation" rather than
    /// a panic; callers that want fail-fast behavior on misuse should check
    /// the token's provenance themselves.
    pub fn allocation_size(&self, allocation: Allocation) -> u32 {
        if allocation.metadata == UNUSED || allocation.metadata as usize >= self.nodes.max_allocs() as usize {
            return 0;
        }

        self.nodes.get(allocation.metadata).data_size
    }

    /// Returns a coarse summary of current free space.
    ///
    /// If the node arena is exhausted (no handle available for a future
    /// split), this conflates "exhausted" with "no free bytes" and reports
    /// zero free space even if `free_storage` is nonzero. That conflation
    /// is a known rough edge, not a bug to fix lightly: a caller relying on
    /// `total_free_space == 0` to mean "truly full" would be misled right
    /// at the point where the arena runs out of handles to describe
    /// whatever bytes remain free.
    pub fn storage_report(&self) -> StorageReport {
        if self.nodes.is_exhausted() {
            return StorageReport::default();
        }

        let largest_free_region = match self.used_bins.find_last() {
            Some(bin) => smallfloat::to_size(bin),
            None => 0,
        };

        debug_assert!(self.free_storage >= largest_free_region);

        StorageReport { total_free_space: self.free_storage, largest_free_region }
    }

    /// Returns a per-bin breakdown of free space across all 256 leaf bins.
    pub fn storage_report_full(&self) -> StorageReportFull {
        let mut free_regions = alloc::vec![Region { size: 0, count: 0 }; NUM_LEAF_BINS as usize];

        for (bin, region) in free_regions.iter_mut().enumerate() {
            let bin = bin as u32;
            let count = self.nodes.iter_bin_list(self.bin_indices[bin as usize]).count() as u32;
            *region = Region { size: smallfloat::to_size(bin), count };
        }

        StorageReportFull { free_regions: free_regions.into_boxed_slice() }
    }

    /// Obtains the inner allocation/free counters.
    #[cfg(feature = "counters")]
    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Inserts a new free region `[offset, offset + size)` into its bin,
    /// returning the handle of the node now representing it.
    ///
    /// Does not touch neighbor links; callers are responsible for those,
    /// since this is also used when splitting a node mid-allocation, where
    /// the caller knows more about the surrounding context than this
    /// function does.
    fn insert_region(&mut self, size: u32, offset: u32) -> NodeHandle {
        let bin = smallfloat::round_down(size);
        let was_empty = self.bin_indices[bin as usize] == UNUSED;
        if was_empty {
            self.used_bins.set(bin);
        }

        let top_node = self.bin_indices[bin as usize];
        let handle = self.nodes.take();

        {
            let node = self.nodes.get_mut(handle);
            node.data_offset = offset;
            node.data_size = size;
            node.bin_prev = UNUSED;
            node.bin_next = top_node;
            node.neighbor_prev = UNUSED;
            node.neighbor_next = UNUSED;
            node.used = false;
        }

        if top_node != UNUSED {
            self.nodes.get_mut(top_node).bin_prev = handle;
        }
        self.bin_indices[bin as usize] = handle;

        self.free_storage += size;

        handle
    }

    /// Removes a free region's node from its bin's free list (but not from
    /// the neighbor list) and returns it to the node arena's freelist.
    fn remove_region(&mut self, handle: NodeHandle) {
        let (bin_prev, bin_next, size) = {
            let node = self.nodes.get(handle);
            (node.bin_prev, node.bin_next, node.data_size)
        };

        if bin_prev != UNUSED {
            self.nodes.get_mut(bin_prev).bin_next = bin_next;
            if bin_next != UNUSED {
                self.nodes.get_mut(bin_next).bin_prev = bin_prev;
            }
        } else {
            // this node was the head of its bin; find the bin the slow way,
            // since a node doesn't know its own bin index
            let bin = smallfloat::round_down(size);

            self.bin_indices[bin as usize] = bin_next;
            if bin_next != UNUSED {
                self.nodes.get_mut(bin_next).bin_prev = UNUSED;
            }

            if self.bin_indices[bin as usize] == UNUSED {
                self.used_bins.clear(bin);
            }
        }

        self.nodes.recycle(handle);
        self.free_storage -= size;
    }

    /// Walks every free region and asserts the invariants this allocator
    /// depends on for correctness: every bin-listed node is actually free
    /// and belongs in the bin it's found in, the two-level bit-hierarchy
    /// agrees with which bins are non-empty, and `free_storage` equals the
    /// sum of every free node's size.
    ///
    /// This is expensive (it walks every bin) and is only compiled for
    /// tests or when explicitly requested via the `error-scanning-std`
    /// feature; it never runs in a normal release build.
    #[cfg(any(test, feature = "error-scanning-std"))]
    pub fn scan_for_errors(&self) {
        let mut counted_free_storage: u64 = 0;

        for bin in 0..NUM_LEAF_BINS {
            let head = self.bin_indices[bin as usize];
            let bin_is_nonempty = head != UNUSED;
            assert_eq!(
                bin_is_nonempty,
                self.used_bins.is_set(bin),
                "used_bins disagrees with bin_indices at bin {bin}"
            );

            let mut prev = UNUSED;
            for handle in self.nodes.iter_bin_list(head) {
                let node = self.nodes.get(handle);
                assert!(!node.used, "a used node is present in bin {bin}'s free list");
                assert_eq!(
                    smallfloat::round_down(node.data_size),
                    bin,
                    "node {handle:?} with size {} found in bin {bin}",
                    node.data_size
                );
                assert_eq!(node.bin_prev, prev, "bin list back-link broken at bin {bin}");

                if node.neighbor_next != UNUSED {
                    let next = self.nodes.get(node.neighbor_next);
                    assert!(
                        next.used,
                        "two adjacent free nodes were not coalesced: {handle:?} and {:?}",
                        node.neighbor_next
                    );
                }

                counted_free_storage += node.data_size as u64;
                prev = handle;
            }
        }

        assert_eq!(
            counted_free_storage, self.free_storage as u64,
            "free_storage ({}) disagrees with the sum of free node sizes ({counted_free_storage})",
            self.free_storage
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A single allocation from a fresh allocator returns offset 0 and
    // reports the remaining space as free.
    #[test]
    fn basic_allocation() {
        let mut a = Allocator::new(1024, 128);
        let alloc = a.allocate(256).unwrap();
        assert_eq!(alloc.offset, 0);
        assert_eq!(a.allocation_size(alloc), 256);

        let report = a.storage_report();
        assert_eq!(report.total_free_space, 1024 - 256);

        a.scan_for_errors();
    }

    #[test]
    fn free_reclaims_space_and_allows_reallocation() {
        let mut a = Allocator::new(1024, 128);
        let alloc = a.allocate(512).unwrap();
        a.free(alloc);

        assert_eq!(a.allocation_size(alloc), 0);
        assert_eq!(a.storage_report().total_free_space, 1024);

        let realloc = a.allocate(1024).unwrap();
        assert_eq!(realloc.offset, 0);
        a.scan_for_errors();
    }

    // Freeing a token that was never returned by `allocate` (the NO_SPACE
    // sentinel, or any other default/empty value) is a programmer error,
    // not a safe no-op; it trips the same debug assertion a double-free
    // would.
    #[test]
    #[should_panic]
    fn freeing_empty_allocation_is_a_logic_error() {
        let mut a = Allocator::new(64, 16);
        a.free(Allocation::default());
    }

    // Fill the arena with many small allocations, then drain it completely;
    // the allocator must recover all space and every invariant must still
    // hold along the way.
    #[test]
    fn fill_and_drain_many_allocations() {
        let mut a = Allocator::new(1 << 20, 4096);
        let mut allocations = alloc::vec::Vec::new();

        for _ in 0..256 {
            if let Some(alloc) = a.allocate(37) {
                allocations.push(alloc);
            }
        }
        a.scan_for_errors();

        for alloc in allocations {
            a.free(alloc);
        }
        a.scan_for_errors();

        assert_eq!(a.storage_report().total_free_space, 1 << 20);
    }

    // Freeing two regions that are adjacent in offset-space must merge
    // them into a single free region, observable via storage_report's
    // largest_free_region.
    #[test]
    fn coalescing_merges_adjacent_free_neighbors() {
        let mut a = Allocator::new(3000, 128);
        let x = a.allocate(1000).unwrap();
        let y = a.allocate(1000).unwrap();
        let z = a.allocate(1000).unwrap();

        a.free(y);
        // y alone is free; its neighbors (x, z) are both used, so no merge.
        assert_eq!(a.storage_report().largest_free_region, 1000);

        a.free(x);
        // x and y are now both free and adjacent: merge into one 2000 region.
        assert_eq!(a.storage_report().largest_free_region, 2000);

        a.free(z);
        // now everything is free and adjacent: one 3000 region.
        assert_eq!(a.storage_report().largest_free_region, 3000);
        assert_eq!(a.storage_report().total_free_space, 3000);

        a.scan_for_errors();
    }

    // Fragmentation is observable, not hidden: many small same-size
    // allocations, freed in an interleaved pattern, leave gaps too small to
    // satisfy a single larger request even though total free space suffices.
    #[test]
    fn fragmentation_is_observable() {
        let mut a = Allocator::new(1000, 128);
        let allocs: alloc::vec::Vec<_> = (0..10).map(|_| a.allocate(100).unwrap()).collect();

        // free every other one: 5 scattered, non-adjacent 100-byte gaps
        for (i, alloc) in allocs.into_iter().enumerate() {
            if i % 2 == 0 {
                a.free(alloc);
            }
        }

        assert_eq!(a.storage_report().total_free_space, 500);
        assert_eq!(a.storage_report().largest_free_region, 100);

        // a request bigger than any single gap fails despite 500 bytes free
        assert!(a.allocate(200).is_none());

        a.scan_for_errors();
    }

    // Once the node arena itself is exhausted, further allocations that
    // would require a fresh node fail even though the address range still
    // has the requested space physically available.
    #[test]
    fn node_exhaustion_is_reported_as_allocation_failure() {
        let mut a = Allocator::new(1_000_000, 2);
        // the constructor already consumed one handle for the initial region
        assert!(a.allocate(10).is_none());
    }

    #[test]
    fn exhausted_arena_recovers_fully_after_a_matching_free() {
        // A bin-aligned size (a power of two) so that round_up and round_down
        // land on the same bin as the whole-range region the constructor
        // files; a non-aligned size here would need a bin strictly above the
        // one the free region occupies, and would never be found.
        let mut a = Allocator::new(1 << 20, 3);
        let whole = a.allocate(1 << 20).unwrap();
        assert_eq!(whole.offset, 0);
        a.free(whole);

        assert!(a.allocate(1 << 20).is_some());
    }

    // reset is idempotent and returns the allocator to a state
    // indistinguishable from a fresh construction.
    #[test]
    fn reset_returns_to_initial_state() {
        let mut a = Allocator::new(4096, 64);
        let _ = a.allocate(100).unwrap();
        let _ = a.allocate(200).unwrap();

        a.reset();
        assert_eq!(a.storage_report().total_free_space, 4096);
        assert_eq!(a.storage_report().largest_free_region, 4096);

        let alloc = a.allocate(4096).unwrap();
        assert_eq!(alloc.offset, 0);

        a.reset();
        a.reset();
        assert_eq!(a.storage_report().total_free_space, 4096);
    }

    #[test]
    fn storage_report_full_counts_regions_per_bin() {
        let mut a = Allocator::new(1000, 128);
        let _ = a.allocate(900).unwrap();

        let full = a.storage_report_full();
        let total_free: u64 = full
            .free_regions
            .iter()
            .filter(|r| r.count > 0)
            .map(|r| r.size as u64 * r.count as u64)
            .sum();

        // the single remaining free region's bin-rounded size times its count
        // must not exceed the true free space (bins round sizes down).
        assert!(total_free <= a.storage_report().total_free_space as u64);
        assert!(full.free_regions.iter().map(|r| r.count).sum::<u32>() >= 1);
    }

    #[cfg(feature = "counters")]
    #[test]
    fn counters_track_allocation_and_free_activity() {
        let mut a = Allocator::new(4096, 64);
        let alloc = a.allocate(100).unwrap();
        assert_eq!(a.counters().allocation_count, 1);
        assert_eq!(a.counters().bytes_allocated, 100);

        a.free(alloc);
        assert_eq!(a.counters().free_count, 1);
        assert_eq!(a.counters().bytes_allocated, 0);
    }

    #[test]
    fn allocation_size_of_a_foreign_or_reset_token_is_zero() {
        let mut a = Allocator::new(256, 16);
        let alloc = a.allocate(64).unwrap();
        a.reset();
        assert_eq!(a.allocation_size(alloc), 0);
        assert_eq!(a.allocation_size(Allocation::EMPTY), 0);
    }
}
