//! The node arena: an arena-with-indices representation of free and used
//! regions, addressed by [`NodeHandle`] rather than by pointer.
//!
//! Every node is simultaneously a member of (at most) two doubly-linked
//! lists threaded through the same arena by handle: a *bin list* (the free
//! regions of one size class) and a *neighbor list* (every region in offset
//! order, used or free, enabling O(1) adjacent-region coalescing on free).
//! Neither list owns its nodes; the arena does, via [`NodeStore`].

use alloc::vec::Vec;

/// Index of a [`Node`] within a [`NodeStore`]'s arena.
///
/// The width is a build-time choice: `u32` by default, or `u16` with the
/// `u16-handles` feature, halving metadata storage at the cost of a lower
/// maximum concurrent allocation count. This mirrors the compile-time
/// choice between 16-bit and 32-bit node indices in the allocator this
/// crate's node store is modeled on.
#[cfg(feature = "u16-handles")]
pub type NodeHandle = u16;
/// Index of a [`Node`] within a [`NodeStore`]'s arena.
#[cfg(not(feature = "u16-handles"))]
pub type NodeHandle = u32;

/// Sentinel meaning "no node" — the empty end of a list, or an invalid handle.
pub(crate) const UNUSED: NodeHandle = NodeHandle::MAX;

/// A single free or used region.
///
/// `bin_prev`/`bin_next` thread this node through the free list of its size
/// class (meaningless while `used`). `neighbor_prev`/`neighbor_next` thread
/// it through the whole-arena, offset-ordered list of every region, used or
/// free, and are what make coalescing on free an O(1) operation: a freed
/// node only ever needs to inspect its two immediate neighbors.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Node {
    pub data_offset: u32,
    pub data_size: u32,
    pub bin_prev: NodeHandle,
    pub bin_next: NodeHandle,
    pub neighbor_prev: NodeHandle,
    pub neighbor_next: NodeHandle,
    pub used: bool,
}

impl Node {
    const EMPTY: Node = Node {
        data_offset: 0,
        data_size: 0,
        bin_prev: UNUSED,
        bin_next: UNUSED,
        neighbor_prev: UNUSED,
        neighbor_next: UNUSED,
        used: false,
    };
}

/// Owns the flat node arena and the stack of currently-unused handles.
///
/// The free-handle stack is populated in reverse order at construction and
/// on [`NodeStore::reset`] so that handle `0` is the first one handed out,
/// matching this arena's construction order elsewhere in this family of
/// allocators (cosmetic, but keeps early allocations' metadata indices
/// deterministic, which is convenient for debugging and the scenario
/// tests below).
#[derive(Debug)]
pub(crate) struct NodeStore {
    nodes: Vec<Node>,
    free_handles: Vec<NodeHandle>,
}

impl NodeStore {
    pub fn new(max_allocs: u32) -> Self {
        assert!(max_allocs > 0, "max_allocs must be positive");
        #[cfg(feature = "u16-handles")]
        assert!(max_allocs as u64 <= 65_536, "max_allocs exceeds this build's 16-bit node handle capacity (65536)");
        #[cfg(not(feature = "u16-handles"))]
        assert!(
            (max_allocs as u64) < NodeHandle::MAX as u64,
            "max_allocs exceeds this build's NodeHandle capacity"
        );

        Self { nodes: alloc::vec![Node::EMPTY; max_allocs as usize], free_handles: Self::build_free_handles(max_allocs) }
    }

    fn build_free_handles(max_allocs: u32) -> Vec<NodeHandle> {
        let mut free_handles = Vec::with_capacity(max_allocs as usize);
        for i in (0..max_allocs).rev() {
            free_handles.push(i as NodeHandle);
        }
        free_handles
    }

    /// Rebuilds the arena to its just-constructed state without reallocating
    /// the backing storage, matching the distinct `reset` operation of the
    /// allocator this arena backs.
    pub fn reset(&mut self) {
        let max_allocs = self.nodes.len();
        for node in self.nodes.iter_mut() {
            *node = Node::EMPTY;
        }
        self.free_handles.clear();
        for i in (0..max_allocs as u32).rev() {
            self.free_handles.push(i as NodeHandle);
        }
    }

    #[inline]
    pub fn max_allocs(&self) -> u32 {
        self.nodes.len() as u32
    }

    #[inline]
    pub fn get(&self, handle: NodeHandle) -> &Node {
        &self.nodes[handle as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, handle: NodeHandle) -> &mut Node {
        &mut self.nodes[handle as usize]
    }

    /// True once at most one handle remains free.
    ///
    /// One remaining handle is treated as exhaustion (rather than being
    /// handed out) because `allocate` may need a fresh handle for a split
    /// remainder, and this is checked unconditionally up front rather than
    /// only when a split actually turns out to be necessary. This costs one
    /// handle of capacity out of `max_allocs` in the worst case; it is a
    /// deliberate conservative bound, not a bug to be fixed.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.free_handles.len() <= 1
    }

    #[inline]
    pub fn take(&mut self) -> NodeHandle {
        self.free_handles.pop().expect("NodeStore::take called while exhausted")
    }

    /// Returns `handle` to the freelist stack for reuse.
    ///
    /// Deliberately does not clear the node's fields: callers (in
    /// particular `Allocator::free`, when merging a just-removed neighbor)
    /// may still need to read them after recycling, and whichever bin
    /// later reuses this handle via [`NodeStore::take`] overwrites every
    /// field unconditionally anyway.
    #[inline]
    pub fn recycle(&mut self, handle: NodeHandle) {
        self.free_handles.push(handle);
    }

    /// Iterates every handle reachable from `first` via `bin_next`.
    pub fn iter_bin_list(&self, first: NodeHandle) -> BinListIter<'_> {
        BinListIter { store: self, current: first }
    }
}

pub(crate) struct BinListIter<'a> {
    store: &'a NodeStore,
    current: NodeHandle,
}

impl Iterator for BinListIter<'_> {
    type Item = NodeHandle;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == UNUSED {
            return None;
        }
        let handle = self.current;
        self.current = self.store.get(handle).bin_next;
        Some(handle)
    }
}
