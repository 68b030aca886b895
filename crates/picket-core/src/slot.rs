//! Per-slot bookkeeping records.
//!
//! Every guarded page slot owns one [`SlotRecord`] for the whole process
//! lifetime. Records cycle through [`SlotState`] as objects are placed and
//! removed; they are rewritten in place, never deallocated, so a freed
//! slot's provenance stays available until the slot recycles.

use std::fmt;
use std::sync::Weak;

use serde::Serialize;

use crate::cache::CacheDescriptor;
use crate::util::{PAGE_MASK, PAGE_SIZE, STACK_DEPTH};

/// Occupancy state of a guarded page slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotState {
    /// The slot has never held an object.
    Unused,
    /// Exactly one live object occupies the slot.
    Allocated,
    /// The last occupant was freed; the page traps until the slot recycles.
    Freed,
}

/// Which page boundary an object abuts within its usable page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Placement {
    /// The object starts at the first byte of the page.
    PageStart,
    /// The object ends at the last byte of the page, shifted down as needed
    /// to honor the owning cache's alignment.
    PageEnd,
}

/// Bounded call stack captured at an allocation, free, or detection site.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StackTrace {
    entries: [usize; STACK_DEPTH],
    depth: usize,
}

impl StackTrace {
    /// An empty trace.
    pub const fn empty() -> Self {
        Self {
            entries: [0; STACK_DEPTH],
            depth: 0,
        }
    }

    /// Builds a trace by letting `capture` fill the entry buffer.
    ///
    /// `capture` returns how many frames it wrote, innermost first; anything
    /// beyond [`STACK_DEPTH`] is discarded.
    pub fn capture_with(capture: impl FnOnce(&mut [usize]) -> usize) -> Self {
        let mut entries = [0; STACK_DEPTH];
        let depth = capture(&mut entries).min(STACK_DEPTH);
        Self { entries, depth }
    }

    /// Captured frames, innermost first.
    pub fn frames(&self) -> &[usize] {
        &self.entries[..self.depth]
    }

    /// True if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|frame| format!("{frame:#x}")))
            .finish()
    }
}

/// Bookkeeping for one guarded page slot.
#[derive(Debug, Clone)]
pub struct SlotRecord {
    pub(crate) state: SlotState,
    pub(crate) address: usize,
    pub(crate) byte_length: usize,
    pub(crate) placement: Placement,
    pub(crate) cache: Weak<CacheDescriptor>,
    pub(crate) alloc_stack: StackTrace,
    pub(crate) free_stack: StackTrace,
    pub(crate) canary_seed: u8,
}

impl SlotRecord {
    pub(crate) fn vacant() -> Self {
        Self {
            state: SlotState::Unused,
            address: 0,
            byte_length: 0,
            placement: Placement::PageStart,
            cache: Weak::new(),
            alloc_stack: StackTrace::empty(),
            free_stack: StackTrace::empty(),
            canary_seed: 0,
        }
    }

    /// Fills the record for a fresh occupant and marks it live.
    pub(crate) fn occupy(
        &mut self,
        address: usize,
        byte_length: usize,
        placement: Placement,
        cache: Weak<CacheDescriptor>,
        canary_seed: u8,
        alloc_stack: StackTrace,
    ) {
        self.state = SlotState::Allocated;
        self.address = address;
        self.byte_length = byte_length;
        self.placement = placement;
        self.cache = cache;
        self.alloc_stack = alloc_stack;
        self.free_stack = StackTrace::empty();
        self.canary_seed = canary_seed;
    }

    /// Marks the occupant freed, keeping everything else for reports.
    pub(crate) fn release(&mut self, free_stack: StackTrace) {
        self.state = SlotState::Freed;
        self.free_stack = free_stack;
    }

    /// Occupancy state.
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Base virtual address of the current or former object.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Object length in bytes.
    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// Boundary the object abuts within its usable page.
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Stack captured by the placement.
    pub fn alloc_stack(&self) -> &StackTrace {
        &self.alloc_stack
    }

    /// Stack captured by the free; empty unless [`SlotState::Freed`].
    pub fn free_stack(&self) -> &StackTrace {
        &self.free_stack
    }

    /// Owning cache's display name, while the descriptor is alive.
    pub fn cache_name(&self) -> Option<String> {
        self.cache.upgrade().map(|cache| cache.name().to_string())
    }

    /// Half-open byte range occupied by the object.
    pub fn object_range(&self) -> std::ops::Range<usize> {
        self.address..self.address + self.byte_length
    }

    /// Expected canary byte for `addr` under this occupancy.
    ///
    /// The pattern varies with the low address bits so relocated or
    /// repeated redzone contents never match by accident.
    pub fn canary_byte(&self, addr: usize) -> u8 {
        self.canary_seed ^ (addr & 0x7) as u8
    }

    /// Byte ranges within the usable page that must hold canary bytes.
    pub(crate) fn redzone_ranges(&self) -> [std::ops::Range<usize>; 2] {
        let page = self.address & !PAGE_MASK;
        [
            page..self.address,
            self.address + self.byte_length..page + PAGE_SIZE,
        ]
    }
}
