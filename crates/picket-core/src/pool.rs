//! Guard-page pool: layout math, placement, removal, canary upkeep.
//!
//! The reservation spans `2 * slot_count + 2` pages. Page 0 is reserved and
//! never used, odd pages are guard pages, and even pages from page 2 on are
//! the usable pages: slot `i` lives in page `2 * i + 2` with a guard page on
//! either side. Adjacent slots share the guard page between them.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};
use rand::Rng as _;
use serde::Serialize;

use crate::cache::CacheDescriptor;
use crate::mapper::{MapResult, PageMapper};
use crate::slot::{Placement, SlotRecord, SlotState, StackTrace};
use crate::util::{PAGE_SHIFT, PAGE_SIZE, Rng, align_down, make_vec};

/// Address arithmetic for one reserved pool range.
///
/// Fixed at construction; safe to copy outside the detector lock.
#[derive(Debug, Clone, Copy)]
pub struct PoolLayout {
    base: usize,
    slot_count: usize,
}

impl PoolLayout {
    pub(crate) fn new(base: usize, slot_count: usize) -> Self {
        Self { base, slot_count }
    }

    /// Number of pages the reservation spans for `slot_count` slots.
    pub fn pages_for(slot_count: usize) -> usize {
        2 * slot_count + 2
    }

    /// Number of pages this reservation spans.
    pub fn page_count(&self) -> usize {
        Self::pages_for(self.slot_count)
    }

    /// Total reservation size in bytes.
    pub fn byte_len(&self) -> usize {
        self.page_count() << PAGE_SHIFT
    }

    /// Base address of the reservation.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Number of usable slots.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// True if `addr` falls anywhere inside the reservation.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.byte_len()
    }

    /// Index of the page containing `addr`, relative to the base.
    pub(crate) fn page_index(&self, addr: usize) -> usize {
        (addr - self.base) >> PAGE_SHIFT
    }

    /// True if `addr` falls in a guard page.
    pub(crate) fn is_guard_page(&self, addr: usize) -> bool {
        self.page_index(addr) % 2 == 1
    }

    /// Slot whose usable page contains `addr`, if any.
    pub fn slot_of(&self, addr: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        let page = self.page_index(addr);
        if page < 2 || page % 2 == 1 {
            return None;
        }
        Some(page / 2 - 1)
    }

    /// Base address of slot `index`'s usable page.
    pub fn data_page(&self, index: usize) -> usize {
        self.base + ((2 * index + 2) << PAGE_SHIFT)
    }

    /// Base addresses of all guard pages, ascending.
    pub(crate) fn guard_pages(&self) -> impl Iterator<Item = usize> + '_ {
        (0..=self.slot_count).map(|i| self.base + ((2 * i + 1) << PAGE_SHIFT))
    }
}

/// What a removal found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FreeOutcome {
    /// Normal free; the slot joined the tail of the reuse queue.
    Freed,
    /// The slot was already freed.
    DoubleFree,
    /// Redzone bytes no longer match, or the address was not an object base.
    Corruption,
}

/// Pre-free verdict; the caller reports before the free commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreeInspection {
    /// In range, but no object lives or lived there.
    NotAnObject,
    /// The slot is already freed.
    DoubleFree { slot: usize },
    /// The address points inside an object rather than at its base.
    Interior { slot: usize },
    /// Base address and redzones check out.
    Clean { slot: usize },
    /// A redzone byte differs; `mismatch` is the first such address.
    Corrupt { slot: usize, mismatch: usize },
}

/// Mutable pool state. Lives behind the detector's global lock.
pub(crate) struct PoolState {
    pub(crate) layout: PoolLayout,
    pub(crate) records: Vec<SlotRecord>,
    free_queue: VecDeque<usize>,
    rng: Rng,
}

impl PoolState {
    pub(crate) fn new(layout: PoolLayout, seed: u64) -> Self {
        Self {
            layout,
            records: make_vec(layout.slot_count(), |_| SlotRecord::vacant()),
            free_queue: (0..layout.slot_count()).collect(),
            rng: Rng::from_seed(seed),
        }
    }

    /// Places an object into the least-recently-freed available slot.
    ///
    /// Returns `Ok(None)` when the pool cannot serve the request; the caller
    /// falls back to the host allocator. Mapper failures bubble up so the
    /// detector can stand down.
    pub(crate) fn place(
        &mut self,
        requested_size: usize,
        cache: &Arc<CacheDescriptor>,
        mapper: &mut dyn PageMapper,
        alloc_stack: StackTrace,
    ) -> MapResult<Option<usize>> {
        let byte_length = requested_size.max(1);
        if byte_length > PAGE_SIZE {
            debug!("{byte_length} byte request exceeds one page, not diverting");
            return Ok(None);
        }
        let Some(index) = self.free_queue.pop_front() else {
            debug!("no free slot, not diverting");
            return Ok(None);
        };
        let page = self.layout.data_page(index);
        if self.records[index].state() == SlotState::Freed {
            if let Err(err) = mapper.unprotect(page) {
                self.free_queue.push_front(index);
                return Err(err);
            }
        }

        let page_end: bool = self.rng.random();
        let canary_seed: u8 = self.rng.random();
        let (address, placement) = if page_end {
            let address = align_down(page + PAGE_SIZE - byte_length, cache.align());
            (address, Placement::PageEnd)
        } else {
            (page, Placement::PageStart)
        };

        self.records[index].occupy(
            address,
            byte_length,
            placement,
            Arc::downgrade(cache),
            canary_seed,
            alloc_stack,
        );
        let record = &self.records[index];
        for range in record.redzone_ranges() {
            for addr in range {
                mapper.write_byte(addr, record.canary_byte(addr));
            }
        }
        debug!("placed {byte_length} bytes in slot #{index} at 0x{address:x}");
        Ok(Some(address))
    }

    /// Classifies a free request without changing any state.
    ///
    /// Canary validation is skipped when `validate` is false (the detector
    /// is disarmed and no longer detecting).
    pub(crate) fn inspect_free(
        &self,
        addr: usize,
        mapper: &dyn PageMapper,
        validate: bool,
    ) -> FreeInspection {
        let Some(slot) = self.layout.slot_of(addr) else {
            warn!("free of 0x{addr:x} does not name an object page");
            return FreeInspection::NotAnObject;
        };
        let record = &self.records[slot];
        match record.state() {
            SlotState::Unused => {
                warn!("free of 0x{addr:x} hit unused slot #{slot}");
                FreeInspection::NotAnObject
            }
            SlotState::Freed => FreeInspection::DoubleFree { slot },
            SlotState::Allocated => {
                if addr != record.address() {
                    return FreeInspection::Interior { slot };
                }
                if validate {
                    if let Some(mismatch) = self.first_canary_mismatch(slot, mapper) {
                        return FreeInspection::Corrupt { slot, mismatch };
                    }
                }
                FreeInspection::Clean { slot }
            }
        }
    }

    /// Completes a free: captures provenance, protects the page, and queues
    /// the slot behind every other free slot.
    pub(crate) fn commit_free(
        &mut self,
        slot: usize,
        mapper: &mut dyn PageMapper,
        free_stack: StackTrace,
    ) -> MapResult<()> {
        self.records[slot].release(free_stack);
        mapper.protect(self.layout.data_page(slot))?;
        self.free_queue.push_back(slot);
        debug!("freed slot #{slot}");
        Ok(())
    }

    /// First redzone byte that no longer matches the canary pattern.
    fn first_canary_mismatch(&self, slot: usize, mapper: &dyn PageMapper) -> Option<usize> {
        let record = &self.records[slot];
        for range in record.redzone_ranges() {
            for addr in range {
                if mapper.read_byte(addr) != record.canary_byte(addr) {
                    return Some(addr);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatMapper {
        base: usize,
        bytes: Vec<u8>,
        protected: Vec<bool>,
    }

    impl FlatMapper {
        fn new() -> Self {
            Self {
                base: 0x60_0000,
                bytes: Vec::new(),
                protected: Vec::new(),
            }
        }

        fn offset(&self, addr: usize) -> usize {
            addr - self.base
        }

        fn is_protected(&self, addr: usize) -> bool {
            self.protected[self.offset(addr) >> PAGE_SHIFT]
        }
    }

    impl PageMapper for FlatMapper {
        fn reserve(&mut self, len: usize) -> MapResult<usize> {
            self.bytes = vec![0; len];
            self.protected = vec![false; len >> PAGE_SHIFT];
            Ok(self.base)
        }

        fn protect(&mut self, page_addr: usize) -> MapResult<()> {
            let page = self.offset(page_addr) >> PAGE_SHIFT;
            self.protected[page] = true;
            Ok(())
        }

        fn unprotect(&mut self, page_addr: usize) -> MapResult<()> {
            let page = self.offset(page_addr) >> PAGE_SHIFT;
            self.protected[page] = false;
            Ok(())
        }

        fn read_byte(&self, addr: usize) -> u8 {
            self.bytes[self.offset(addr)]
        }

        fn write_byte(&mut self, addr: usize, value: u8) {
            let offset = self.offset(addr);
            self.bytes[offset] = value;
        }

        fn release(&mut self) {
            self.bytes.clear();
            self.protected.clear();
        }
    }

    fn pool_with(slots: usize) -> (PoolState, FlatMapper, Arc<CacheDescriptor>) {
        let mut mapper = FlatMapper::new();
        let base = mapper
            .reserve(PoolLayout::pages_for(slots) << PAGE_SHIFT)
            .unwrap();
        let pool = PoolState::new(PoolLayout::new(base, slots), 0x9127);
        let cache = Arc::new(CacheDescriptor::new("widget", 8));
        (pool, mapper, cache)
    }

    #[test]
    fn test_layout_math() {
        let layout = PoolLayout::new(0x10_0000, 4);
        assert_eq!(layout.page_count(), 10);
        assert_eq!(layout.byte_len(), 10 * PAGE_SIZE);
        assert_eq!(layout.data_page(0), 0x10_0000 + 2 * PAGE_SIZE);
        assert_eq!(layout.data_page(3), 0x10_0000 + 8 * PAGE_SIZE);

        // reserved page and guard pages are not slots
        assert_eq!(layout.slot_of(0x10_0000), None);
        assert_eq!(layout.slot_of(0x10_0000 + PAGE_SIZE), None);
        assert_eq!(layout.slot_of(layout.data_page(2) + 17), Some(2));
        assert_eq!(layout.slot_of(0x10_0000 + 10 * PAGE_SIZE), None);

        assert!(layout.is_guard_page(0x10_0000 + 3 * PAGE_SIZE));
        assert!(!layout.is_guard_page(layout.data_page(1)));

        let guards: Vec<usize> = layout.guard_pages().collect();
        assert_eq!(guards.len(), 5);
        assert_eq!(guards[0], 0x10_0000 + PAGE_SIZE);
        assert_eq!(guards[4], 0x10_0000 + 9 * PAGE_SIZE);
    }

    #[test]
    fn test_place_fills_redzones_with_canaries() {
        let (mut pool, mut mapper, cache) = pool_with(2);
        let addr = pool
            .place(16, &cache, &mut mapper, StackTrace::empty())
            .unwrap()
            .expect("slot available");
        let slot = pool.layout.slot_of(addr).unwrap();
        let record = &pool.records[slot];
        assert_eq!(record.byte_length(), 16);
        for range in record.redzone_ranges() {
            for a in range {
                assert_eq!(mapper.read_byte(a), record.canary_byte(a));
            }
        }
    }

    #[test]
    fn test_zero_size_occupies_one_byte() {
        let (mut pool, mut mapper, cache) = pool_with(1);
        let addr = pool
            .place(0, &cache, &mut mapper, StackTrace::empty())
            .unwrap()
            .expect("slot available");
        let slot = pool.layout.slot_of(addr).unwrap();
        assert_eq!(pool.records[slot].byte_length(), 1);
    }

    #[test]
    fn test_oversize_fails_closed() {
        let (mut pool, mut mapper, cache) = pool_with(1);
        let diverted = pool
            .place(PAGE_SIZE + 1, &cache, &mut mapper, StackTrace::empty())
            .unwrap();
        assert_eq!(diverted, None);
        let full_page = pool
            .place(PAGE_SIZE, &cache, &mut mapper, StackTrace::empty())
            .unwrap();
        assert!(full_page.is_some());
    }

    #[test]
    fn test_placement_properties() {
        let (mut pool, mut mapper, cache) = pool_with(32);
        for _ in 0..32 {
            pool.place(24, &cache, &mut mapper, StackTrace::empty())
                .unwrap()
                .expect("slot available");
        }
        let mut sides = (0, 0);
        for (index, record) in pool.records.iter().enumerate() {
            let page = pool.layout.data_page(index);
            match record.placement() {
                Placement::PageStart => {
                    sides.0 += 1;
                    assert_eq!(record.address(), page);
                }
                Placement::PageEnd => {
                    sides.1 += 1;
                    assert_eq!(record.address() % cache.align(), 0);
                    let end = record.address() + record.byte_length();
                    assert!(end <= page + PAGE_SIZE);
                    assert!(page + PAGE_SIZE - end < cache.align());
                }
            }
        }
        assert!(sides.0 > 0 && sides.1 > 0, "both placements should occur");
    }

    #[test]
    fn test_exhaustion_then_fifo_recycling() {
        let (mut pool, mut mapper, cache) = pool_with(3);
        let mut addrs = Vec::new();
        for _ in 0..3 {
            addrs.push(
                pool.place(8, &cache, &mut mapper, StackTrace::empty())
                    .unwrap()
                    .expect("slot available"),
            );
        }
        assert_eq!(
            pool.place(8, &cache, &mut mapper, StackTrace::empty()).unwrap(),
            None
        );

        // free slot 1 first, then slot 0; reuse must follow that order
        for &addr in [addrs[1], addrs[0]].iter() {
            let slot = pool.layout.slot_of(addr).unwrap();
            assert_eq!(
                pool.inspect_free(addr, &mapper, true),
                FreeInspection::Clean { slot }
            );
            pool.commit_free(slot, &mut mapper, StackTrace::empty())
                .unwrap();
            assert!(mapper.is_protected(pool.layout.data_page(slot)));
        }

        let first = pool
            .place(8, &cache, &mut mapper, StackTrace::empty())
            .unwrap()
            .expect("recycled slot");
        assert_eq!(pool.layout.slot_of(first), Some(1));
        assert!(!mapper.is_protected(pool.layout.data_page(1)));
        let second = pool
            .place(8, &cache, &mut mapper, StackTrace::empty())
            .unwrap()
            .expect("recycled slot");
        assert_eq!(pool.layout.slot_of(second), Some(0));
    }

    #[test]
    fn test_inspect_free_variants() {
        let (mut pool, mut mapper, cache) = pool_with(2);
        let addr = pool
            .place(32, &cache, &mut mapper, StackTrace::empty())
            .unwrap()
            .expect("slot available");
        let slot = pool.layout.slot_of(addr).unwrap();

        assert_eq!(
            pool.inspect_free(addr + 4, &mapper, true),
            FreeInspection::Interior { slot }
        );
        assert_eq!(
            pool.inspect_free(pool.layout.base() + PAGE_SIZE, &mapper, true),
            FreeInspection::NotAnObject
        );
        assert_eq!(
            pool.inspect_free(pool.layout.data_page(1), &mapper, true),
            FreeInspection::NotAnObject
        );

        pool.commit_free(slot, &mut mapper, StackTrace::empty())
            .unwrap();
        assert_eq!(
            pool.inspect_free(addr, &mapper, true),
            FreeInspection::DoubleFree { slot }
        );
    }

    #[test]
    fn test_corruption_reports_first_mismatch() {
        let (mut pool, mut mapper, cache) = pool_with(1);
        let addr = pool
            .place(16, &cache, &mut mapper, StackTrace::empty())
            .unwrap()
            .expect("slot available");
        let record = &pool.records[0];
        // poke whichever redzone is non-empty for the drawn placement
        let target = if addr == pool.layout.data_page(0) {
            addr + record.byte_length() + 5
        } else {
            addr - 1
        };
        mapper.write_byte(target, !record.canary_byte(target));
        assert_eq!(
            pool.inspect_free(addr, &mapper, true),
            FreeInspection::Corrupt {
                slot: 0,
                mismatch: target
            }
        );
        // disarmed detectors skip validation
        assert_eq!(
            pool.inspect_free(addr, &mapper, false),
            FreeInspection::Clean { slot: 0 }
        );
    }
}
