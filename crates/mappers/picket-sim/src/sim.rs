//! The simulated mapper and its shared state.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{error, trace};
use picket_core::util::{PAGE_MASK, PAGE_SHIFT};
use picket_core::{MapError, MapResult, PageMapper};

/// Address simulated reservations are handed out at.
const BASE: usize = 0x7000_0000;

#[derive(Debug, Default)]
struct SimState {
    bytes: Vec<u8>,
    protected: Vec<bool>,
}

impl SimState {
    fn offset_of(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(BASE)?;
        (offset < self.bytes.len()).then_some(offset)
    }

    fn page_of(&self, page_addr: usize) -> MapResult<usize> {
        if page_addr & PAGE_MASK != 0 {
            return Err(MapError::OutOfRange(page_addr));
        }
        let offset = self
            .offset_of(page_addr)
            .ok_or(MapError::OutOfRange(page_addr))?;
        Ok(offset >> PAGE_SHIFT)
    }
}

/// In-memory [`PageMapper`] with no real page protection.
///
/// Clones share one underlying reservation.
#[derive(Debug, Clone, Default)]
pub struct SimMapper {
    state: Arc<Mutex<SimState>>,
}

impl SimMapper {
    /// Creates a mapper with no reservation yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Base address the reservation is handed out at.
    pub fn base(&self) -> usize {
        BASE
    }

    /// Reads one byte the way host code would.
    pub fn read(&self, addr: usize) -> u8 {
        self.read_byte(addr)
    }

    /// Writes one byte the way host code would.
    ///
    /// Protection is not enforced; assert on [`SimMapper::is_protected`]
    /// to model a trap instead.
    pub fn write(&self, addr: usize, value: u8) {
        let mut state = self.lock();
        match state.offset_of(addr) {
            Some(offset) => state.bytes[offset] = value,
            None => error!("simulated write outside the reservation at 0x{addr:x}"),
        }
    }

    /// True if the page holding `addr` is marked protected.
    pub fn is_protected(&self, addr: usize) -> bool {
        let state = self.lock();
        match state.offset_of(addr) {
            Some(offset) => state.protected[offset >> PAGE_SHIFT],
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl PageMapper for SimMapper {
    fn reserve(&mut self, len: usize) -> MapResult<usize> {
        let mut state = self.lock();
        if !state.bytes.is_empty() {
            return Err(MapError::Unsupported(
                "simulated mapper already holds a reservation".to_string(),
            ));
        }
        state.bytes = vec![0; len];
        state.protected = vec![false; len >> PAGE_SHIFT];
        trace!("reserved {len} simulated bytes at 0x{BASE:x}");
        Ok(BASE)
    }

    fn protect(&mut self, page_addr: usize) -> MapResult<()> {
        let mut state = self.lock();
        let page = state.page_of(page_addr)?;
        state.protected[page] = true;
        trace!("protected simulated page at 0x{page_addr:x}");
        Ok(())
    }

    fn unprotect(&mut self, page_addr: usize) -> MapResult<()> {
        let mut state = self.lock();
        let page = state.page_of(page_addr)?;
        state.protected[page] = false;
        trace!("opened simulated page at 0x{page_addr:x}");
        Ok(())
    }

    fn read_byte(&self, addr: usize) -> u8 {
        let state = self.lock();
        match state.offset_of(addr) {
            Some(offset) => state.bytes[offset],
            None => {
                error!("simulated read outside the reservation at 0x{addr:x}");
                0
            }
        }
    }

    fn write_byte(&mut self, addr: usize, value: u8) {
        let mut state = self.lock();
        match state.offset_of(addr) {
            Some(offset) => state.bytes[offset] = value,
            None => error!("simulated write outside the reservation at 0x{addr:x}"),
        }
    }

    fn release(&mut self) {
        let mut state = self.lock();
        state.bytes.clear();
        state.protected.clear();
        trace!("released the simulated reservation");
    }
}
