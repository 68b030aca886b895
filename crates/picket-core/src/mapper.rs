//! Page-mapping collaborator interface.
//!
//! The detector never touches host memory directly. Everything it needs
//! from the address space (one contiguous reservation, per-page protection
//! flips, byte access for canary fill and validation) goes through
//! [`PageMapper`], so `mmap`-backed mappers and bookkeeping-only test
//! mappers plug in interchangeably.

use thiserror::Error;

/// Result alias for mapper operations.
pub type MapResult<T> = std::result::Result<T, MapError>;

/// Errors produced by page-mapping backends.
#[derive(Debug, Error)]
pub enum MapError {
    /// The host refused the reservation or protection change.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Address outside the mapper's reserved range.
    #[error("address 0x{0:x} is outside the reserved range")]
    OutOfRange(usize),
    /// The backend cannot run on this host.
    #[error("mapper unsupported on this host: {0}")]
    Unsupported(String),
}

/// Virtual-memory operations the detector delegates to its host.
///
/// Page addresses passed to [`protect`](PageMapper::protect) and
/// [`unprotect`](PageMapper::unprotect) are page-aligned and fall inside the
/// range handed out by [`reserve`](PageMapper::reserve). Byte access is
/// confined to unprotected usable pages.
pub trait PageMapper {
    /// Reserves one contiguous, page-aligned range of `len` bytes and
    /// returns its base address. Called exactly once per detector.
    ///
    /// # Errors
    ///
    /// Any error fails pool construction closed; no diversion will occur.
    fn reserve(&mut self, len: usize) -> MapResult<usize>;

    /// Makes one page trap on any access.
    fn protect(&mut self, page_addr: usize) -> MapResult<()>;

    /// Makes one page readable and writable again.
    fn unprotect(&mut self, page_addr: usize) -> MapResult<()>;

    /// Reads one byte from an unprotected page.
    fn read_byte(&self, addr: usize) -> u8;

    /// Writes one byte to an unprotected page.
    fn write_byte(&mut self, addr: usize, value: u8);

    /// Returns the reservation to the host. Called at most once.
    fn release(&mut self);
}
