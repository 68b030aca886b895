//! The anonymous-mapping mapper.

use std::ffi::c_void;
use std::ptr;

use lazy_static::lazy_static;
use libc::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_POPULATE, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE,
};
use log::{debug, trace};
use picket_core::util::{PAGE_MASK, PAGE_SIZE};
use picket_core::{MapError, MapResult, PageMapper};

lazy_static! {
    static ref HOST_PAGE_SIZE: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

/// [`PageMapper`] backed by one private anonymous mapping.
///
/// `read_byte` and `write_byte` dereference the given address directly; the
/// detector only uses them on open pages inside the reservation.
#[derive(Debug)]
pub struct MmapMapper {
    base: *mut c_void,
    len: usize,
}

// The mapping is exclusively owned and only reachable through &mut self.
unsafe impl Send for MmapMapper {}

impl MmapMapper {
    /// Creates a mapper with no reservation yet.
    ///
    /// # Errors
    ///
    /// [`MapError::Unsupported`] when the host page size differs from
    /// [`PAGE_SIZE`], since guard placement assumes the pool's page size is
    /// the unit of protection.
    pub fn new() -> MapResult<Self> {
        let host = *HOST_PAGE_SIZE;
        if host != PAGE_SIZE {
            return Err(MapError::Unsupported(format!(
                "host pages are {host} bytes, the pool needs {PAGE_SIZE}"
            )));
        }
        Ok(Self {
            base: ptr::null_mut(),
            len: 0,
        })
    }

    fn checked_page(&self, page_addr: usize) -> MapResult<*mut c_void> {
        if page_addr & PAGE_MASK != 0 {
            return Err(MapError::OutOfRange(page_addr));
        }
        let base = self.base as usize;
        if self.base.is_null() || page_addr < base || page_addr >= base + self.len {
            return Err(MapError::OutOfRange(page_addr));
        }
        Ok(page_addr as *mut c_void)
    }

    fn set_protection(&mut self, page_addr: usize, prot: i32) -> MapResult<()> {
        let page = self.checked_page(page_addr)?;
        let rc = unsafe { libc::mprotect(page, PAGE_SIZE, prot) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl PageMapper for MmapMapper {
    fn reserve(&mut self, len: usize) -> MapResult<usize> {
        if !self.base.is_null() {
            return Err(MapError::Unsupported(
                "mapper already holds a reservation".to_string(),
            ));
        }
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_POPULATE,
                -1,
                0,
            )
        };
        if p == MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        self.base = p;
        self.len = len;
        debug!("mapped {} pool bytes at 0x{:x}", len, p as usize);
        Ok(p as usize)
    }

    fn protect(&mut self, page_addr: usize) -> MapResult<()> {
        trace!("mprotect(PROT_NONE) on 0x{page_addr:x}");
        self.set_protection(page_addr, PROT_NONE)
    }

    fn unprotect(&mut self, page_addr: usize) -> MapResult<()> {
        trace!("mprotect(PROT_READ | PROT_WRITE) on 0x{page_addr:x}");
        self.set_protection(page_addr, PROT_READ | PROT_WRITE)
    }

    fn read_byte(&self, addr: usize) -> u8 {
        unsafe { ptr::read_volatile(addr as *const u8) }
    }

    fn write_byte(&mut self, addr: usize, value: u8) {
        unsafe { ptr::write_volatile(addr as *mut u8, value) };
    }

    fn release(&mut self) {
        if self.base.is_null() {
            return;
        }
        unsafe { libc::munmap(self.base, self.len) };
        trace!("unmapped the pool at 0x{:x}", self.base as usize);
        self.base = ptr::null_mut();
        self.len = 0;
    }
}
