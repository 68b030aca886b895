//! Anonymous-mapping page mapper for Linux hosts.
//!
//! Backs the pool with one private anonymous `mmap` reservation and drives
//! real page protection through `mprotect`, so guard-page and
//! use-after-free accesses raise genuine faults the host can route to
//! [`Detector::handle_fault`](picket_core::Detector::handle_fault).

#![warn(missing_docs)]

mod mmap;

pub use mmap::MmapMapper;
