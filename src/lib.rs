//! # Picket
//!
//! Picket is a sampling guard-page detector for out-of-bounds accesses,
//! use-after-frees and heap corruption. A host allocator offers every
//! allocation request to the detector; a lock-free sampling gate elects a
//! small fraction, which are served from a pool of fenced pages instead of
//! the regular heap. Violations on guarded objects raise hardware faults or
//! fail canary validation on free, and produce deterministic reports with
//! allocation and deallocation provenance.
//!
//! ## Quickstart
//!
//! ```
//! use std::sync::Arc;
//!
//! use picket::{CacheDescriptor, Detector, DetectorConfig, FreeOutcome};
//! use picket_sim::SimMapper;
//!
//! # fn main() -> Result<(), picket::BuildError> {
//! let config = DetectorConfig {
//!     slot_count: 8,
//!     sample_interval: 1,
//!     seed: 7,
//!     ..DetectorConfig::default()
//! };
//! let detector = Detector::builder()
//!     .config(config)
//!     .mapper(SimMapper::new())
//!     .build()?;
//!
//! let cache = Arc::new(CacheDescriptor::new("widgets", 8));
//! let addr = detector.try_allocate(24, &cache).expect("interval 1 diverts");
//! assert_eq!(detector.object_size(addr), 24);
//! assert_eq!(detector.remove(addr), Some(FreeOutcome::Freed));
//! # Ok(())
//! # }
//! ```
//!
//! ## Crates
//!
//! - `picket-core`: detector state machine, guarded pool, sampling gate,
//!   fault attribution, and report rendering.
//! - `picket-mmap`: anonymous-mapping mapper with real page protection
//!   (feature `mmap`).
//! - `picket-sim`: simulated in-memory mapper for tests and evaluation
//!   (feature `sim`).

#![warn(missing_docs)]

pub use picket_core::*;

#[cfg(feature = "mmap")]
pub use picket_mmap as mmap;

#[cfg(feature = "sim")]
pub use picket_sim as sim;
