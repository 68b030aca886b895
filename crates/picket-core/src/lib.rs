//! Core sampling guard-page detector.
//!
//! picket watches a small, randomly chosen sample of a host allocator's
//! requests. Elected requests are served from a dedicated pool in which
//! every object sits alone in its own page, fenced by protected guard
//! pages. An access past either end of the object, or into a freed page,
//! raises a hardware fault that the host routes back to the detector; the
//! detector attributes the trap, renders a deterministic report, and
//! disarms until the host rearms it. Redzone bytes inside the object page
//! are filled with a canary pattern and validated on free, which catches
//! in-page overwrites no trap can see.
//!
//! The crate is platform-agnostic. Page protection, stack capture, and
//! symbolization are supplied by the host through the [`PageMapper`],
//! [`StackCapturer`], and [`FrameSymbolizer`] traits; ready-made mappers
//! live in companion crates.

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod context;
pub mod fault;
pub mod mapper;
pub mod pool;
pub mod report;
pub mod sampler;
pub mod slot;
pub mod stack;
pub mod util;

pub use cache::CacheDescriptor;
pub use config::{DetectorConfig, SkipMarkers};
pub use context::{BuildError, Detector, DetectorBuilder, DisarmReason, FaultVerdict};
pub use fault::{OobSide, Violation};
pub use mapper::{MapError, MapResult, PageMapper};
pub use pool::FreeOutcome;
pub use report::{ObjectSnapshot, Report};
pub use sampler::SampleGate;
pub use slot::{Placement, SlotState, StackTrace};
pub use stack::{FrameSymbolizer, NoStacks, NoSymbols, StackCapturer};
