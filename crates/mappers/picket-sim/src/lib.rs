//! Simulated byte-array page mapper for tests and evaluation.
//!
//! This mapper backs the pool with a plain byte vector instead of real
//! pages. Protection is bookkeeping only: nothing traps, and hosts drive
//! [`Detector::handle_fault`](picket_core::Detector::handle_fault)
//! themselves. State is shared across clones, so a test can keep one handle
//! while the detector owns another and inspect or corrupt pool memory from
//! outside.

#![warn(missing_docs)]

mod sim;

pub use sim::SimMapper;
