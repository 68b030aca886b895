//! Stack capture and symbolization collaborators.
//!
//! Unwinding is the host's business. The detector consumes already-captured
//! return addresses through [`StackCapturer`] and turns them into display
//! names through [`FrameSymbolizer`]; both default to inert implementations
//! so a detector is usable before either service is wired up.

/// Captures the calling thread's return addresses.
pub trait StackCapturer {
    /// Fills `frames` innermost first and returns how many entries were
    /// written. Implementations may claim more than `frames.len()`; the
    /// excess is discarded.
    fn capture(&self, frames: &mut [usize]) -> usize;
}

/// Resolves a return address to a display name.
pub trait FrameSymbolizer {
    /// Returns the symbolic name for `frame`, or `None` to fall back to a
    /// raw hex rendering.
    fn symbolize(&self, frame: usize) -> Option<String>;
}

/// Capturer that records nothing.
///
/// Reports rendered under this capturer show "no allocation stack".
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStacks;

impl StackCapturer for NoStacks {
    fn capture(&self, _frames: &mut [usize]) -> usize {
        0
    }
}

/// Symbolizer that knows no names; every frame renders as raw hex.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSymbols;

impl FrameSymbolizer for NoSymbols {
    fn symbolize(&self, _frame: usize) -> Option<String> {
        None
    }
}
