//! Deterministic assembly and rendering of violation reports.
//!
//! Rendering is a pure function of the report, the symbolizer, and the skip
//! markers; the same inputs always produce the same text. Reports go to the
//! error log by default, or into a caller-supplied buffer.

use std::fmt::Write as _;

use itertools::Itertools as _;
use log::error;

use crate::config::SkipMarkers;
use crate::fault::{OobSide, Violation};
use crate::slot::{SlotRecord, SlotState, StackTrace};
use crate::stack::FrameSymbolizer;

const BANNER: &str =
    "==================================================================";

/// Separator between entries in an object dump.
pub(crate) const DUMP_SEPARATOR: &str = "---------------------------------";

/// Writes one line to the chosen sink: a buffer if one was supplied, the
/// error log otherwise.
pub(crate) fn emit(out: &mut Option<&mut String>, line: std::fmt::Arguments<'_>) {
    match out {
        Some(buffer) => {
            let _ = writeln!(buffer, "{line}");
        }
        None => error!("{line}"),
    }
}

fn render_stack(
    out: &mut Option<&mut String>,
    symbols: &dyn FrameSymbolizer,
    stack: &StackTrace,
    placeholder: &str,
) {
    if stack.is_empty() {
        emit(out, format_args!("  {placeholder}"));
        return;
    }
    for &frame in stack.frames() {
        let name = symbolize_frame(symbols, frame);
        emit(out, format_args!(" {name}"));
    }
}

fn symbolize_frame(symbols: &dyn FrameSymbolizer, frame: usize) -> String {
    symbols
        .symbolize(frame)
        .unwrap_or_else(|| format!("0x{frame:016x}"))
}

/// Copy of one slot's bookkeeping, detached from the pool.
///
/// Snapshots are taken under the detector lock and stay meaningful after the
/// slot has been reused.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    /// Slot index within the pool.
    pub index: usize,
    /// Object base address.
    pub address: usize,
    /// Requested object size in bytes.
    pub byte_length: usize,
    /// Slot state at the time of the snapshot.
    pub state: SlotState,
    /// Name of the owning cache, if it is still registered.
    pub cache_name: Option<String>,
    /// Stack captured at allocation.
    pub alloc_stack: StackTrace,
    /// Stack captured at free, empty while allocated.
    pub free_stack: StackTrace,
}

impl ObjectSnapshot {
    pub(crate) fn of(index: usize, record: &SlotRecord) -> Self {
        Self {
            index,
            address: record.address(),
            byte_length: record.byte_length(),
            state: record.state(),
            cache_name: record.cache_name(),
            alloc_stack: *record.alloc_stack(),
            free_stack: *record.free_stack(),
        }
    }

    pub(crate) fn render(&self, symbols: &dyn FrameSymbolizer, out: &mut Option<&mut String>) {
        emit(
            out,
            format_args!(
                "Object #{}: starts at 0x{:x}, size={}",
                self.index, self.address, self.byte_length
            ),
        );
        emit(out, format_args!("allocated at:"));
        render_stack(out, symbols, &self.alloc_stack, "no allocation stack.");
        if self.state == SlotState::Freed {
            emit(out, format_args!("freed at:"));
            render_stack(out, symbols, &self.free_stack, "no deallocation stack.");
        }
        if let Some(name) = &self.cache_name {
            emit(
                out,
                format_args!("Object #{} belongs to cache {}", self.index, name),
            );
        }
    }
}

/// One detected violation, ready to render.
#[derive(Debug, Clone)]
pub struct Report {
    /// What went wrong.
    pub kind: Violation,
    /// Address the violation was observed at.
    pub fault_address: usize,
    /// The object charged with the violation.
    pub object: ObjectSnapshot,
    /// Stack of the access (trap path) or of the free (free path).
    pub access_stack: StackTrace,
    /// For [`Violation::Corruption`]: the overwritten redzone bytes,
    /// starting at `fault_address`. Empty otherwise.
    pub corrupted_bytes: Vec<u8>,
}

impl Report {
    /// Renders the report.
    ///
    /// # Arguments
    ///
    /// * `symbols` - resolves stack entries to display names; unresolved
    ///   entries fall back to their hex value.
    /// * `markers` - locates the host's wrapper frame; display starts at the
    ///   frame after the first match, or at the top when the match has no
    ///   successor or nothing matches.
    /// * `out` - buffer to append to, or `None` for the error log.
    pub fn render(
        &self,
        symbols: &dyn FrameSymbolizer,
        markers: &SkipMarkers,
        mut out: Option<&mut String>,
    ) {
        let names: Vec<String> = self
            .access_stack
            .frames()
            .iter()
            .map(|&frame| symbolize_frame(symbols, frame))
            .collect();
        let marker = match self.kind {
            Violation::OutOfBounds(_) | Violation::UseAfterFree => markers.fault_entry(),
            Violation::Corruption | Violation::DoubleFree => markers.free_entry(),
        };
        let skip = names
            .iter()
            .position(|name| name.contains(marker))
            .map(|found| if found + 1 < names.len() { found + 1 } else { 0 })
            .unwrap_or(0);
        let title = names.get(skip).map(String::as_str).unwrap_or("<unknown>");
        let out = &mut out;

        emit(out, format_args!("{BANNER}"));
        match self.kind {
            Violation::OutOfBounds(side) => {
                emit(out, format_args!("BUG: picket: out-of-bounds in {title}"));
                let side = match side {
                    OobSide::Left => "left",
                    OobSide::Right => "right",
                };
                emit(
                    out,
                    format_args!(
                        "Memory access at address 0x{:x} to the {} of object #{}",
                        self.fault_address, side, self.object.index
                    ),
                );
            }
            Violation::UseAfterFree => {
                emit(out, format_args!("BUG: picket: use-after-free in {title}"));
                emit(
                    out,
                    format_args!(
                        "Memory access at address 0x{:x} into freed object #{}",
                        self.fault_address, self.object.index
                    ),
                );
            }
            Violation::Corruption => {
                emit(out, format_args!("BUG: picket: memory corruption in {title}"));
                emit(
                    out,
                    format_args!(
                        "Invalid write detected at address 0x{:x} in the redzone of object #{}",
                        self.fault_address, self.object.index
                    ),
                );
                let bytes = self
                    .corrupted_bytes
                    .iter()
                    .format_with(" ", |byte, f| f(&format_args!("{byte:02X}")));
                emit(
                    out,
                    format_args!("Bytes at 0x{:x}: {}", self.fault_address, bytes),
                );
            }
            Violation::DoubleFree => {
                emit(out, format_args!("BUG: picket: double-free in {title}"));
                emit(
                    out,
                    format_args!(
                        "Invalid free of address 0x{:x} (object #{})",
                        self.fault_address, self.object.index
                    ),
                );
            }
        }
        if skip < names.len() {
            for name in &names[skip..] {
                emit(out, format_args!(" {name}"));
            }
        } else {
            emit(out, format_args!(" no stack recorded."));
        }
        emit(out, format_args!(""));
        self.object.render(symbols, out);
        emit(out, format_args!("{BANNER}"));
    }
}
