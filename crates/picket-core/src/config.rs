//! Runtime configuration for the detector.

use serde::Serialize;

use crate::util::{DEFAULT_SAMPLE_INTERVAL, DEFAULT_SLOT_COUNT};

/// Substrings that locate the detector's own entry points in a symbolized
/// stack, so reports lead with the first caller frame instead.
#[derive(Debug, Clone, Serialize)]
pub struct SkipMarkers {
    fault_entry: String,
    free_entry: String,
}

impl SkipMarkers {
    /// Creates markers matching the host's wrapper symbols.
    ///
    /// # Arguments
    ///
    /// * `fault_entry` - substring of the symbol that forwards traps.
    /// * `free_entry` - substring of the symbol that forwards frees.
    pub fn new(fault_entry: impl Into<String>, free_entry: impl Into<String>) -> Self {
        Self {
            fault_entry: fault_entry.into(),
            free_entry: free_entry.into(),
        }
    }

    /// Marker for trap-path reports.
    pub fn fault_entry(&self) -> &str {
        &self.fault_entry
    }

    /// Marker for free-path reports.
    pub fn free_entry(&self) -> &str {
        &self.free_entry
    }
}

impl Default for SkipMarkers {
    fn default() -> Self {
        Self::new("handle_fault", "try_free")
    }
}

/// Tunables for a [`Detector`](crate::Detector).
#[derive(Debug, Clone, Serialize)]
pub struct DetectorConfig {
    /// Number of guarded slots in the pool.
    pub slot_count: usize,
    /// Mean number of allocation requests between diversions.
    pub sample_interval: u32,
    /// Seed for placement and sampling randomness.
    pub seed: u64,
    /// Stack-skip markers applied when rendering reports.
    pub skip_markers: SkipMarkers,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            seed: rand::random(),
            skip_markers: SkipMarkers::default(),
        }
    }
}
