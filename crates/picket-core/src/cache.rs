//! Object-type descriptors.
//!
//! Hosts describe each object type they may divert with a [`CacheDescriptor`]
//! and keep it alive in an [`std::sync::Arc`]. Slot records hold only weak
//! references, so a descriptor torn down behind the detector's back can never
//! dangle; [`crate::Detector::unregister_cache`] is the orderly way to retire
//! one.

use serde::Serialize;

use crate::util::PAGE_SIZE;

/// Display name and placement facts for one object type.
#[derive(Debug, Clone, Serialize)]
pub struct CacheDescriptor {
    name: String,
    align: usize,
}

impl CacheDescriptor {
    /// Creates a descriptor.
    ///
    /// # Arguments
    ///
    /// * `name` - Display name used in reports
    /// * `align` - Alignment honored by page-end placements; must be a
    ///   power of two no larger than one page
    pub fn new(name: impl Into<String>, align: usize) -> Self {
        assert!(align.is_power_of_two() && align <= PAGE_SIZE);
        Self {
            name: name.into(),
            align,
        }
    }

    /// Display name used in reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Alignment honored by page-end placements.
    pub fn align(&self) -> usize {
        self.align
    }
}

#[cfg(test)]
mod tests {
    use super::CacheDescriptor;

    #[test]
    fn test_descriptor_fields() {
        let cache = CacheDescriptor::new("request", 8);
        assert_eq!(cache.name(), "request");
        assert_eq!(cache.align(), 8);
    }

    #[test]
    #[should_panic]
    fn test_rejects_non_power_of_two_align() {
        CacheDescriptor::new("bad", 24);
    }
}
