/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Deepest call stack retained for an allocation or free site
pub const STACK_DEPTH: usize = 64;

/// Default number of guarded slots in the pool
pub const DEFAULT_SLOT_COUNT: usize = 255;

/// Default average number of allocations between diversions
pub const DEFAULT_SAMPLE_INTERVAL: u32 = 100;

/// Longest byte run shown by a corruption dump
pub const CORRUPTION_DUMP_BYTES: usize = 16;
