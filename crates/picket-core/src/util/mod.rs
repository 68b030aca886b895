//! Utility functions and types used throughout Picket.
//!
//! This module provides:
//! - Constants for page math ([`PAGE_SIZE`], [`PAGE_SHIFT`], [`PAGE_MASK`])
//!   and detector defaults
//! - [`Rng`] - seedable random number generation
//! - Small helpers for building fixed-size tables ([`make_vec`]) and
//!   alignment math ([`align_down`])

mod constants;
mod rng;

pub use self::constants::*;
pub use self::rng::Rng;

/// Creates a vector by applying a function to each index.
///
/// # Arguments
///
/// * `n` - Number of elements to create
/// * `f` - Function that takes an index and returns a value
///
/// # Examples
///
/// ```
/// use picket_core::util::make_vec;
///
/// let squares = make_vec(5, |i| i * i);
/// assert_eq!(squares, vec![0, 1, 4, 9, 16]);
/// ```
pub fn make_vec<T>(n: usize, f: impl Fn(usize) -> T) -> Vec<T> {
    let mut v = Vec::with_capacity(n);
    for i in 0..n {
        let val = f(i);
        v.push(val);
    }
    v
}

/// Rounds `value` down to a multiple of `align`.
///
/// `align` must be a power of two.
pub fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::{align_down, make_vec};

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_down(0x1000, 0x1000), 0x1000);
        assert_eq!(align_down(4097, 8), 4096);
        assert_eq!(align_down(13, 1), 13);
    }

    #[test]
    fn test_make_vec_indices() {
        let v = make_vec(4, |i| i * 2);
        assert_eq!(v, vec![0, 2, 4, 6]);
        assert!(make_vec(0, |i| i).is_empty());
    }
}
