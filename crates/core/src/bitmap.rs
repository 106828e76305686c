//! Received-range tracking for handshake message bodies.
//!
//! A [`MessageBitmap`] records which bytes of a message have arrived. Bits are
//! packed LSB-first: bit `b` lives in byte `b / 8` under mask `1 << (b % 8)`.
//!
//! # Invariants
//!
//! - Bits past `num_bits` in the final byte are marked at construction, so
//!   completion is "every byte is `0xff`"
//! - Every byte before `first_unmarked_byte` is `0xff`; the cursor never
//!   moves backwards
//! - Once every bit is marked the backing storage is released and the bitmap
//!   reports complete forever after
//!
//! # Example
//! ```
//! use dtls_flight_core::bitmap::MessageBitmap;
//!
//! let mut bitmap = MessageBitmap::new(20).unwrap();
//! bitmap.mark_range(0, 5);
//! bitmap.mark_range(12, 20);
//! assert_eq!(bitmap.next_unmarked_range(0), 5..12);
//!
//! bitmap.mark_range(5, 12);
//! assert!(bitmap.is_complete());
//! ```

use crate::error::{ResourceError, Result};
use std::ops::Range;

/// Bitmap over `[0, num_bits)` with a forward-only cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBitmap {
    /// Backing bytes, empty once complete
    bytes: Vec<u8>,
    /// Index of the first byte that is not `0xff`
    first_unmarked_byte: usize,
}

/// Mask of the low `n` bits, `n` in `0..=8`.
fn low_bits(n: usize) -> u8 {
    ((1u16 << n) - 1) as u8
}

impl MessageBitmap {
    /// Create a bitmap of `num_bits` unmarked bits.
    ///
    /// # Errors
    /// - `ResourceError::Overflow` if rounding `num_bits` up to a byte overflows
    /// - `ResourceError::AllocationFailed` if the backing bytes cannot be allocated
    pub fn new(num_bits: usize) -> Result<Self> {
        let num_bytes = num_bits
            .checked_add(7)
            .ok_or(ResourceError::Overflow { bits: num_bits })?
            / 8;

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(num_bytes)
            .map_err(|_| ResourceError::AllocationFailed { bytes: num_bytes })?;
        bytes.resize(num_bytes, 0);

        let mut bitmap = Self {
            bytes,
            first_unmarked_byte: 0,
        };
        bitmap.mark_range(num_bits, num_bytes * 8);
        Ok(bitmap)
    }

    /// Mark bits `[start, end)`.
    ///
    /// Ranges are clamped to the bitmap; empty or already-covered ranges are
    /// no-ops, so marking is idempotent and order-independent.
    pub fn mark_range(&mut self, start: usize, end: usize) {
        let capacity = self.bytes.len() * 8;
        let start = start.max(self.first_unmarked_byte * 8).min(capacity);
        let end = end.min(capacity);
        if start >= end {
            return;
        }

        let first = start / 8;
        let last = end / 8;
        if first == last {
            self.bytes[first] |= low_bits(end % 8) & !low_bits(start % 8);
        } else {
            self.bytes[first] |= !low_bits(start % 8);
            self.bytes[first + 1..last].fill(0xff);
            if end % 8 != 0 {
                self.bytes[last] |= low_bits(end % 8);
            }
        }

        while self.first_unmarked_byte < self.bytes.len()
            && self.bytes[self.first_unmarked_byte] == 0xff
        {
            self.first_unmarked_byte += 1;
        }

        if self.first_unmarked_byte == self.bytes.len() {
            self.bytes = Vec::new();
        }
    }

    /// Find the first run of unmarked bits at or after `start`.
    ///
    /// The run is maximal: it continues across fully unmarked bytes and into
    /// the leading unmarked bits of the next partially marked byte. Returns an
    /// empty range when nothing is left to mark.
    pub fn next_unmarked_range(&self, start: usize) -> Range<usize> {
        let start = start.max(self.first_unmarked_byte * 8);
        let mut idx = start / 8;
        if idx >= self.bytes.len() {
            return 0..0;
        }

        // Treat bits below `start` as marked.
        let mut byte = self.bytes[idx] | low_bits(start % 8);
        if byte == 0xff {
            match self.bytes[idx + 1..].iter().position(|&b| b != 0xff) {
                Some(skip) => {
                    idx += 1 + skip;
                    byte = self.bytes[idx];
                }
                None => return 0..0,
            }
        }

        let run_start = idx * 8 + byte.trailing_ones() as usize;
        let bit = run_start % 8;
        let run_in_byte = ((byte >> bit).trailing_zeros() as usize).min(8 - bit);
        let mut run_end = run_start + run_in_byte;

        if run_end % 8 == 0 {
            idx += 1;
            while idx < self.bytes.len() && self.bytes[idx] == 0 {
                run_end += 8;
                idx += 1;
            }
            if idx < self.bytes.len() {
                run_end += self.bytes[idx].trailing_zeros() as usize;
            }
        }

        run_start..run_end
    }

    /// True once every bit has been marked.
    pub fn is_complete(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_bits_is_complete() {
        let bitmap = MessageBitmap::new(0).unwrap();
        assert!(bitmap.is_complete());
        assert!(bitmap.next_unmarked_range(0).is_empty());
    }

    #[test]
    fn test_overflow_rejected() {
        let result = MessageBitmap::new(usize::MAX);
        assert!(matches!(
            result,
            Err(crate::error::Error::Resource(ResourceError::Overflow { .. }))
        ));
    }

    #[test]
    fn test_padding_is_premarked() {
        let mut bitmap = MessageBitmap::new(10).unwrap();
        assert_eq!(bitmap.next_unmarked_range(0), 0..10);

        bitmap.mark_range(0, 10);
        assert!(bitmap.is_complete());
    }

    #[test]
    fn test_mark_within_one_byte() {
        let mut bitmap = MessageBitmap::new(8).unwrap();
        bitmap.mark_range(2, 5);
        assert_eq!(bitmap.next_unmarked_range(0), 0..2);
        assert_eq!(bitmap.next_unmarked_range(2), 5..8);
        assert!(!bitmap.is_complete());
    }

    #[test]
    fn test_mark_across_bytes() {
        let mut bitmap = MessageBitmap::new(40).unwrap();
        bitmap.mark_range(3, 29);
        assert_eq!(bitmap.next_unmarked_range(0), 0..3);
        assert_eq!(bitmap.next_unmarked_range(3), 29..40);
    }

    #[test]
    fn test_range_extends_through_empty_bytes() {
        let mut bitmap = MessageBitmap::new(64).unwrap();
        bitmap.mark_range(0, 4);
        bitmap.mark_range(35, 64);

        // Run starts mid-byte, crosses three empty bytes, stops at bit 35.
        assert_eq!(bitmap.next_unmarked_range(0), 4..35);
    }

    #[test]
    fn test_next_range_skips_full_bytes() {
        let mut bitmap = MessageBitmap::new(32).unwrap();
        bitmap.mark_range(0, 8);
        bitmap.mark_range(10, 24);
        assert_eq!(bitmap.next_unmarked_range(0), 8..10);
        assert_eq!(bitmap.next_unmarked_range(10), 24..32);
    }

    #[test]
    fn test_start_beyond_capacity() {
        let bitmap = MessageBitmap::new(16).unwrap();
        assert!(bitmap.next_unmarked_range(100).is_empty());
    }

    #[test]
    fn test_clamps_out_of_range_marks() {
        let mut bitmap = MessageBitmap::new(12).unwrap();
        bitmap.mark_range(6, 1000);
        assert_eq!(bitmap.next_unmarked_range(0), 0..6);
        bitmap.mark_range(5, 2);
        assert_eq!(bitmap.next_unmarked_range(0), 0..6);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut bitmap = MessageBitmap::new(24).unwrap();
        bitmap.mark_range(0, 16);
        let cursor = bitmap.first_unmarked_byte;
        bitmap.mark_range(0, 4);
        assert_eq!(bitmap.first_unmarked_byte, cursor);
        assert_eq!(bitmap.next_unmarked_range(0), 16..24);
    }

    #[test]
    fn test_storage_released_on_completion() {
        let mut bitmap = MessageBitmap::new(1000).unwrap();
        bitmap.mark_range(0, 500);
        bitmap.mark_range(500, 1000);
        assert!(bitmap.is_complete());
        assert_eq!(bitmap.bytes.capacity(), 0);

        // Marks after completion are harmless.
        bitmap.mark_range(0, 1000);
        assert!(bitmap.is_complete());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn ranges(max_bits: usize) -> impl Strategy<Value = Vec<(usize, usize)>> {
            prop::collection::vec((0..=max_bits, 0..=max_bits), 0..24)
        }

        /// Naive model: one bool per bit.
        fn model(num_bits: usize, marks: &[(usize, usize)]) -> Vec<bool> {
            let mut bits = vec![false; num_bits];
            for &(start, end) in marks {
                for bit in bits.iter_mut().take(end.min(num_bits)).skip(start) {
                    *bit = true;
                }
            }
            bits
        }

        proptest! {
            #[test]
            fn prop_full_mark_completes(num_bits in 0usize..2048) {
                let mut bitmap = MessageBitmap::new(num_bits).unwrap();
                bitmap.mark_range(0, num_bits);
                prop_assert!(bitmap.is_complete());
            }

            #[test]
            fn prop_order_independent(num_bits in 1usize..300, marks in ranges(320)) {
                let mut forward = MessageBitmap::new(num_bits).unwrap();
                for &(s, e) in &marks {
                    forward.mark_range(s, e);
                }
                let mut reverse = MessageBitmap::new(num_bits).unwrap();
                for &(s, e) in marks.iter().rev() {
                    reverse.mark_range(s, e);
                }
                prop_assert_eq!(forward.is_complete(), reverse.is_complete());
                prop_assert_eq!(forward.next_unmarked_range(0), reverse.next_unmarked_range(0));
            }

            #[test]
            fn prop_idempotent(num_bits in 1usize..300, marks in ranges(320)) {
                let mut once = MessageBitmap::new(num_bits).unwrap();
                for &(s, e) in &marks {
                    once.mark_range(s, e);
                }
                let mut twice = once.clone();
                for &(s, e) in &marks {
                    twice.mark_range(s, e);
                }
                prop_assert_eq!(once, twice);
            }

            #[test]
            fn prop_prefix_then_next_range(num_bits in 1usize..300, k in 0usize..300) {
                let k = k.min(num_bits);
                let mut bitmap = MessageBitmap::new(num_bits).unwrap();
                bitmap.mark_range(0, k);
                if k == num_bits {
                    prop_assert!(bitmap.next_unmarked_range(0).is_empty());
                } else {
                    prop_assert_eq!(bitmap.next_unmarked_range(0), k..num_bits);
                }
            }

            #[test]
            fn prop_next_range_matches_model(num_bits in 1usize..200, marks in ranges(220), from in 0usize..220) {
                let mut bitmap = MessageBitmap::new(num_bits).unwrap();
                for &(s, e) in &marks {
                    bitmap.mark_range(s, e);
                }
                let bits = model(num_bits, &marks);

                let expected = match (from..num_bits).find(|&b| !bits[b]) {
                    Some(start) => {
                        let end = (start..num_bits).find(|&b| bits[b]).unwrap_or(num_bits);
                        start..end
                    }
                    None => 0..0,
                };
                prop_assert_eq!(bitmap.next_unmarked_range(from), expected);
                prop_assert_eq!(bitmap.is_complete(), bits.iter().all(|&b| b));
            }
        }
    }
}
