//! Allocation bitmap of one group
//!
//! One bit per governed block: 0 = free, 1 = used. Bit `i` describes group
//! offset `i + 1`. Bits are packed little-endian, so the free scan can look
//! at whole 64-bit words first.

use bytes::Buf;

/// Bitmap over a single block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationBitmap {
    data: Vec<u8>,
}

impl AllocationBitmap {
    /// All-free bitmap for a block of `block_size` bytes
    #[must_use]
    pub fn empty(block_size: u32) -> Self {
        Self {
            data: vec![0u8; block_size as usize],
        }
    }

    /// Wrap a bitmap block read from the store
    #[must_use]
    pub const fn from_block(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Number of bits held
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.data.len() as u64 * 8
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn is_set(&self, bit: u64) -> bool {
        let byte = (bit / 8) as usize;
        self.data[byte] & (1 << (bit % 8)) != 0
    }

    pub fn set(&mut self, bit: u64) {
        let byte = (bit / 8) as usize;
        self.data[byte] |= 1 << (bit % 8);
    }

    pub fn clear(&mut self, bit: u64) {
        let byte = (bit / 8) as usize;
        self.data[byte] &= !(1 << (bit % 8));
    }

    /// Free group offsets (bit index + 1) among the first `usable` bits,
    /// ascending
    #[must_use]
    pub fn free_offsets(&self, usable: u64) -> Vec<u32> {
        let usable = usable.min(self.len());
        let mut free = Vec::new();
        let mut words = &self.data[..];
        let mut base = 0u64;

        while base < usable && words.remaining() >= 8 {
            let word = words.get_u64_le();
            let end = (base + 64).min(usable);

            if word == u64::MAX {
                // full word
            } else if word == 0 && end == base + 64 {
                free.extend((base + 1..=end).map(|offset| offset as u32));
            } else {
                for bit in base..end {
                    if word & (1 << (bit - base)) == 0 {
                        free.push((bit + 1) as u32);
                    }
                }
            }
            base += 64;
        }
        free
    }

    /// Number of used bits among the first `usable`
    #[must_use]
    pub fn count_used(&self, usable: u64) -> u64 {
        usable.min(self.len()) - self.free_offsets(usable).len() as u64
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_bitmap_is_all_free() {
        let bitmap = AllocationBitmap::empty(512);
        assert_eq!(bitmap.len(), 4096);

        let free = bitmap.free_offsets(4096);
        assert_eq!(free.len(), 4096);
        assert_eq!(free.first(), Some(&1));
        assert_eq!(free.last(), Some(&4096));
    }

    #[test]
    fn test_set_and_clear() {
        let mut bitmap = AllocationBitmap::empty(512);
        bitmap.set(0);
        bitmap.set(65);
        assert!(bitmap.is_set(0));
        assert!(bitmap.is_set(65));
        assert!(!bitmap.is_set(64));

        let free = bitmap.free_offsets(128);
        assert_eq!(free.len(), 126);
        assert_eq!(free[0], 2);
        assert!(!free.contains(&66));

        bitmap.clear(65);
        assert!(!bitmap.is_set(65));
        assert_eq!(bitmap.count_used(4096), 1);
    }

    #[test]
    fn test_full_words_skipped() {
        let mut bitmap = AllocationBitmap::empty(512);
        for bit in 0..128 {
            bitmap.set(bit);
        }
        bitmap.clear(100);
        assert_eq!(bitmap.free_offsets(130), vec![101, 129, 130]);
    }

    #[test]
    fn test_usable_limit_clips_scan() {
        let bitmap = AllocationBitmap::empty(512);
        let free = bitmap.free_offsets(70);
        assert_eq!(free.len(), 70);
        assert_eq!(free.last(), Some(&70));

        assert!(bitmap.free_offsets(0).is_empty());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut bitmap = AllocationBitmap::empty(512);
        bitmap.set(9);
        let restored = AllocationBitmap::from_block(bitmap.clone().into_bytes());
        assert_eq!(restored, bitmap);
        assert_eq!(restored.as_bytes()[1], 0b10);
    }
}
