//! 64-bit cyclic polynomial rolling hash. Values of this hash are stored in manifests and chunk
//! headers, so the table and the mixing function can never change.

use std::collections::VecDeque;
use std::sync::LazyLock;

const POLYNOMIAL: u64 = 0xC96C5795D7870F42;

static HASH_TABLE: LazyLock<[u64; 256]> = LazyLock::new(|| {
    let mut table = [0; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut value = i as u64;
        for _ in 0..8 {
            value = if value & 1 != 0 { (value >> 1) ^ POLYNOMIAL } else { value >> 1 };
        }
        *entry = value;
    }
    table
});

/// Hash of a whole buffer, equal to the rolling hash once a window of `data.len()` is full.
pub fn hash_for_data(data: &[u8]) -> u64 {
    data.iter().fold(0, |hash, &byte| hash.rotate_left(1) ^ HASH_TABLE[byte as usize])
}

/// Rolling window over a byte stream.
#[derive(Debug, Clone)]
pub struct RollingHash {
    window_size: usize,
    hash: u64,
    window: VecDeque<u8>,
}
impl RollingHash {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            hash: 0,
            window: VecDeque::with_capacity(window_size),
        }
    }
    /// Feeds a byte while the window is still filling.
    pub fn consume_byte(&mut self, byte: u8) {
        assert!(self.window.len() < self.window_size, "rolling hash window already full");
        self.window.push_back(byte);
        self.hash = self.hash.rotate_left(1) ^ HASH_TABLE[byte as usize];
    }
    /// Slides the full window forward by one byte.
    pub fn roll_forward(&mut self, byte: u8) {
        assert_eq!(self.window.len(), self.window_size, "rolling hash window not full");
        let Some(old) = self.window.pop_front() else { return };
        self.window.push_back(byte);
        let old_hash = HASH_TABLE[old as usize].rotate_left((self.window_size % 64) as u32);
        self.hash = self.hash.rotate_left(1) ^ old_hash ^ HASH_TABLE[byte as usize];
    }
    pub fn is_full(&self) -> bool {
        self.window.len() == self.window_size
    }
    pub fn window_hash(&self) -> u64 {
        self.hash
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_table() {
        assert_eq!(0, HASH_TABLE[0]);
        assert_eq!(POLYNOMIAL, HASH_TABLE[128]);
        assert_eq!(0, hash_for_data(&[]));
    }

    #[test]
    fn test_rolling_matches_direct() {
        let data: Vec<u8> = (0..200u32).map(|i| (i * 31 % 251) as u8).collect();
        let window = 16;
        let mut hash = RollingHash::new(window);
        for &b in &data[..window] {
            hash.consume_byte(b);
        }
        assert!(hash.is_full());
        assert_eq!(hash_for_data(&data[..window]), hash.window_hash());
        for start in 1..=data.len() - window {
            hash.roll_forward(data[start + window - 1]);
            assert_eq!(hash_for_data(&data[start..start + window]), hash.window_hash());
        }
    }
}
