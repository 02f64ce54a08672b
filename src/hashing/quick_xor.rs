use super::ContentHasher;

const WIDTH: usize = 20;
const SHIFT: usize = 11;
const WIDTH_BITS: usize = WIDTH * 8;

/// Rolling XOR hash used by some cloud drives.
///
/// Each byte is XORed into a 160-bit state at a bit offset that advances by
/// 11 per byte; the file size (little-endian) is folded into the last 8 bytes
/// when the digest is taken.
#[derive(Debug, Clone)]
pub struct QuickXorHasher {
    state: [u8; WIDTH],
    bit_position: usize,
    size: u64,
}

impl Default for QuickXorHasher {
    fn default() -> Self {
        Self {
            state: [0; WIDTH],
            bit_position: 0,
            size: 0,
        }
    }
}

impl QuickXorHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentHasher for QuickXorHasher {
    fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let index = self.bit_position / 8;
            let next = (index + 1) % WIDTH;
            let shifted = u16::from(byte) << (self.bit_position % 8);
            self.state[index] ^= shifted as u8;
            self.state[next] ^= (shifted >> 8) as u8;
            self.bit_position = (self.bit_position + SHIFT) % WIDTH_BITS;
        }
        self.size += data.len() as u64;
    }

    fn sum(&self) -> Vec<u8> {
        let mut out = self.state.to_vec();
        for (slot, b) in out[WIDTH - 8..].iter_mut().zip(self.size.to_le_bytes()) {
            *slot ^= b;
        }
        out
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qx(data: &[u8]) -> String {
        let mut h = QuickXorHasher::new();
        h.update(data);
        h.hex_sum()
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(qx(b""), "0000000000000000000000000000000000000000");
        assert_eq!(qx(b"a"), "6100000000000000000000000100000000000000");
        assert_eq!(qx(b"ab"), "6110030000000000000000000200000000000000");
    }

    #[test]
    fn test_chunking_does_not_matter() {
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let whole = qx(&data);

        let mut h = QuickXorHasher::new();
        for chunk in data.chunks(7) {
            h.update(chunk);
        }
        assert_eq!(h.hex_sum(), whole);
    }

    #[test]
    fn test_reset() {
        let mut h = QuickXorHasher::new();
        h.update(b"something");
        h.reset();
        h.update(b"a");
        assert_eq!(h.hex_sum(), qx(b"a"));
    }
}
