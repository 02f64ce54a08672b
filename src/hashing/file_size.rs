use super::ContentHasher;

/// Pseudo-hash carrying only the byte count (8 bytes, little-endian).
///
/// Used when the source reports no real hash for a file.
#[derive(Debug, Default, Clone)]
pub struct FileSizeHasher {
    size: u64,
}

impl FileSizeHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl ContentHasher for FileSizeHasher {
    fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
    }

    fn sum(&self) -> Vec<u8> {
        self.size.to_le_bytes().to_vec()
    }

    fn reset(&mut self) {
        self.size = 0;
    }
}

/// Decode a [`FileSizeHasher`] digest back into a byte count.
#[must_use]
pub fn decode_size(sum: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = sum.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}
