//! Byte order of the WAL producer.

/// Byte order a WAL page was written in.
///
/// The producer writes pages in its native order, so the decoder infers it
/// from the page magic rather than assuming little endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

impl ByteOrder {
    /// Reads a `u16` at `at`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` holds fewer than `at + 2` bytes.
    #[must_use]
    pub fn read_u16(self, buf: &[u8], at: usize) -> u16 {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&buf[at..at + 2]);
        match self {
            Self::Little => u16::from_le_bytes(raw),
            Self::Big => u16::from_be_bytes(raw),
        }
    }

    /// Reads a `u32` at `at`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` holds fewer than `at + 4` bytes.
    #[must_use]
    pub fn read_u32(self, buf: &[u8], at: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[at..at + 4]);
        match self {
            Self::Little => u32::from_le_bytes(raw),
            Self::Big => u32::from_be_bytes(raw),
        }
    }

    /// Reads a `u64` at `at`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` holds fewer than `at + 8` bytes.
    #[must_use]
    pub fn read_u64(self, buf: &[u8], at: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[at..at + 8]);
        match self {
            Self::Little => u64::from_le_bytes(raw),
            Self::Big => u64::from_be_bytes(raw),
        }
    }

    /// Reads an `i64` at `at`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` holds fewer than `at + 8` bytes.
    #[must_use]
    pub fn read_i64(self, buf: &[u8], at: usize) -> i64 {
        self.read_u64(buf, at) as i64
    }
}
