//! # Boot Memory Map
//!
//! The boot loader hands the kernel a multiboot memory map: a packed buffer of
//! variable-size records, each prefixed by its own size (not counting the
//! prefix itself).
//!
//! ```text
//! +0  size         u32   bytes that follow this field
//! +4  base_low     u32
//! +8  base_high    u32
//! +12 length_low   u32
//! +16 length_high  u32
//! +20 type         u32   1 = usable RAM
//! ```

use kernel_memory_addresses::PhysicalAddress;

/// Memory-map type of RAM the kernel may allocate from.
pub const MEMORY_USABLE: u32 = 1;

/// Payload bytes of a record (everything after the size prefix).
const RECORD_PAYLOAD: usize = 20;

/// One `(base, length, type)` record of the boot memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: u32) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.kind == MEMORY_USABLE
    }

    /// End of the range (exclusive), saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    /// Base as a 32-bit physical address, or `None` if it lies above 4 GiB.
    #[must_use]
    pub fn base_address(&self) -> Option<PhysicalAddress> {
        u32::try_from(self.base).ok().map(PhysicalAddress::new)
    }
}

/// Iterator over the records of a raw multiboot memory-map buffer.
///
/// Iteration stops at the first record that would run past the buffer.
#[derive(Debug, Clone)]
pub struct MultibootMemoryMap<'a> {
    buffer: &'a [u8],
}

impl<'a> MultibootMemoryMap<'a> {
    /// Wrap the `mmap_addr`/`mmap_length` buffer from the multiboot info block.
    #[must_use]
    pub const fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let word = bytes.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
}

impl Iterator for MultibootMemoryMap<'_> {
    type Item = MemoryMapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let size = read_u32(self.buffer, 0)? as usize;
        if size < RECORD_PAYLOAD {
            self.buffer = &[];
            return None;
        }

        let Some(end) = size.checked_add(4) else {
            self.buffer = &[];
            return None;
        };
        let record = self.buffer.get(4..end)?;
        let word = |i: usize| read_u32(record, i * 4).map(u64::from);
        let base = word(0)? | (word(1)? << 32);
        let length = word(2)? | (word(3)? << 32);
        let kind = read_u32(record, 16)?;

        self.buffer = &self.buffer[end..];
        Some(MemoryMapEntry { base, length, kind })
    }
}
