//! # Usable Physical Memory
//!
//! The frame allocator numbers frames densely across all usable RAM, so frame
//! `n` is not at `n * 4096` once there are holes in the memory map. This
//! module keeps the table that maps frame numbers to addresses and back.

use alloc::vec::Vec;
use kernel_info::boot::MemoryMapEntry;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use log::{debug, info, warn};

/// Highest physical address (exclusive) a 32-bit frame can start below.
const ADDRESSABLE_END: u64 = 1 << 32;

/// One page-aligned run of usable RAM.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRange {
    pub base: PhysicalAddress,
    /// Frame number of `base`.
    pub first_frame: u32,
    pub frames: u32,
}

impl MemoryRange {
    #[inline]
    #[must_use]
    pub const fn contains_frame(&self, frame: u32) -> bool {
        frame >= self.first_frame && frame - self.first_frame < self.frames
    }
}

/// All usable RAM, in boot memory-map order.
#[derive(Debug, Clone, Default)]
pub struct MemoryRanges {
    ranges: Vec<MemoryRange>,
    total: u32,
}

impl MemoryRanges {
    /// Keep the usable entries of a boot memory map.
    ///
    /// Each entry is shrunk to whole pages and clipped at 4 GiB; entries that
    /// end up empty are dropped.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_entries(entries: impl IntoIterator<Item = MemoryMapEntry>) -> Self {
        let page = u64::from(PAGE_SIZE);
        let mut ranges = Vec::new();
        let mut total = 0u32;

        for entry in entries.into_iter().filter(MemoryMapEntry::is_usable) {
            let base = entry.base.div_ceil(page).checked_mul(page);
            let end = entry.end().min(ADDRESSABLE_END) / page * page;
            let Some(base) = base.filter(|&base| base < end) else {
                debug!("Skipping unusable range {:#x}+{:#x}", entry.base, entry.length);
                continue;
            };

            let frames = ((end - base) / page) as u32;
            let Some(next_total) = total.checked_add(frames) else {
                warn!("Ignoring RAM beyond {total} frames at {base:#x}");
                continue;
            };
            ranges.push(MemoryRange {
                base: PhysicalAddress::new(base as u32),
                first_frame: total,
                frames,
            });
            info!("RAM {:#010x}..{end:#010x}: {frames} frames", base);
            total = next_total;
        }

        Self { ranges, total }
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.total
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRange> {
        self.ranges.iter()
    }

    /// Physical address of frame `frame`.
    #[must_use]
    pub fn address_of(&self, frame: u32) -> Option<PhysicalAddress> {
        let range = self.ranges.iter().find(|r| r.contains_frame(frame))?;
        Some(range.base + (frame - range.first_frame) * PAGE_SIZE)
    }

    /// Frame number of the frame containing `address`.
    #[must_use]
    pub fn frame_of(&self, address: PhysicalAddress) -> Option<u32> {
        let address = address.as_u32();
        self.ranges.iter().find_map(|r| {
            let offset = address.checked_sub(r.base.as_u32())?;
            let index = offset / PAGE_SIZE;
            (index < r.frames).then_some(r.first_frame + index)
        })
    }
}
