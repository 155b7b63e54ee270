//! # Buddy Frame Allocator
//!
//! Physical memory is handed out in power-of-two blocks of 4 KiB frames.
//! Order 0 is one frame, order [`BUDDY_MAX_ORDER`] is 256 frames (1 MiB).
//!
//! ## Bitmaps
//!
//! Every order has its own bitmap, one bit per block, 32 blocks per word.
//! A set bit means the block is allocated, or contains an allocated frame:
//!
//! ```text
//! order 2   [1               ][0               ]
//! order 1   [1      ][0      ][0      ][0      ]
//! order 0   [1 ][0 ][0 ][0 ][0 ][0 ][0 ][0 ]
//! ```
//!
//! The buddy of block `i` is `i ^ 1`, its parent `i >> 1`, its children
//! `2i` and `2i + 1`. Blocks past the end of RAM count as allocated.
//!
//! ## Locking
//!
//! One [`SpinLock`] covers all bitmaps. Every public operation takes it exactly
//! once; a contended lock calls the configured relax hook between attempts.

use crate::memory_map::MemoryRanges;
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};
use kernel_sync::SpinLock;
use log::{debug, error, info, trace, warn};

/// Largest block order; order-8 blocks span 256 frames.
pub const BUDDY_MAX_ORDER: u8 = 8;

const ORDERS: usize = BUDDY_MAX_ORDER as usize + 1;

/// Frames in one block of the largest order.
const MAX_BLOCK_FRAMES: u32 = 1 << BUDDY_MAX_ORDER;

/// One allocated 4 KiB frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Frame {
    /// Frame number, or `None` for a frame outside allocatable RAM (MMIO) or
    /// one that was already reserved. Such frames are never freed.
    pub id: Option<u32>,
    pub address: PhysicalAddress,
    /// The block this frame was allocated as, at `order`.
    pub block: u32,
    pub order: u8,
}

impl Frame {
    #[inline]
    #[must_use]
    pub const fn page(&self) -> PhysicalPage {
        self.address.page()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("requested zero frames")]
    ZeroFrames,
    #[error("no free order-{order} block")]
    Exhausted { order: u8 },
    #[error("order-{order} block {block} is already allocated")]
    BlockAllocated { block: u32, order: u8 },
    #[error("order-{order} block {block} does not exist")]
    BlockOutOfRange { block: u32, order: u8 },
    #[error("{n} pages from {start} run past the end of the address space")]
    PastAddressSpace { start: PhysicalAddress, n: u32 },
}

/// Smallest order whose blocks hold `n` frames.
#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn order_for(n: u32) -> u8 {
    n.next_power_of_two().trailing_zeros() as u8
}

/// The per-order bitmaps.
struct BuddyMaps {
    maps: [Vec<u32>; ORDERS],
    n_blocks: [u32; ORDERS],
}

impl BuddyMaps {
    fn new(total: u32) -> Self {
        let n_blocks: [u32; ORDERS] = core::array::from_fn(|o| total >> o);
        let maps = core::array::from_fn(|o| {
            let n = n_blocks[o];
            let mut words = vec![0u32; n.div_ceil(32) as usize];
            // Bits past the last block never look free.
            if n % 32 != 0 {
                if let Some(last) = words.last_mut() {
                    *last = !0 << (n % 32);
                }
            }
            words
        });
        Self { maps, n_blocks }
    }

    #[inline]
    fn is_allocated(&self, order: u8, block: u32) -> bool {
        let o = order as usize;
        if o >= ORDERS || block >= self.n_blocks[o] {
            return true;
        }
        self.maps[o][(block / 32) as usize] & (1 << (block % 32)) != 0
    }

    #[inline]
    fn set(&mut self, order: u8, block: u32, allocated: bool) {
        let word = &mut self.maps[order as usize][(block / 32) as usize];
        if allocated {
            *word |= 1 << (block % 32);
        } else {
            *word &= !(1 << (block % 32));
        }
    }

    /// Set or clear `[start, end)` at `order`, clipped to existing blocks.
    fn set_range(&mut self, order: u8, start: u32, end: u32, allocated: bool) {
        let end = end.min(self.n_blocks[order as usize]);
        for block in start..end {
            self.set(order, block, allocated);
        }
    }

    /// First free block at `order`, skipping full words.
    fn find_free(&self, order: u8) -> Option<u32> {
        let o = order as usize;
        if o >= ORDERS {
            return None;
        }
        self.maps[o]
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u32::MAX)
            .map(|(i, w)| {
                #[allow(clippy::cast_possible_truncation)]
                let base = i as u32 * 32;
                base + (!w).trailing_zeros()
            })
            .filter(|&block| block < self.n_blocks[o])
    }

    /// Mark a block, everything inside it, and everything containing it.
    fn mark_allocated(&mut self, order: u8, block: u32) {
        self.set(order, block, true);

        for lower in (0..order).rev() {
            let span = 1u32 << (order - lower);
            let Some(start) = block.checked_mul(span) else {
                break;
            };
            self.set_range(lower, start, start.saturating_add(span), true);
        }

        let mut index = block;
        for upper in order + 1..=BUDDY_MAX_ORDER {
            index >>= 1;
            if index >= self.n_blocks[upper as usize] || self.is_allocated(upper, index) {
                break;
            }
            self.set(upper, index, true);
        }
    }

    /// Clear a block and everything inside it, then merge with free buddies.
    fn free_block(&mut self, order: u8, block: u32) {
        self.set(order, block, false);
        for lower in (0..order).rev() {
            let span = 1u32 << (order - lower);
            let Some(start) = block.checked_mul(span) else {
                break;
            };
            self.set_range(lower, start, start.saturating_add(span), false);
        }

        let mut index = block;
        for o in order..BUDDY_MAX_ORDER {
            if self.is_allocated(o, index ^ 1) {
                break;
            }
            index >>= 1;
            if index >= self.n_blocks[o as usize + 1] {
                break;
            }
            self.set(o + 1, index, false);
            trace!("Coalesced order-{} block {index}", o + 1);
        }
    }

    fn free_frames(&self) -> u32 {
        let n = self.n_blocks[0];
        let used: u32 = self.maps[0].iter().map(|w| w.count_ones()).sum();
        let padding = (32 - n % 32) % 32;
        n - (used - padding)
    }

    fn bytes(&self) -> usize {
        self.maps.iter().map(|m| m.len() * 4).sum()
    }
}

/// Buddy allocator over the usable frames of a [`MemoryRanges`] table.
pub struct FrameAllocator {
    ranges: MemoryRanges,
    maps: SpinLock<BuddyMaps>,
    relax: fn(),
}

impl FrameAllocator {
    /// All frames start out free; reserve what is in use with
    /// [`restrict_range`](Self::restrict_range) before handing any out.
    #[must_use]
    pub fn new(ranges: MemoryRanges) -> Self {
        let maps = BuddyMaps::new(ranges.total_frames());
        info!(
            "Frame allocator: {} frames, {} bytes of bitmaps",
            ranges.total_frames(),
            maps.bytes()
        );
        Self {
            ranges,
            maps: SpinLock::new(maps),
            relax: core::hint::spin_loop,
        }
    }

    /// Call `relax` while waiting for the lock instead of spinning.
    #[must_use]
    pub fn with_relax(mut self, relax: fn()) -> Self {
        self.relax = relax;
        self
    }

    pub(crate) const fn set_relax(&mut self, relax: fn()) {
        self.relax = relax;
    }

    #[inline]
    #[must_use]
    pub const fn ranges(&self) -> &MemoryRanges {
        &self.ranges
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.ranges.total_frames()
    }

    #[must_use]
    pub fn free_frames(&self) -> u32 {
        self.maps.lock_yielding(self.relax).free_frames()
    }

    #[must_use]
    pub fn is_allocated(&self, block: u32, order: u8) -> bool {
        self.maps.lock_yielding(self.relax).is_allocated(order, block)
    }

    /// Whether the allocator lock is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.maps.is_locked()
    }

    fn describe(&self, id: u32, block: u32, order: u8) -> Frame {
        Frame {
            id: Some(id),
            address: self
                .ranges
                .address_of(id)
                .unwrap_or_else(|| PhysicalAddress::new(0)),
            block,
            order,
        }
    }

    /// Take the first free block for `n` frames, give back the tail beyond `n`.
    fn allocate_run(
        &self,
        maps: &mut BuddyMaps,
        n: u32,
        out: &mut Vec<Frame>,
    ) -> Result<(), FrameAllocError> {
        let order = order_for(n);
        let block = maps.find_free(order).ok_or(FrameAllocError::Exhausted { order })?;
        maps.mark_allocated(order, block);

        let first = block << order;
        for id in first + n..first + (1 << order) {
            maps.free_block(0, id);
        }
        out.extend((first..first + n).map(|id| self.describe(id, block, order)));
        trace!("Allocated {n} frames as order-{order} block {block}");
        Ok(())
    }

    /// Allocate `n` physically contiguous frames.
    ///
    /// Requests above 256 frames are served as several 256-frame runs plus a
    /// remainder; the runs need not be adjacent.
    ///
    /// # Errors
    /// [`FrameAllocError::ZeroFrames`] for `n == 0`,
    /// [`FrameAllocError::Exhausted`] if no block is large enough. Nothing
    /// stays allocated on failure.
    pub fn allocate(&self, n: u32) -> Result<Vec<Frame>, FrameAllocError> {
        if n == 0 {
            return Err(FrameAllocError::ZeroFrames);
        }

        let mut maps = self.maps.lock_yielding(self.relax);
        let mut frames = Vec::with_capacity(n.min(maps.free_frames()) as usize);
        let mut remaining = n;
        while remaining > 0 {
            let run = remaining.min(MAX_BLOCK_FRAMES);
            if let Err(e) = self.allocate_run(&mut maps, run, &mut frames) {
                for id in frames.iter().filter_map(|f| f.id) {
                    maps.free_block(0, id);
                }
                drop(maps);
                error!("Cannot allocate {n} frames: {e}");
                return Err(e);
            }
            remaining -= run;
        }
        Ok(frames)
    }

    /// Allocate a single frame.
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] if every frame is taken.
    pub fn allocate_one(&self) -> Result<Frame, FrameAllocError> {
        let mut maps = self.maps.lock_yielding(self.relax);
        let block = maps
            .find_free(0)
            .ok_or(FrameAllocError::Exhausted { order: 0 })?;
        maps.mark_allocated(0, block);
        Ok(self.describe(block, block, 0))
    }

    /// Allocate exactly block `block` of order `order`.
    ///
    /// # Errors
    /// [`FrameAllocError::BlockOutOfRange`] or [`FrameAllocError::BlockAllocated`].
    pub fn allocate_specific(&self, block: u32, order: u8) -> Result<Vec<Frame>, FrameAllocError> {
        let mut maps = self.maps.lock_yielding(self.relax);
        if order > BUDDY_MAX_ORDER || block >= maps.n_blocks[order as usize] {
            return Err(FrameAllocError::BlockOutOfRange { block, order });
        }
        if maps.is_allocated(order, block) {
            return Err(FrameAllocError::BlockAllocated { block, order });
        }
        maps.mark_allocated(order, block);
        drop(maps);

        let first = block << order;
        Ok((first..first + (1 << order))
            .map(|id| self.describe(id, block, order))
            .collect())
    }

    /// Claim the `n` pages starting at the page containing `address`.
    ///
    /// Pages that are free RAM become allocated and carry an `id`. Pages
    /// outside RAM or already in use are described with `id: None` so the
    /// caller can still map them.
    ///
    /// # Errors
    /// [`FrameAllocError::ZeroFrames`] for `n == 0`,
    /// [`FrameAllocError::PastAddressSpace`] if the last page would lie
    /// beyond 4 GiB.
    pub fn allocate_at(&self, address: PhysicalAddress, n: u32) -> Result<Vec<Frame>, FrameAllocError> {
        if n == 0 {
            return Err(FrameAllocError::ZeroFrames);
        }

        let start = address.page();
        if start.checked_add_pages(n - 1).is_none() {
            return Err(FrameAllocError::PastAddressSpace { start: start.base(), n });
        }

        let mut maps = self.maps.lock_yielding(self.relax);
        let mut frames = Vec::with_capacity(n as usize);
        for page in (0..n).filter_map(|k| start.checked_add_pages(k)) {
            let owned = self
                .ranges
                .frame_of(page.base())
                .filter(|&id| !maps.is_allocated(0, id));
            if let Some(id) = owned {
                maps.mark_allocated(0, id);
            }
            frames.push(Frame {
                id: owned,
                address: page.base(),
                block: owned.unwrap_or(0),
                order: 0,
            });
        }
        Ok(frames)
    }

    /// Return frames to the allocator, merging buddies where possible.
    ///
    /// Frames without an `id` are skipped. Freeing a free frame is logged and
    /// ignored.
    pub fn deallocate(&self, frames: &[Frame]) {
        let mut maps = self.maps.lock_yielding(self.relax);
        for id in frames.iter().filter_map(|f| f.id) {
            Self::free_frame(&mut maps, id);
        }
    }

    /// Free the frame containing `address`. Returns whether it was allocated.
    pub fn free_address(&self, address: PhysicalAddress) -> bool {
        let Some(id) = self.ranges.frame_of(address) else {
            return false;
        };
        Self::free_frame(&mut self.maps.lock_yielding(self.relax), id)
    }

    fn free_frame(maps: &mut BuddyMaps, id: u32) -> bool {
        if !maps.is_allocated(0, id) || id >= maps.n_blocks[0] {
            warn!("Double free of frame {id}");
            return false;
        }
        maps.free_block(0, id);
        true
    }

    /// Reserve every frame overlapping `[start, end]` for good.
    ///
    /// Addresses outside RAM are ignored.
    pub fn restrict_range(&self, start: PhysicalAddress, end: PhysicalAddress) {
        let first = start.page().pfn();
        let last = end.page().pfn();
        let mut maps = self.maps.lock_yielding(self.relax);
        let mut reserved = 0u32;
        for pfn in first..=last {
            let Some(id) = self.ranges.frame_of(PhysicalPage::from_pfn(pfn).base()) else {
                continue;
            };
            if !maps.is_allocated(0, id) {
                maps.mark_allocated(0, id);
                reserved += 1;
            }
        }
        debug!("Reserved {reserved} frames in {start}..={end}");
    }

    /// Bytes used by the bitmaps.
    #[must_use]
    pub fn bitmap_bytes(&self) -> usize {
        self.maps.lock_yielding(self.relax).bytes()
    }
}

impl core::fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("total_frames", &self.total_frames())
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::{MEMORY_USABLE, MemoryMapEntry};

    fn allocator(frames: u64) -> FrameAllocator {
        FrameAllocator::new(MemoryRanges::from_entries([MemoryMapEntry::new(
            0x10_0000,
            frames * 4096,
            MEMORY_USABLE,
        )]))
    }

    #[test]
    fn order_rounds_up() {
        assert_eq!(order_for(1), 0);
        assert_eq!(order_for(2), 1);
        assert_eq!(order_for(3), 2);
        assert_eq!(order_for(256), 8);
    }

    #[test]
    fn partial_tail_word_is_never_free() {
        let maps = BuddyMaps::new(33);
        assert_eq!(maps.maps[0].len(), 2);
        assert_eq!(maps.maps[0][1], !1);
        assert_eq!(maps.free_frames(), 33);
        assert!(maps.is_allocated(0, 33));
        assert!(maps.is_allocated(6, 0));
    }

    #[test]
    fn allocate_returns_exact_count_and_frees_tail() {
        let frames = allocator(16);
        let run = frames.allocate(3).unwrap();
        assert_eq!(run.len(), 3);
        assert!(run.iter().all(|f| f.order == 2 && f.block == 0));
        assert_eq!(run[2].address, PhysicalAddress::new(0x10_2000));
        assert!(!frames.is_allocated(3, 0));
        assert_eq!(frames.free_frames(), 13);

        let next = frames.allocate_one().unwrap();
        assert_eq!(next.id, Some(3));
    }

    #[test]
    fn specific_block_marks_ancestors_and_descendants() {
        let frames = allocator(16);
        frames.allocate_specific(1, 2).unwrap();
        assert!(frames.is_allocated(1, 2));
        assert!(frames.is_allocated(2, 1) && frames.is_allocated(3, 1));
        assert!(frames.is_allocated(4, 0) && frames.is_allocated(7, 0));
        assert!(!frames.is_allocated(0, 2) && !frames.is_allocated(3, 0));
        assert!(frames.is_allocated(0, 3) && frames.is_allocated(0, 4));
        assert_eq!(
            frames.allocate_specific(1, 2),
            Err(FrameAllocError::BlockAllocated { block: 1, order: 2 })
        );
        assert_eq!(
            frames.allocate_specific(4, 2),
            Err(FrameAllocError::BlockOutOfRange { block: 4, order: 2 })
        );
    }

    #[test]
    fn freeing_both_children_frees_parent() {
        let frames = allocator(8);
        let a = frames.allocate(1).unwrap();
        let b = frames.allocate(1).unwrap();
        assert!(frames.is_allocated(0, 1));
        frames.deallocate(&a);
        assert!(frames.is_allocated(0, 1), "buddy still in use");
        frames.deallocate(&b);
        assert!(!frames.is_allocated(0, 1));
        assert!(!frames.is_allocated(0, 3));
        assert_eq!(frames.free_frames(), 8);
    }

    #[test]
    fn double_free_is_ignored() {
        let frames = allocator(4);
        let a = frames.allocate(1).unwrap();
        frames.deallocate(&a);
        frames.deallocate(&a);
        assert_eq!(frames.free_frames(), 4);
        assert!(!frames.free_address(PhysicalAddress::new(0x10_0000)));
    }

    #[test]
    fn oversized_request_spans_max_blocks() {
        let frames = allocator(1024);
        let run = frames.allocate(300).unwrap();
        assert_eq!(run.len(), 300);
        assert_eq!(run[0].order, 8);
        assert_eq!(run[299].order, 6);
        assert_eq!(frames.free_frames(), 1024 - 300);
    }

    #[test]
    fn oversized_failure_releases_partial_runs() {
        let frames = allocator(256);
        assert_eq!(
            frames.allocate(300),
            Err(FrameAllocError::Exhausted { order: 6 })
        );
        assert_eq!(frames.free_frames(), 256);
        assert!(!frames.is_allocated(0, 8));
    }

    #[test]
    fn allocate_at_claims_ram_and_describes_mmio() {
        let frames = allocator(4);
        let taken = frames.allocate_at(PhysicalAddress::new(0x10_2010), 3).unwrap();
        assert_eq!(taken[0].id, Some(2));
        assert_eq!(taken[1].id, Some(3));
        assert_eq!(taken[2].id, None);
        assert_eq!(taken[2].address, PhysicalAddress::new(0x10_4000));

        let again = frames.allocate_at(PhysicalAddress::new(0x10_2000), 1).unwrap();
        assert_eq!(again[0].id, None, "already owned elsewhere");
        assert_eq!(frames.allocate_at(PhysicalAddress::new(0), 0), Err(FrameAllocError::ZeroFrames));
    }

    #[test]
    fn impossible_request_fails_without_reserving() {
        let frames = allocator(16);
        assert_eq!(
            frames.allocate(u32::MAX),
            Err(FrameAllocError::Exhausted { order: 8 })
        );
        assert_eq!(frames.free_frames(), 16);
    }

    #[test]
    fn allocate_at_rejects_runs_past_4_gib() {
        let frames = allocator(4);
        let start = PhysicalAddress::new(0xFFFF_E000);
        assert_eq!(
            frames.allocate_at(start, 3),
            Err(FrameAllocError::PastAddressSpace { start, n: 3 })
        );
        assert_eq!(frames.allocate_at(start, 2).unwrap().len(), 2);
        assert_eq!(
            frames.allocate_at(PhysicalAddress::new(0x10_0000), u32::MAX),
            Err(FrameAllocError::PastAddressSpace {
                start: PhysicalAddress::new(0x10_0000),
                n: u32::MAX
            })
        );
        assert_eq!(frames.free_frames(), 4);
    }

    #[test]
    fn restrict_range_is_inclusive() {
        let frames = allocator(8);
        frames.restrict_range(PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x10_1000));
        assert!(frames.is_allocated(0, 0) && frames.is_allocated(1, 0));
        assert!(!frames.is_allocated(2, 0));
        assert_eq!(frames.allocate_one().unwrap().id, Some(2));
    }
}
