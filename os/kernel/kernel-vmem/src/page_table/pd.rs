//! # x86 Page Directory (PD)
//!
//! - [`PdIndex`]: index type for virtual-address bits `[31:22]`.
//! - [`PdEntry`]: a page directory entry (PDE) pointing at a [`PageTable`](super::pt::PageTable).
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 PDEs, the root loaded into CR3.
//!
//! ## Layout
//!
//! Slots `0..768` cover user space and are private to each directory. Slots
//! `768..1023` cover kernel space and are copies of one shared set of tables.
//! Slot `1023` points back at the directory itself.

use crate::PageEntryBits;
use kernel_info::memory::{KERNEL_PDE_START, RECURSIVE_PDE};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PdIndex(u16);

/// A single Page Directory entry (PDE).
///
/// `PS` is always 0: every present entry points at a 4 KiB page table.
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; 1024],
}

impl PdIndex {
    /// The self-referencing slot.
    pub const RECURSIVE: Self = Self(RECURSIVE_PDE as u16);

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self(va.pd_index() as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 1024);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Whether this slot lies in the shared kernel region.
    #[inline]
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.as_usize() >= KERNEL_PDE_START
    }
}

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    /// Point at the page table in `table`; forces `P=1` and `PS=0`.
    #[inline]
    #[must_use]
    pub const fn new(table: PhysicalPage, flags: PageEntryBits) -> Self {
        Self(
            flags
                .with_present(true)
                .with_large_page(false)
                .with_frame(table),
        )
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present, the frame of the page table this entry points at.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage> {
        if self.is_present() {
            Some(self.0.frame())
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); 1024],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: PdIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Caller must invalidate the recursive-window page of slot `i` when this
    /// directory is active.
    #[inline]
    pub const fn set(&mut self, i: PdIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Install the self-reference in slot 1023.
    #[inline]
    pub const fn set_recursive(&mut self, own_frame: PhysicalPage) {
        self.set(
            PdIndex::RECURSIVE,
            PdEntry::new(own_frame, PageEntryBits::kernel_rw()),
        );
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> PdIndex {
        PdIndex::from(va)
    }
}
