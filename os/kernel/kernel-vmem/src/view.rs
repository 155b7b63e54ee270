//! # Page-Table Views
//!
//! Two ways to reach a page table from kernel code, selected by whether the
//! owning directory is the one in CR3:
//!
//! - [`ActiveView`]: the loaded directory maps itself in slot 1023, so its
//!   directory is visible at `0xFFFF_F000` and its table `i` at
//!   `0xFFC0_0000 + i * 4096`. No extra mapping is needed.
//! - [`InactiveView`]: any other table is mapped into a scratch kernel page for
//!   the lifetime of the view and unmapped when it is dropped.

use crate::mmu::Mmu;
use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
use crate::{MapError, PagingContext};
use kernel_info::memory::{RECURSIVE_DIRECTORY, RECURSIVE_TABLES_BASE};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress};

/// The currently loaded directory and its tables, through the recursive window.
pub struct ActiveView<'m, M: Mmu> {
    mmu: &'m M,
}

impl<'m, M: Mmu> ActiveView<'m, M> {
    #[inline]
    pub const fn new(mmu: &'m M) -> Self {
        Self { mmu }
    }

    #[inline]
    pub fn directory_frame(&self) -> PhysicalPage {
        self.mmu.active_directory()
    }

    /// Where table `pd` of the active directory is visible.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_window(pd: PdIndex) -> VirtualAddress {
        VirtualAddress::new(RECURSIVE_TABLES_BASE + (pd.as_usize() as u32) * PAGE_SIZE)
    }

    #[inline]
    fn directory(&self) -> &mut PageDirectory {
        // Safety: slot 1023 of every directory we load points at itself.
        unsafe { self.mmu.virt_to_mut(VirtualAddress::new(RECURSIVE_DIRECTORY)) }
    }

    #[inline]
    fn table(&self, pd: PdIndex) -> &mut PageTable {
        debug_assert!(self.pde(pd).is_present(), "no table behind slot {pd:?}");
        // Safety: the directory entry is present, so the window page is mapped.
        unsafe { self.mmu.virt_to_mut(Self::table_window(pd)) }
    }

    #[inline]
    pub fn pde(&self, pd: PdIndex) -> PdEntry {
        self.directory().get(pd)
    }

    /// Replace a directory entry and flush the window page that showed the
    /// old table.
    #[inline]
    pub fn set_pde(&self, pd: PdIndex, entry: PdEntry) {
        self.directory().set(pd, entry);
        self.mmu.invalidate_page(Self::table_window(pd));
    }

    /// The entry for `va`, or `None` if its table does not exist.
    #[inline]
    pub fn pte(&self, va: VirtualAddress) -> Option<PtEntry> {
        let pd = PdIndex::from(va);
        if !self.pde(pd).is_present() {
            return None;
        }
        Some(self.table(pd).get(PtIndex::from(va)))
    }

    /// Write the entry for `va` and flush its TLB entry.
    ///
    /// The table for `va` must already be linked into the directory.
    #[inline]
    pub fn set_pte(&self, va: VirtualAddress, entry: PtEntry) {
        self.table(PdIndex::from(va)).set(PtIndex::from(va), entry);
        self.mmu.invalidate_page(va);
    }

    #[inline]
    pub fn zero_table(&self, pd: PdIndex) {
        self.table(pd).zero();
    }

    /// Run `f` on table `pd` in place.
    ///
    /// # Safety
    /// While `f` runs, nothing may reach table `pd` through another view of
    /// the active directory, this one included.
    #[inline]
    pub(crate) unsafe fn with_table<R>(&self, pd: PdIndex, f: impl FnOnce(&mut PageTable) -> R) -> R {
        f(self.table(pd))
    }
}

/// One physical frame mapped at a scratch kernel page until dropped.
pub struct ScratchMapping<'c, C: PagingContext> {
    ctx: &'c C,
    window: VirtualAddress,
}

impl<'c, C: PagingContext> ScratchMapping<'c, C> {
    /// # Errors
    /// Fails if no scratch page or no frame for its page table is available.
    pub fn map(ctx: &'c C, frame: PhysicalPage) -> Result<Self, MapError> {
        let window = ctx.map_window(frame)?;
        Ok(Self { ctx, window })
    }

    #[inline]
    pub const fn window(&self) -> VirtualAddress {
        self.window
    }

    /// View the frame as a `T`.
    ///
    /// # Safety
    /// The frame must actually hold a `T`; `T` must fit in one page.
    #[inline]
    pub unsafe fn as_mut<T>(&mut self) -> &mut T {
        const { assert!(size_of::<T>() <= PAGE_SIZE as usize) };
        unsafe { self.ctx.mmu().virt_to_mut(self.window) }
    }

    #[inline]
    pub fn bytes(&mut self) -> &mut [u8; PAGE_SIZE as usize] {
        // Safety: any bit pattern is a valid byte array.
        unsafe { self.as_mut() }
    }
}

impl<C: PagingContext> Drop for ScratchMapping<'_, C> {
    fn drop(&mut self) {
        self.ctx.unmap_window(self.window);
    }
}

/// A page table of a directory that is not loaded, mapped for editing.
pub struct InactiveView<'c, C: PagingContext> {
    mapping: ScratchMapping<'c, C>,
}

impl<'c, C: PagingContext> InactiveView<'c, C> {
    /// # Errors
    /// Fails if the table frame cannot be mapped into kernel space.
    #[inline]
    pub fn map(ctx: &'c C, table: PhysicalPage) -> Result<Self, MapError> {
        Ok(Self {
            mapping: ScratchMapping::map(ctx, table)?,
        })
    }

    #[inline]
    pub fn table(&mut self) -> &mut PageTable {
        // Safety: the caller handed us the frame of a page table.
        unsafe { self.mapping.as_mut() }
    }
}

/// Fill a physical frame with zeros through a scratch mapping.
///
/// # Errors
/// Fails if the frame cannot be mapped into kernel space.
pub fn zero_frame<C: PagingContext>(ctx: &C, frame: PhysicalPage) -> Result<(), MapError> {
    ScratchMapping::map(ctx, frame)?.bytes().fill(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PageEntryBits;
    use crate::tests::TestContext;

    #[test]
    fn table_edits_show_through_the_window() {
        let ctx = TestContext::new();
        let active = ActiveView::new(ctx.mmu());
        let va = VirtualAddress::new(0x0804_8000);
        let pd = PdIndex::from(va);
        let pt = PtIndex::from(va);

        active.set_pde(pd, PdEntry::new(PhysicalPage::from_pfn(0x40), PageEntryBits::user_rw()));
        active.zero_table(pd);
        assert_eq!(active.pte(va), Some(PtEntry::zero()));

        let entry = PtEntry::new(PhysicalPage::from_pfn(0x41), PageEntryBits::user_rw());
        // Safety: the closure only touches the table it is given.
        let previous = unsafe {
            active.with_table(pd, |table| {
                let old = table.get(pt);
                table.set(pt, entry);
                old
            })
        };
        assert!(!previous.is_present());
        assert_eq!(active.pte(va), Some(entry));
    }
}
