//! # Per-Process Address Space
//!
//! An [`AddressSpace`] owns one page directory and the page tables for the
//! user part of the address range (`0..0xC000_0000`). The kernel part is
//! shared through [`KernelPageTables`](crate::KernelPageTables) and is never
//! edited here.
//!
//! ## Highlights
//!
//! - [`AddressSpace::map`] installs one 4 KiB mapping, creating the page table
//!   on demand. Remapping a present page to something else is refused.
//! - [`AddressSpace::unmap`] clears one mapping, returns its frame, and frees
//!   the page table once its last entry is gone.
//! - [`AddressSpace::get`] looks up an entry without side effects.
//! - [`AddressSpace::destroy`] returns every frame the address space still
//!   references.
//!
//! ## Paths
//!
//! If the address space is the one in CR3, its tables are edited in place
//! through the recursive window ([`ActiveView`]). Otherwise each edit maps the
//! table at a scratch kernel page ([`InactiveView`]) and unmaps it afterwards.
//! The directory itself is always reached through a kernel alias created when
//! the address space is built.

use crate::mmu::Mmu;
use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
use crate::view::{ActiveView, InactiveView, zero_frame};
use crate::{MapError, PageEntryBits, PagingContext};
use alloc::boxed::Box;
use alloc::vec;
use kernel_info::memory::{KERNEL_BASE, KERNEL_PDE_START};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use log::{debug, error, trace, warn};

/// A page table owned by an address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TableDescriptor {
    pub frame: PhysicalPage,
    /// Present entries in the table.
    pub live: u16,
}

/// The page directory and user page tables of one process.
///
/// Must be torn down with [`destroy`](Self::destroy); dropping it leaks its
/// frames.
pub struct AddressSpace {
    owner: u32,
    directory: PhysicalPage,
    directory_window: VirtualAddress,
    tables: Box<[Option<TableDescriptor>]>,
}

/// The user directory slot covering `va`.
fn user_slot(va: VirtualAddress) -> Result<PdIndex, MapError> {
    if va.as_u32() >= KERNEL_BASE {
        warn!("Refusing to touch kernel address {va} through a process address space");
        return Err(MapError::KernelAddress);
    }
    Ok(PdIndex::from(va))
}

impl AddressSpace {
    /// Build an empty address space for process `owner`.
    ///
    /// The directory starts with every kernel table known so far and with
    /// slot 1023 pointing back at itself.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] or a failure to map the directory alias.
    pub fn new<C: PagingContext>(ctx: &C, owner: u32) -> Result<Self, MapError> {
        let directory = ctx.alloc_frame().ok_or(MapError::OutOfFrames)?;
        let directory_window = match ctx.map_window(directory) {
            Ok(window) => window,
            Err(e) => {
                ctx.free_frame(directory);
                return Err(e);
            }
        };

        let space = Self {
            owner,
            directory,
            directory_window,
            tables: vec![None; KERNEL_PDE_START].into_boxed_slice(),
        };

        let dir = space.directory(ctx);
        dir.zero();
        ctx.copy_kernel_entries(dir);
        dir.set_recursive(directory);

        debug!("Created address space for {owner}: directory {directory} at {directory_window}");
        Ok(space)
    }

    #[inline]
    #[must_use]
    pub const fn owner(&self) -> u32 {
        self.owner
    }

    #[inline]
    #[must_use]
    pub const fn directory_frame(&self) -> PhysicalPage {
        self.directory
    }

    /// Number of user page tables currently allocated.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.iter().flatten().count()
    }

    /// Whether this directory is loaded in CR3.
    #[inline]
    pub fn is_active<C: PagingContext>(&self, ctx: &C) -> bool {
        ctx.mmu().active_directory() == self.directory
    }

    /// Load this directory into CR3.
    ///
    /// Kernel tables created since the directory was built are copied in first.
    ///
    /// # Safety
    /// The currently executing kernel code and stack must stay mapped, which
    /// holds as long as they live above the kernel split.
    pub unsafe fn activate<C: PagingContext>(&self, ctx: &C) {
        ctx.copy_kernel_entries(self.directory(ctx));
        unsafe { ctx.mmu().load_directory(self.directory) };
        trace!("Activated address space {}", self.owner);
    }

    fn directory<'c, C: PagingContext>(&self, ctx: &'c C) -> &'c mut PageDirectory {
        ctx.sync_kernel_slot(self.directory_window);
        // Safety: the alias maps our directory frame for as long as we live.
        unsafe { ctx.mmu().virt_to_mut(self.directory_window) }
    }

    fn set_pde<C: PagingContext>(&self, ctx: &C, pd: PdIndex, entry: PdEntry) {
        if self.is_active(ctx) {
            ActiveView::new(ctx.mmu()).set_pde(pd, entry);
        } else {
            self.directory(ctx).set(pd, entry);
        }
    }

    /// Run `f` on the table behind slot `pd`, in place or through a scratch page.
    fn with_table<C: PagingContext, R>(
        &self,
        ctx: &C,
        pd: PdIndex,
        table: PhysicalPage,
        f: impl FnOnce(&mut PageTable) -> R,
    ) -> Result<R, MapError> {
        if self.is_active(ctx) {
            // Safety: every caller's `f` works on the table it is handed only.
            return Ok(unsafe { ActiveView::new(ctx.mmu()).with_table(pd, f) });
        }
        let mut view = InactiveView::map(ctx, table)?;
        Ok(f(view.table()))
    }

    /// Find or create the page table for slot `pd`.
    fn ensure_table<C: PagingContext>(
        &mut self,
        ctx: &C,
        pd: PdIndex,
    ) -> Result<PhysicalPage, MapError> {
        if let Some(desc) = self.tables[pd.as_usize()] {
            return Ok(desc.frame);
        }

        if let Some(orphan) = self.directory(ctx).get(pd).next_table() {
            warn!(
                "Address space {}: slot {pd:?} points at untracked table {orphan}; clearing it",
                self.owner
            );
            self.set_pde(ctx, pd, PdEntry::zero());
        }

        let frame = ctx.alloc_frame().ok_or(MapError::OutOfFrames)?;
        let entry = PdEntry::new(frame, PageEntryBits::user_rw());
        if self.is_active(ctx) {
            let active = ActiveView::new(ctx.mmu());
            active.set_pde(pd, entry);
            active.zero_table(pd);
        } else {
            if let Err(e) = zero_frame(ctx, frame) {
                ctx.free_frame(frame);
                return Err(e);
            }
            self.directory(ctx).set(pd, entry);
        }

        self.tables[pd.as_usize()] = Some(TableDescriptor { frame, live: 0 });
        debug!("Address space {}: new page table {pd:?} at {frame}", self.owner);
        Ok(frame)
    }

    /// Map the page containing `va` to `frame`.
    ///
    /// Mapping the same frame with the same permissions again succeeds.
    ///
    /// # Errors
    /// - [`MapError::KernelAddress`] for `va` at or above the kernel split.
    /// - [`MapError::AlreadyMapped`] if the page maps something else.
    /// - [`MapError::OutOfFrames`] if a new page table was needed.
    pub fn map<C: PagingContext>(
        &mut self,
        ctx: &C,
        va: VirtualAddress,
        frame: PhysicalPage,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        let pd = user_slot(va)?;
        let table = self.ensure_table(ctx, pd)?;
        let pt = PtIndex::from(va);
        let entry = PtEntry::new(frame, flags);

        let written = self.with_table(ctx, pd, table, |t| {
            let existing = t.get(pt);
            if !existing.is_present() {
                t.set(pt, entry);
                Ok(true)
            } else if existing.same_mapping(entry) {
                Ok(false)
            } else {
                Err(MapError::AlreadyMapped {
                    va,
                    existing: existing.frame().base(),
                })
            }
        })?;

        match written {
            Ok(true) => {
                if let Some(desc) = self.tables[pd.as_usize()].as_mut() {
                    desc.live += 1;
                }
                if self.is_active(ctx) {
                    ctx.mmu().invalidate_page(va);
                }
                trace!("Address space {}: map {va} -> {frame}", self.owner);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                warn!("Address space {}: {e}", self.owner);
                Err(e)
            }
        }
    }

    /// Allocate a zeroed frame and map it at `va`.
    ///
    /// # Errors
    /// As [`map`](Self::map). The frame is returned to the allocator on failure.
    pub fn map_new<C: PagingContext>(
        &mut self,
        ctx: &C,
        va: VirtualAddress,
        flags: PageEntryBits,
    ) -> Result<PhysicalPage, MapError> {
        let frame = ctx.alloc_frame().ok_or(MapError::OutOfFrames)?;
        let mapped = zero_frame(ctx, frame).and_then(|()| self.map(ctx, va, frame, flags));
        if let Err(e) = mapped {
            ctx.free_frame(frame);
            return Err(e);
        }
        Ok(frame)
    }

    /// Remove the mapping for `va` and free its frame.
    ///
    /// Returns the entry that was removed, or `None` if nothing was mapped.
    /// The page table itself is freed together with its last mapping.
    ///
    /// # Errors
    /// [`MapError::KernelAddress`] for `va` at or above the kernel split, or a
    /// failure to map an inactive table.
    pub fn unmap<C: PagingContext>(
        &mut self,
        ctx: &C,
        va: VirtualAddress,
    ) -> Result<Option<PtEntry>, MapError> {
        let pd = user_slot(va)?;
        let Some(desc) = self.tables[pd.as_usize()] else {
            return Ok(None);
        };
        let pt = PtIndex::from(va);

        let removed = self.with_table(ctx, pd, desc.frame, |t| {
            let existing = t.get(pt);
            if existing.is_present() {
                t.set(pt, PtEntry::zero());
            }
            existing
        })?;
        if !removed.is_present() {
            return Ok(None);
        }

        if self.is_active(ctx) {
            ctx.mmu().invalidate_page(va);
        }
        ctx.free_frame(removed.frame());
        trace!("Address space {}: unmap {va} (was {})", self.owner, removed.frame());

        let live = desc.live.saturating_sub(1);
        if live == 0 {
            self.set_pde(ctx, pd, PdEntry::zero());
            ctx.free_frame(desc.frame);
            self.tables[pd.as_usize()] = None;
            debug!("Address space {}: released page table {pd:?}", self.owner);
        } else {
            self.tables[pd.as_usize()] = Some(TableDescriptor { live, ..desc });
        }
        Ok(Some(removed))
    }

    /// The entry mapping `va`, or `None` if it is not mapped here.
    pub fn get<C: PagingContext>(&self, ctx: &C, va: VirtualAddress) -> Option<PtEntry> {
        let pd = user_slot(va).ok()?;
        let desc = self.tables[pd.as_usize()]?;
        match self.with_table(ctx, pd, desc.frame, |t| t.get(PtIndex::from(va))) {
            Ok(entry) => Some(entry).filter(|e| e.is_present()),
            Err(e) => {
                error!("Address space {}: cannot inspect {va}: {e}", self.owner);
                None
            }
        }
    }

    /// The physical address `va` maps to.
    pub fn translate<C: PagingContext>(&self, ctx: &C, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.get(ctx, va).map(|e| e.frame().join(va.page_offset()))
    }

    /// Free every mapped frame, every page table, and the directory.
    ///
    /// # Errors
    /// Hands the address space back unchanged if it is currently loaded.
    pub fn destroy<C: PagingContext>(self, ctx: &C) -> Result<(), Self> {
        if self.is_active(ctx) {
            warn!("Refusing to destroy active address space {}", self.owner);
            return Err(self);
        }

        for (pd, desc) in self.tables.iter().enumerate() {
            let Some(desc) = desc else { continue };
            match InactiveView::map(ctx, desc.frame) {
                Ok(mut view) => {
                    for (_, entry) in view.table().present_entries() {
                        ctx.free_frame(entry.frame());
                    }
                }
                Err(e) => error!(
                    "Address space {}: leaking frames of table {pd}: {e}",
                    self.owner
                ),
            }
            ctx.free_frame(desc.frame);
        }

        ctx.unmap_window(self.directory_window);
        ctx.free_frame(self.directory);
        debug!("Destroyed address space {}", self.owner);
        Ok(())
    }
}
