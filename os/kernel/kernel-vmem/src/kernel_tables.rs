//! # Shared Kernel Page Tables
//!
//! Every address space maps the top gigabyte (`0xC000_0000..0xFFC0_0000`)
//! through the same physical page tables. [`KernelPageTables`] remembers the
//! directory entry for each of those slots. A directory that lacks one gets it
//! copied in on first use, so kernel mappings made while one address space was
//! active are visible from all others without being duplicated.
//!
//! Slot 1023 is the recursive window and is never stored here.

use crate::mmu::Mmu;
use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
use crate::page_table::pt::PtEntry;
use crate::view::ActiveView;
use crate::{MapError, PageEntryBits};
use kernel_info::memory::{KERNEL_BASE, KERNEL_PDE_COUNT, KERNEL_PDE_START, RECURSIVE_PDE};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use log::{debug, trace};

/// Directory entries for PDE slots 768..1023, shared by all address spaces.
pub struct KernelPageTables {
    slots: [PdEntry; KERNEL_PDE_COUNT],
}

/// The kernel directory slot covering `va`.
///
/// # Errors
/// - [`MapError::UserAddress`] below the kernel split.
/// - [`MapError::RecursiveWindow`] inside the self-mapping window.
pub const fn kernel_slot(va: VirtualAddress) -> Result<PdIndex, MapError> {
    if va.as_u32() < KERNEL_BASE {
        return Err(MapError::UserAddress);
    }
    if va.pd_index() == RECURSIVE_PDE {
        return Err(MapError::RecursiveWindow);
    }
    Ok(PdIndex::from(va))
}

impl KernelPageTables {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [PdEntry::zero(); KERNEL_PDE_COUNT],
        }
    }

    /// Record the kernel tables the boot directory already has.
    #[allow(clippy::cast_possible_truncation)]
    pub fn capture<M: Mmu>(active: &ActiveView<'_, M>) -> Self {
        let mut tables = Self::new();
        for pd in KERNEL_PDE_START..RECURSIVE_PDE {
            let entry = active.pde(PdIndex::new(pd as u16));
            if entry.is_present() {
                tables.slots[pd - KERNEL_PDE_START] = entry;
            }
        }
        debug!("Captured {} boot kernel page tables", tables.len());
        tables
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self, pd: PdIndex) -> PdEntry {
        self.slots[pd.as_usize() - KERNEL_PDE_START]
    }

    /// Number of kernel slots that have a table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|e| e.is_present()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy every known kernel table into a directory.
    #[allow(clippy::cast_possible_truncation)]
    pub fn copy_into(&self, directory: &mut PageDirectory) {
        for (i, entry) in self.slots.iter().enumerate() {
            if entry.is_present() && i + KERNEL_PDE_START != RECURSIVE_PDE {
                directory.set(PdIndex::new((i + KERNEL_PDE_START) as u16), *entry);
            }
        }
    }

    /// Make the active directory carry the shared table for `pd`, if one exists.
    ///
    /// Returns whether slot `pd` has a table afterwards.
    pub fn load<M: Mmu>(&self, active: &ActiveView<'_, M>, pd: PdIndex) -> bool {
        if active.pde(pd).is_present() {
            return true;
        }
        let global = self.entry(pd);
        if !global.is_present() {
            return false;
        }
        active.set_pde(pd, global);
        trace!("Loaded kernel table {pd:?} into {}", active.directory_frame());
        true
    }

    /// Make sure slot `pd` has a table in the active directory and here.
    ///
    /// A table found only in the active directory is adopted. A table found
    /// only here is copied into the active directory. Otherwise a new one is
    /// allocated with `alloc`, linked into both and zeroed.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if `alloc` yields nothing.
    pub fn ensure_table<M: Mmu>(
        &mut self,
        active: &ActiveView<'_, M>,
        pd: PdIndex,
        alloc: impl FnOnce() -> Option<PhysicalPage>,
    ) -> Result<(), MapError> {
        let slot = pd.as_usize() - KERNEL_PDE_START;
        let current = active.pde(pd);
        if current.is_present() {
            if !self.slots[slot].is_present() {
                self.slots[slot] = current;
            }
            return Ok(());
        }
        if self.load(active, pd) {
            return Ok(());
        }

        let frame = alloc().ok_or(MapError::OutOfFrames)?;
        let entry = PdEntry::new(frame, PageEntryBits::kernel_rw());
        self.slots[slot] = entry;
        active.set_pde(pd, entry);
        active.zero_table(pd);
        debug!("Created kernel page table {pd:?} at {frame}");
        Ok(())
    }

    /// Write a kernel page table entry, creating its table if needed.
    ///
    /// Writing the mapping that is already there succeeds without change.
    ///
    /// # Errors
    /// - [`MapError::UserAddress`] / [`MapError::RecursiveWindow`] for `va`
    ///   outside the kernel range.
    /// - [`MapError::AlreadyMapped`] if `va` maps something else.
    /// - [`MapError::OutOfFrames`] if a new table was needed and `alloc` failed.
    pub fn set<M: Mmu>(
        &mut self,
        active: &ActiveView<'_, M>,
        va: VirtualAddress,
        entry: PtEntry,
        alloc: impl FnOnce() -> Option<PhysicalPage>,
    ) -> Result<(), MapError> {
        let pd = kernel_slot(va)?;
        self.ensure_table(active, pd, alloc)?;

        let existing = active.pte(va).unwrap_or_default();
        if existing.is_present() {
            if existing.same_mapping(entry) {
                return Ok(());
            }
            return Err(MapError::AlreadyMapped {
                va,
                existing: existing.frame().base(),
            });
        }

        active.set_pte(va, entry);
        trace!("Kernel map {va} -> {}", entry.frame());
        Ok(())
    }

    /// Clear a kernel page table entry and return what it held.
    ///
    /// # Errors
    /// [`MapError::UserAddress`] / [`MapError::RecursiveWindow`] for `va`
    /// outside the kernel range.
    pub fn unset<M: Mmu>(
        &self,
        active: &ActiveView<'_, M>,
        va: VirtualAddress,
    ) -> Result<Option<PtEntry>, MapError> {
        let pd = kernel_slot(va)?;
        if !self.load(active, pd) {
            return Ok(None);
        }
        let Some(existing) = active.pte(va).filter(|e| e.is_present()) else {
            return Ok(None);
        };
        active.set_pte(va, PtEntry::zero());
        trace!("Kernel unmap {va} (was {})", existing.frame());
        Ok(Some(existing))
    }

    /// Look up a kernel page table entry.
    ///
    /// # Errors
    /// [`MapError::UserAddress`] / [`MapError::RecursiveWindow`] for `va`
    /// outside the kernel range.
    pub fn get<M: Mmu>(
        &self,
        active: &ActiveView<'_, M>,
        va: VirtualAddress,
    ) -> Result<Option<PtEntry>, MapError> {
        let pd = kernel_slot(va)?;
        if !self.load(active, pd) {
            return Ok(None);
        }
        Ok(active.pte(va).filter(|e| e.is_present()))
    }
}

impl Default for KernelPageTables {
    fn default() -> Self {
        Self::new()
    }
}
