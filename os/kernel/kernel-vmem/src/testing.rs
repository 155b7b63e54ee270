//! # Software Paging Unit
//!
//! [`SimMachine`] stands in for the CPU in host tests. It owns a small
//! physical memory, keeps a CR3 value, and resolves every virtual access by
//! walking the loaded directory exactly like the hardware would, including
//! through the self-referencing slot. That makes both the recursive window and
//! the scratch-window path observable without real paging.

#![allow(clippy::cast_possible_truncation)]

use crate::mmu::Mmu;
use crate::page_table::pd::PageDirectory;
use alloc::boxed::Box;
use core::cell::{Cell, UnsafeCell};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress};

#[repr(C, align(4096))]
struct Frame4K([u8; PAGE_SIZE as usize]);

/// A simulated machine with `frames` pages of RAM starting at physical 0.
pub struct SimMachine {
    ram: Box<[UnsafeCell<Frame4K>]>,
    cr3: Cell<u32>,
    invalidations: Cell<usize>,
}

impl SimMachine {
    #[must_use]
    pub fn new(frames: usize) -> Self {
        Self {
            ram: (0..frames)
                .map(|_| UnsafeCell::new(Frame4K([0; PAGE_SIZE as usize])))
                .collect(),
            cr3: Cell::new(0),
            invalidations: Cell::new(0),
        }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.ram.len()
    }

    pub fn set_cr3(&self, directory: PhysicalPage) {
        self.cr3.set(directory.base().as_u32());
    }

    /// Zero `frame`, make it a directory that maps only itself, and load it.
    pub fn boot_directory(&self, frame: PhysicalPage) {
        // Safety: test code owns the simulated RAM.
        let directory: &mut PageDirectory = unsafe { self.phys_to_mut(frame.base()) };
        directory.zero();
        directory.set_recursive(frame);
        self.set_cr3(frame);
    }

    /// Number of single-page TLB invalidations issued so far.
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations.get()
    }

    /// # Safety
    /// Same rules as [`Mmu::virt_to_mut`], applied to physical memory.
    ///
    /// # Panics
    /// If `pa` lies outside the simulated RAM.
    pub unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let frame = pa.page().pfn() as usize;
        assert!(frame < self.ram.len(), "physical access beyond RAM at {pa}");
        assert!(
            pa.page_offset() as usize + size_of::<T>() <= PAGE_SIZE as usize,
            "access at {pa} crosses a page boundary"
        );
        let base = self.ram[frame].get().cast::<u8>();
        unsafe { &mut *base.add(pa.page_offset() as usize).cast::<T>() }
    }

    #[must_use]
    pub fn read_phys_u32(&self, pa: PhysicalAddress) -> u32 {
        let frame = pa.page().pfn() as usize;
        let base = self.ram[frame].get().cast::<u8>();
        unsafe { base.add(pa.page_offset() as usize).cast::<u32>().read_unaligned() }
    }

    pub fn write_phys_u32(&self, pa: PhysicalAddress, value: u32) {
        let frame = pa.page().pfn() as usize;
        let base = self.ram[frame].get().cast::<u8>();
        unsafe {
            base.add(pa.page_offset() as usize)
                .cast::<u32>()
                .write_unaligned(value);
        }
    }

    /// Walk the loaded directory for `va`.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let pde_at = PhysicalAddress::new(self.cr3.get() + (va.pd_index() as u32) * 4);
        let pde = self.read_phys_u32(pde_at);
        if pde & 1 == 0 {
            return None;
        }
        let pte_at = PhysicalAddress::new((pde & !0xFFF) + (va.pt_index() as u32) * 4);
        let pte = self.read_phys_u32(pte_at);
        if pte & 1 == 0 {
            return None;
        }
        Some(PhysicalAddress::new((pte & !0xFFF) | va.page_offset()))
    }

    /// # Panics
    /// If `va` is not mapped.
    #[must_use]
    pub fn read_virt_u32(&self, va: VirtualAddress) -> u32 {
        let pa = self
            .translate(va)
            .unwrap_or_else(|| panic!("simulated page fault at {va}"));
        self.read_phys_u32(pa)
    }

    /// # Panics
    /// If `va` is not mapped.
    pub fn write_virt_u32(&self, va: VirtualAddress, value: u32) {
        let pa = self
            .translate(va)
            .unwrap_or_else(|| panic!("simulated page fault at {va}"));
        self.write_phys_u32(pa, value);
    }
}

impl Mmu for SimMachine {
    fn active_directory(&self) -> PhysicalPage {
        PhysicalAddress::new(self.cr3.get()).page()
    }

    unsafe fn load_directory(&self, directory: PhysicalPage) {
        self.set_cr3(directory);
    }

    fn invalidate_page(&self, _va: VirtualAddress) {
        self.invalidations.set(self.invalidations.get() + 1);
    }

    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        let pa = self
            .translate(va)
            .unwrap_or_else(|| panic!("simulated page fault at {va}"));
        unsafe { self.phys_to_mut(pa) }
    }
}
