//! # Virtual Memory Support
//!
//! 32-bit x86 paging for the kernel: typed directory and table entries, the
//! recursive self-mapping, the shared kernel page tables, and per-process
//! address spaces.
//!
//! ## What you get
//! - [`PageEntryBits`]: the raw 32-bit entry as a bitfield.
//! - [`PageDirectory`]/[`PageTable`] with typed [`PdIndex`]/[`PtIndex`].
//! - The [`Mmu`] trait, the seam to CR3, `invlpg` and virtual memory access.
//! - [`ActiveView`] and [`InactiveView`] to edit loaded and non-loaded tables.
//! - [`KernelPageTables`], the kernel half shared by every address space.
//! - [`AddressSpace`], the user half owned by one process.
//!
//! ## x86 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  CR3 → PD ──► PDE → PT ──► PTE → 4 KiB page
//! ```
//!
//! Each level holds 1024 entries of 4 bytes.
//!
//! ## Recursive mapping
//!
//! Slot 1023 of every directory points at the directory itself. While a
//! directory is loaded, the CPU therefore shows:
//!
//! ```text
//! 0xFFC0_0000 + i * 0x1000   page table i
//! 0xFFFF_F000                the directory
//! ```
//!
//! No physical-memory window is needed to edit the active address space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
pub mod kernel_tables;
pub mod mmu;
mod page_entry_bits;
pub mod page_table;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod view;

pub use crate::address_space::AddressSpace;
pub use crate::kernel_tables::KernelPageTables;
pub use crate::mmu::Mmu;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
pub use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
pub use crate::view::{ActiveView, InactiveView, ScratchMapping, zero_frame};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

#[cfg(target_arch = "x86")]
pub use crate::mmu::X86Mmu;

/// Why a mapping could not be changed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("kernel address passed to a process address space")]
    KernelAddress,
    #[error("user address passed to the kernel page tables")]
    UserAddress,
    #[error("address lies in the recursive page-table window")]
    RecursiveWindow,
    #[error("{va} is already mapped to {existing}")]
    AlreadyMapped {
        va: VirtualAddress,
        existing: PhysicalAddress,
    },
    #[error("no physical frames left")]
    OutOfFrames,
    #[error("no kernel virtual address space left")]
    OutOfVirtualSpace,
}

/// What an address space needs from the rest of the memory manager.
///
/// Implemented by the kernel's memory manager; tests use a small stand-in.
pub trait PagingContext {
    type Mmu: Mmu;

    fn mmu(&self) -> &Self::Mmu;

    /// One free physical frame, contents unspecified.
    fn alloc_frame(&self) -> Option<PhysicalPage>;

    fn free_frame(&self, frame: PhysicalPage);

    /// Map `frame` at a free kernel page and return that page.
    ///
    /// # Errors
    /// [`MapError::OutOfVirtualSpace`] or [`MapError::OutOfFrames`].
    fn map_window(&self, frame: PhysicalPage) -> Result<VirtualAddress, MapError>;

    /// Undo [`map_window`](Self::map_window). The frame is not freed.
    fn unmap_window(&self, window: VirtualAddress);

    /// Write every known kernel directory entry into `directory`.
    fn copy_kernel_entries(&self, directory: &mut PageDirectory);

    /// Make sure the active directory has the kernel table covering `va`.
    fn sync_kernel_slot(&self, va: VirtualAddress);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::SimMachine;
    use core::cell::{Cell, RefCell};
    use kernel_info::memory::KERNEL_VMEM_BASE;
    use kernel_memory_addresses::PAGE_SIZE;

    /// A machine with 2 MiB of RAM, a bump frame allocator and a bump window
    /// allocator in kernel space.
    pub struct TestContext {
        pub machine: SimMachine,
        next_frame: Cell<u32>,
        freed: RefCell<Vec<PhysicalPage>>,
        kernel: RefCell<KernelPageTables>,
        next_window: Cell<u32>,
        free_windows: RefCell<Vec<VirtualAddress>>,
        windows_mapped: Cell<usize>,
    }

    impl TestContext {
        pub fn new() -> Self {
            let machine = SimMachine::new(512);
            machine.boot_directory(PhysicalPage::from_pfn(1));
            Self {
                machine,
                next_frame: Cell::new(2),
                freed: RefCell::new(Vec::new()),
                kernel: RefCell::new(KernelPageTables::new()),
                next_window: Cell::new(KERNEL_VMEM_BASE),
                free_windows: RefCell::new(Vec::new()),
                windows_mapped: Cell::new(0),
            }
        }

        pub fn was_freed(&self, frame: PhysicalPage) -> bool {
            self.freed.borrow().contains(&frame)
        }

        pub fn windows_in_use(&self) -> usize {
            self.windows_mapped.get()
        }
    }

    impl PagingContext for TestContext {
        type Mmu = SimMachine;

        fn mmu(&self) -> &SimMachine {
            &self.machine
        }

        fn alloc_frame(&self) -> Option<PhysicalPage> {
            let pfn = self.next_frame.get();
            if pfn as usize >= self.machine.frame_count() {
                return None;
            }
            self.next_frame.set(pfn + 1);
            Some(PhysicalPage::from_pfn(pfn))
        }

        fn free_frame(&self, frame: PhysicalPage) {
            self.freed.borrow_mut().push(frame);
        }

        fn map_window(&self, frame: PhysicalPage) -> Result<VirtualAddress, MapError> {
            let window = self.free_windows.borrow_mut().pop().unwrap_or_else(|| {
                let va = self.next_window.get();
                self.next_window.set(va + PAGE_SIZE);
                VirtualAddress::new(va)
            });
            let entry = PtEntry::new(frame, PageEntryBits::kernel_rw());
            self.kernel.borrow_mut().set(
                &ActiveView::new(&self.machine),
                window,
                entry,
                || self.alloc_frame(),
            )?;
            self.windows_mapped.set(self.windows_mapped.get() + 1);
            Ok(window)
        }

        fn unmap_window(&self, window: VirtualAddress) {
            let removed = self
                .kernel
                .borrow()
                .unset(&ActiveView::new(&self.machine), window);
            assert!(matches!(removed, Ok(Some(_))), "window {window} was not mapped");
            self.windows_mapped.set(self.windows_mapped.get() - 1);
            self.free_windows.borrow_mut().push(window);
        }

        fn copy_kernel_entries(&self, directory: &mut PageDirectory) {
            self.kernel.borrow().copy_into(directory);
        }

        fn sync_kernel_slot(&self, va: VirtualAddress) {
            self.kernel
                .borrow()
                .load(&ActiveView::new(&self.machine), PdIndex::from(va));
        }
    }

    #[test]
    fn scratch_mapping_unmaps_on_drop() {
        let ctx = TestContext::new();
        let frame = PhysicalPage::from_pfn(100);
        ctx.machine.write_phys_u32(frame.join(4), 0x1234_5678);
        {
            let mut scratch = ScratchMapping::map(&ctx, frame).unwrap();
            assert_eq!(ctx.machine.read_virt_u32(scratch.window() + 4), 0x1234_5678);
            scratch.bytes()[4] = 0;
            assert_eq!(ctx.windows_in_use(), 1);
        }
        assert_eq!(ctx.windows_in_use(), 0);
        assert_eq!(ctx.machine.read_phys_u32(frame.join(4)), 0x1234_5600);
    }

    #[test]
    fn zero_frame_clears_page() {
        let ctx = TestContext::new();
        let frame = PhysicalPage::from_pfn(101);
        ctx.machine.write_phys_u32(frame.join(0xFFC), 7);
        zero_frame(&ctx, frame).unwrap();
        assert_eq!(ctx.machine.read_phys_u32(frame.join(0xFFC)), 0);
    }

    #[test]
    fn active_view_sees_own_directory() {
        let ctx = TestContext::new();
        let active = ActiveView::new(&ctx.machine);
        assert_eq!(active.directory_frame(), PhysicalPage::from_pfn(1));
        assert_eq!(
            active.pde(PdIndex::RECURSIVE).next_table(),
            Some(PhysicalPage::from_pfn(1))
        );
        assert_eq!(active.pte(VirtualAddress::new(0x1000)), None);
    }

    #[test]
    fn map_error_messages() {
        let e = MapError::AlreadyMapped {
            va: VirtualAddress::new(0x1000),
            existing: PhysicalAddress::new(0x2000),
        };
        assert_eq!(e.to_string(), "0x00001000 is already mapped to 0x00002000");
    }
}
