//! # Page Fault Handling
//!
//! The interrupt stub reads `CR2`, the error code and the interrupted `EIP`/`CS`
//! and passes them as a [`PageFault`] to
//! [`MemoryManager::handle_page_fault`]. Missing pages are mapped on demand:
//!
//! - kernel addresses get a fresh global frame in the shared kernel tables,
//!   or just the shared table if another address space already mapped the page;
//! - user addresses get a zeroed user frame in the current address space.
//!
//! Everything else is fatal, except a protection violation raised by user
//! code, which is reported back so the caller can terminate the process.

use crate::vmm::MemoryManager;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use bitfield_struct::bitfield;
use kernel_info::memory::{KERNEL_BASE, NULL_GUARD_END};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::kernel_tables::kernel_slot;
use kernel_vmem::{ActiveView, AddressSpace, MapError, Mmu, PageEntryBits, PagingContext, PtEntry};
use log::{trace, warn};

/// Page-fault error code pushed by the CPU.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// Set: protection violation. Clear: the page was not present.
    pub present: bool,
    /// The access was a write.
    pub write: bool,
    /// The access came from CPL 3.
    pub user: bool,
    /// A reserved bit was set in a paging structure.
    pub reserved_bit: bool,
    /// The access was an instruction fetch.
    pub instruction_fetch: bool,
    #[bits(27)]
    __: u32,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            return "Non-present page (page not mapped)";
        }
        if self.reserved_bit() {
            return "Reserved bit set in a paging structure";
        }
        if self.instruction_fetch() {
            if self.user() {
                return "Instruction fetch from non-executable user page";
            }
            return "Instruction fetch from non-executable kernel page";
        }
        if self.write() {
            return "Write access to protected page";
        }
        "Read access to protected page"
    }
}

/// Everything the handler learns about one fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageFault {
    pub error: PageFaultError,
    /// The faulting address from `CR2`.
    pub address: VirtualAddress,
    pub instruction_pointer: u32,
    pub code_segment: u32,
}

impl PageFault {
    /// Whether the faulting code ran in user mode.
    #[inline]
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.code_segment & 3 != 0 || self.error.user()
    }
}

/// What the handler did about a fault that was not fatal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOutcome {
    /// A new frame now backs the faulting page.
    Mapped,
    /// The page was already mapped; only the directory needed the shared
    /// kernel table.
    AlreadyPresent,
    /// User code touched a page it may not access.
    UserProtectionViolation { address: VirtualAddress },
}

/// Detects a page fault raised while handling another one.
#[derive(Debug, Default)]
pub struct FaultState {
    active: AtomicBool,
    address: AtomicU32,
    instruction_pointer: AtomicU32,
}

/// Marks the handler as running until dropped.
#[derive(Debug)]
pub struct FaultGuard<'a> {
    state: &'a FaultState,
}

impl FaultState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            address: AtomicU32::new(0),
            instruction_pointer: AtomicU32::new(0),
        }
    }

    /// Enter the handler for `fault`.
    ///
    /// # Panics
    /// If the handler is already running.
    pub fn enter(&self, fault: &PageFault) -> FaultGuard<'_> {
        if self.active.swap(true, Ordering::AcqRel) {
            panic!(
                "page fault in page fault handler: initial CR2 {} (EIP {:#010x}), recursive CR2 {} (EIP {:#010x})",
                VirtualAddress::new(self.address.load(Ordering::Acquire)),
                self.instruction_pointer.load(Ordering::Acquire),
                fault.address,
                fault.instruction_pointer
            );
        }
        self.address.store(fault.address.as_u32(), Ordering::Release);
        self.instruction_pointer
            .store(fault.instruction_pointer, Ordering::Release);
        FaultGuard { state: self }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for FaultGuard<'_> {
    fn drop(&mut self) {
        self.state.active.store(false, Ordering::Release);
    }
}

#[cold]
fn out_of_frames() -> ! {
    panic!("No pageframes left to allocate!");
}

impl<M: Mmu> MemoryManager<M> {
    /// Resolve a page fault.
    ///
    /// `current` is the address space of the interrupted process, if any; it
    /// is expected to be the active one.
    ///
    /// # Panics
    /// On every fault that cannot be resolved: before [`finish_boot`], on
    /// accesses below [`NULL_GUARD_END`], inside the recursive window, when
    /// frames run out, on a second fault while handling one, and on
    /// protection violations in kernel mode.
    ///
    /// [`finish_boot`]: MemoryManager::finish_boot
    pub fn handle_page_fault(&self, fault: PageFault, current: Option<&mut AddressSpace>) -> FaultOutcome {
        let _guard = self.fault_state.enter(&fault);
        let address = fault.address;

        if fault.error.present() {
            if fault.is_user() {
                warn!(
                    "User-mode memory protection violation at {address}: {} (EIP {:#010x})",
                    fault.error.explain(),
                    fault.instruction_pointer
                );
                return FaultOutcome::UserProtectionViolation { address };
            }
            panic!(
                "kernel-mode memory protection violation at vaddr {address}: {} (EIP {:#010x})",
                fault.error.explain(),
                fault.instruction_pointer
            );
        }

        if !self.is_ready() {
            panic!(
                "page fault at {address} before memory management is ready (EIP {:#010x})",
                fault.instruction_pointer
            );
        }
        if address.as_u32() < NULL_GUARD_END {
            panic!(
                "invalid memory access (possible NULL pointer dereference?) at {address}: EIP={:#010x} CS={:#06x}",
                fault.instruction_pointer, fault.code_segment
            );
        }

        if address.as_u32() >= KERNEL_BASE {
            self.fault_in_kernel_page(&fault)
        } else {
            self.fault_in_user_page(&fault, current)
        }
    }

    fn fault_in_kernel_page(&self, fault: &PageFault) -> FaultOutcome {
        let page = fault.address.page().base();
        let Ok(pd) = kernel_slot(page) else {
            panic!(
                "page fault in the recursive page-table window at {} (EIP {:#010x})",
                fault.address, fault.instruction_pointer
            );
        };

        let active = ActiveView::new(self.mmu());
        let mut tables = self.lock_kernel_tables();
        if tables
            .ensure_table(&active, pd, || self.alloc_frame())
            .is_err()
        {
            out_of_frames();
        }
        if active.pte(page).is_some_and(PtEntry::is_present) {
            trace!("Kernel page {page} was mapped by another address space");
            return FaultOutcome::AlreadyPresent;
        }

        let Some(frame) = self.alloc_frame() else {
            out_of_frames();
        };
        active.set_pte(
            page,
            PtEntry::new(frame, PageEntryBits::kernel_global().with_frame_owned(true)),
        );
        drop(tables);

        // Safety: the page was mapped writable above and belongs to no one yet.
        let bytes: &mut [u8; PAGE_SIZE as usize] = unsafe { self.mmu().virt_to_mut(page) };
        bytes.fill(0);
        trace!("Demand-mapped kernel page {page} -> {frame}");
        FaultOutcome::Mapped
    }

    fn fault_in_user_page(&self, fault: &PageFault, current: Option<&mut AddressSpace>) -> FaultOutcome {
        let Some(space) = current else {
            panic!(
                "page fault at user address {} without an address space (EIP {:#010x})",
                fault.address, fault.instruction_pointer
            );
        };

        let page = fault.address.page().base();
        if space.get(self, page).is_some_and(|e| e.is_present()) {
            return FaultOutcome::AlreadyPresent;
        }

        match space.map_new(self, page, PageEntryBits::user_rw()) {
            Ok(frame) => {
                trace!("Demand-mapped user page {page} -> {frame} for {}", space.owner());
                FaultOutcome::Mapped
            }
            Err(MapError::OutOfFrames) => out_of_frames(),
            Err(e) => panic!(
                "cannot map user page {page} for {}: {e} (EIP {:#010x})",
                space.owner(),
                fault.instruction_pointer
            ),
        }
    }
}
