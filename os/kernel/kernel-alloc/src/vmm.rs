//! # Kernel Memory Manager
//!
//! [`MemoryManager`] is the one object that owns the machine's memory state:
//! the frame allocator, the kernel virtual range allocator, and the shared
//! kernel page tables. The kernel builds exactly one at boot and hands out
//! references; tests build as many as they like.
//!
//! ## Kernel mappings
//!
//! Addresses from `0xC000_0000` up to the recursive window are mapped through
//! [`set_pte`](MemoryManager::set_pte) and friends, never through a process
//! [`AddressSpace`](kernel_vmem::AddressSpace). A page table created here is
//! recorded in the shared table set and shows up in every address space.
//!
//! ## Frame ownership
//!
//! Kernel PTEs whose frame was allocated together with the mapping carry the
//! `frame_owned` bit. Unmapping returns only those frames to the allocator;
//! mapped device memory stays untouched.
//!
//! ## Lock order
//!
//! Kernel tables, then kernel vmem or frames. The frame lock is never held
//! while another lock is taken.

use crate::frame_alloc::{Frame, FrameAllocator};
use crate::memory_map::MemoryRanges;
use crate::page_fault::FaultState;
use crate::vmem_range::VmemList;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::{HEAP_INITIAL_ALLOCATION, KERNEL_VMEM_BASE, RECURSIVE_TABLES_BASE};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_sync::{SpinLock, SpinLockGuard};
use kernel_vmem::kernel_tables::kernel_slot;
use kernel_vmem::{
    ActiveView, KernelPageTables, MapError, Mmu, PageDirectory, PageEntryBits, PagingContext,
    PtEntry,
};
use log::{debug, error, info, trace, warn};

/// Flags of kernel pages whose frame belongs to the mapping.
const fn owned_kernel_page() -> PageEntryBits {
    PageEntryBits::kernel_global().with_frame_owned(true)
}

/// Memory state of one machine.
pub struct MemoryManager<M: Mmu> {
    mmu: M,
    frames: FrameAllocator,
    kernel_vmem: SpinLock<VmemList>,
    kernel_tables: SpinLock<KernelPageTables>,
    ready: AtomicBool,
    pub(crate) fault_state: FaultState,
    relax: fn(),
}

impl<M: Mmu> MemoryManager<M> {
    /// Take over memory management from the boot page tables.
    ///
    /// Every kernel table present in the loaded directory becomes shared. The
    /// initial heap window at [`KERNEL_VMEM_BASE`] is the permanent head of the
    /// kernel range list.
    ///
    /// Reserve used physical memory with
    /// [`restrict_range`](Self::restrict_range), then call
    /// [`finish_boot`](Self::finish_boot).
    pub fn new(mmu: M, ranges: MemoryRanges) -> Self {
        let kernel_tables = KernelPageTables::capture(&ActiveView::new(&mmu));
        let base = VirtualAddress::new(KERNEL_VMEM_BASE);
        let kernel_vmem = VmemList::new(
            base,
            base + HEAP_INITIAL_ALLOCATION,
            VirtualAddress::new(RECURSIVE_TABLES_BASE),
        );

        Self {
            mmu,
            frames: FrameAllocator::new(ranges),
            kernel_vmem: SpinLock::new(kernel_vmem),
            kernel_tables: SpinLock::new(kernel_tables),
            ready: AtomicBool::new(false),
            fault_state: FaultState::new(),
            relax: core::hint::spin_loop,
        }
    }

    /// Yield through `relax` while waiting for a contended lock.
    #[must_use]
    pub fn with_contention_hook(mut self, relax: fn()) -> Self {
        self.relax = relax;
        self.frames.set_relax(relax);
        self
    }

    #[inline]
    pub const fn mmu(&self) -> &M {
        &self.mmu
    }

    #[inline]
    pub const fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    #[inline]
    pub const fn fault_state(&self) -> &FaultState {
        &self.fault_state
    }

    /// Reserve the physical frames overlapping `[start, end]`.
    pub fn restrict_range(&self, start: PhysicalAddress, end: PhysicalAddress) {
        self.frames.restrict_range(start, end);
    }

    /// Allow the page-fault handler to allocate.
    pub fn finish_boot(&self) {
        self.ready.store(true, Ordering::Release);
        info!(
            "Memory manager ready: {} of {} frames free, {} kernel tables",
            self.frames.free_frames(),
            self.frames.total_frames(),
            self.kernel_tables.lock_yielding(self.relax).len()
        );
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn lock_kernel_tables(&self) -> SpinLockGuard<'_, KernelPageTables> {
        self.kernel_tables.lock_yielding(self.relax)
    }

    /// Map one kernel page.
    ///
    /// # Errors
    /// See [`KernelPageTables::set`].
    pub fn set_pte(&self, va: VirtualAddress, entry: PtEntry) -> Result<(), MapError> {
        let active = ActiveView::new(&self.mmu);
        self.lock_kernel_tables()
            .set(&active, va, entry, || self.alloc_frame())
    }

    /// Unmap one kernel page and return the entry it had.
    ///
    /// # Errors
    /// See [`KernelPageTables::unset`].
    pub fn unset_pte(&self, va: VirtualAddress) -> Result<Option<PtEntry>, MapError> {
        let active = ActiveView::new(&self.mmu);
        self.lock_kernel_tables().unset(&active, va)
    }

    /// Look up one kernel page.
    ///
    /// # Errors
    /// See [`KernelPageTables::get`].
    pub fn get_pte(&self, va: VirtualAddress) -> Result<Option<PtEntry>, MapError> {
        let active = ActiveView::new(&self.mmu);
        self.lock_kernel_tables().get(&active, va)
    }

    /// Reserve `pages` pages of kernel virtual space.
    pub fn k_vmem_alloc(&self, pages: u32) -> Option<VirtualAddress> {
        self.kernel_vmem.lock_yielding(self.relax).alloc(pages)
    }

    /// Reserve exactly `[start, end)` of kernel virtual space.
    pub fn k_vmem_alloc_range(&self, start: VirtualAddress, end: VirtualAddress) -> Option<VirtualAddress> {
        self.kernel_vmem
            .lock_yielding(self.relax)
            .alloc_specific(start, end)
    }

    pub fn k_vmem_free(&self, va: VirtualAddress) -> bool {
        self.kernel_vmem.lock_yielding(self.relax).free(va)
    }

    /// Map `frames` at consecutive pages starting at `va`, undoing on failure.
    fn map_run(&self, va: VirtualAddress, frames: &[Frame], flags: impl Fn(&Frame) -> PageEntryBits) -> Result<(), MapError> {
        for (i, frame) in frames.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let page = va + i as u32 * PAGE_SIZE;
            if let Err(e) = self.set_pte(page, PtEntry::new(frame.page(), flags(frame))) {
                for undo in 0..i {
                    #[allow(clippy::cast_possible_truncation)]
                    let _ = self.unset_pte(va + undo as u32 * PAGE_SIZE);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmap `pages` kernel pages from `va` and free the frames they own.
    fn unmap_run(&self, va: VirtualAddress, pages: u32) {
        for i in 0..pages {
            match self.unset_pte(va + i * PAGE_SIZE) {
                Ok(Some(entry)) if entry.flags().frame_owned() => {
                    self.frames.free_address(entry.frame().base());
                }
                Ok(_) => {}
                Err(e) => warn!("Cannot unmap {}: {e}", va + i * PAGE_SIZE),
            }
        }
    }

    /// Map `pages` pages of physical memory starting at `pa` into kernel space.
    ///
    /// Free RAM in the range is claimed from the frame allocator; device
    /// memory or already-used frames are mapped as they are. The returned
    /// address carries the page offset of `pa`.
    ///
    /// # Errors
    /// [`MapError::OutOfVirtualSpace`] if no kernel range is free, or an error
    /// from mapping the pages. Nothing stays reserved on failure.
    pub fn map_phys_address(&self, pa: PhysicalAddress, pages: u32) -> Result<VirtualAddress, MapError> {
        let va = self.k_vmem_alloc(pages).ok_or_else(|| {
            error!("map_phys_address: no kernel virtual range for {pages} pages");
            MapError::OutOfVirtualSpace
        })?;

        let frames = match self.frames.allocate_at(pa, pages) {
            Ok(frames) => frames,
            Err(e) => {
                error!("map_phys_address: {e}");
                self.k_vmem_free(va);
                return Err(MapError::OutOfFrames);
            }
        };

        if let Err(e) = self.map_run(va, &frames, |f| {
            PageEntryBits::kernel_global().with_frame_owned(f.id.is_some())
        }) {
            self.frames.deallocate(&frames);
            self.k_vmem_free(va);
            return Err(e);
        }

        debug!("Mapped {pages} pages of {pa} at {va}");
        Ok(va + pa.page_offset())
    }

    /// Undo [`map_phys_address`](Self::map_phys_address).
    pub fn unmap_phys_address(&self, va: VirtualAddress, pages: u32) {
        let base = va.page().base();
        self.unmap_run(base, pages);
        self.k_vmem_free(base);
    }

    /// Run `f` with two kernel pages available for temporary mappings.
    fn with_copy_window<R>(&self, f: impl FnOnce(VirtualAddress, VirtualAddress) -> Result<R, MapError>) -> Result<R, MapError> {
        let window = self.k_vmem_alloc(2).ok_or(MapError::OutOfVirtualSpace)?;
        let result = f(window, window + PAGE_SIZE);
        self.k_vmem_free(window);
        result
    }

    /// Copy `src` into `dst` through the windows.
    fn copy_frame(&self, src_window: VirtualAddress, dst_window: VirtualAddress, src: PhysicalPage, dst: PhysicalPage) -> Result<(), MapError> {
        self.set_pte(src_window, PtEntry::new(src, PageEntryBits::kernel_rw()))?;
        if let Err(e) = self.set_pte(dst_window, PtEntry::new(dst, PageEntryBits::kernel_rw())) {
            let _ = self.unset_pte(src_window);
            return Err(e);
        }

        // Safety: both windows were just mapped to whole frames.
        unsafe {
            let from = self.mmu.virt_to_mut::<[u8; PAGE_SIZE as usize]>(src_window);
            let to = self.mmu.virt_to_mut::<[u8; PAGE_SIZE as usize]>(dst_window);
            to.copy_from_slice(&from[..]);
        }

        let _ = self.unset_pte(src_window);
        let _ = self.unset_pte(dst_window);
        Ok(())
    }

    /// Copy the contents of `pages` physical pages from `src` to `dst`.
    ///
    /// # Errors
    /// A failure to reserve or map the copy window.
    pub fn copy_pageframe_range(&self, src: PhysicalPage, dst: PhysicalPage, pages: u32) -> Result<(), MapError> {
        self.with_copy_window(|from, to| {
            for i in 0..pages {
                let (Some(s), Some(d)) = (src.checked_add_pages(i), dst.checked_add_pages(i)) else {
                    return Err(MapError::OutOfFrames);
                };
                self.copy_frame(from, to, s, d)?;
            }
            Ok(())
        })
    }

    /// Allocate `pages` new frames holding a copy of the pages at `src`.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] or a failure to map the copy window. New
    /// frames are released on failure.
    pub fn duplicate_pageframe_range(&self, src: PhysicalPage, pages: u32) -> Result<Vec<Frame>, MapError> {
        let frames = self.frames.allocate(pages).map_err(|e| {
            error!("duplicate_pageframe_range: {e}");
            MapError::OutOfFrames
        })?;

        let copied = self.with_copy_window(|from, to| {
            for (i, frame) in (0..).zip(&frames) {
                let s = src.checked_add_pages(i).ok_or(MapError::OutOfFrames)?;
                self.copy_frame(from, to, s, frame.page())?;
            }
            Ok(())
        });
        if let Err(e) = copied {
            self.frames.deallocate(&frames);
            return Err(e);
        }
        Ok(frames)
    }

    /// Anonymous kernel memory: `pages` zeroed pages at a fresh kernel range.
    ///
    /// # Errors
    /// [`MapError::OutOfVirtualSpace`] or [`MapError::OutOfFrames`]; nothing
    /// stays reserved on failure.
    pub fn mmap(&self, pages: u32) -> Result<VirtualAddress, MapError> {
        let va = self.k_vmem_alloc(pages).ok_or(MapError::OutOfVirtualSpace)?;
        let frames = match self.frames.allocate(pages) {
            Ok(frames) => frames,
            Err(e) => {
                error!("mmap: {e}");
                self.k_vmem_free(va);
                return Err(MapError::OutOfFrames);
            }
        };

        if let Err(e) = self.map_run(va, &frames, |_| owned_kernel_page()) {
            self.frames.deallocate(&frames);
            self.k_vmem_free(va);
            return Err(e);
        }

        for i in 0..pages {
            // Safety: the page was mapped writable above.
            let page: &mut [u8; PAGE_SIZE as usize] = unsafe { self.mmu.virt_to_mut(va + i * PAGE_SIZE) };
            page.fill(0);
        }
        trace!("mmap: {pages} pages at {va}");
        Ok(va)
    }

    /// Undo [`mmap`](Self::mmap).
    pub fn munmap(&self, va: VirtualAddress, pages: u32) {
        self.unmap_run(va, pages);
        self.k_vmem_free(va);
    }

    /// Fill a physical frame with zeros.
    ///
    /// # Errors
    /// A failure to map the frame into kernel space.
    pub fn zero_frame(&self, frame: PhysicalPage) -> Result<(), MapError> {
        kernel_vmem::zero_frame(self, frame)
    }
}

impl<M: Mmu> PagingContext for MemoryManager<M> {
    type Mmu = M;

    fn mmu(&self) -> &M {
        &self.mmu
    }

    fn alloc_frame(&self) -> Option<PhysicalPage> {
        match self.frames.allocate_one() {
            Ok(frame) => Some(frame.page()),
            Err(e) => {
                error!("{e}");
                None
            }
        }
    }

    fn free_frame(&self, frame: PhysicalPage) {
        self.frames.free_address(frame.base());
    }

    fn map_window(&self, frame: PhysicalPage) -> Result<VirtualAddress, MapError> {
        let window = self.k_vmem_alloc(1).ok_or(MapError::OutOfVirtualSpace)?;
        if let Err(e) = self.set_pte(window, PtEntry::new(frame, PageEntryBits::kernel_rw())) {
            self.k_vmem_free(window);
            return Err(e);
        }
        Ok(window)
    }

    fn unmap_window(&self, window: VirtualAddress) {
        if let Err(e) = self.unset_pte(window) {
            warn!("Cannot unmap window {window}: {e}");
        }
        self.k_vmem_free(window);
    }

    fn copy_kernel_entries(&self, directory: &mut PageDirectory) {
        self.lock_kernel_tables().copy_into(directory);
    }

    fn sync_kernel_slot(&self, va: VirtualAddress) {
        if let Ok(pd) = kernel_slot(va) {
            self.lock_kernel_tables().load(&ActiveView::new(&self.mmu), pd);
        }
    }
}

impl<M: Mmu> core::fmt::Debug for MemoryManager<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("frames", &self.frames)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}
