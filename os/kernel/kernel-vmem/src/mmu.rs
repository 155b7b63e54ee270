//! # Paging Hardware Interface
//!
//! Everything in this crate that touches CR3, the TLB, or memory through a
//! virtual address goes through [`Mmu`]. On the target this is [`X86Mmu`];
//! host tests use the software walker in [`testing`](crate::testing).

use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
#[cfg(target_arch = "x86")]
use kernel_registers::{Cr3, LoadRegisterUnsafe, StoreRegisterUnsafe};

/// Access to the paging unit of the current CPU.
pub trait Mmu {
    /// Frame of the page directory currently loaded in CR3.
    fn active_directory(&self) -> PhysicalPage;

    /// Load `directory` into CR3, switching address spaces.
    ///
    /// # Safety
    /// - `directory` must hold a valid page directory whose slot 1023 points
    ///   back at itself.
    /// - The code and stack currently executing must be mapped identically in
    ///   the new directory.
    unsafe fn load_directory(&self, directory: PhysicalPage);

    /// Drop the TLB entry for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Reference to a `T` at `va` in the current address space.
    ///
    /// # Safety
    /// - `va` must be mapped writable for the lifetime `'a`.
    /// - `T` must not straddle a page boundary and must match the bytes at `va`.
    /// - No other live reference may alias the same memory.
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T;
}

/// The real paging unit of a 32-bit x86 CPU.
#[cfg(target_arch = "x86")]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Mmu;

#[cfg(target_arch = "x86")]
impl Mmu for X86Mmu {
    #[inline]
    fn active_directory(&self) -> PhysicalPage {
        // Safety: the kernel runs in ring 0.
        unsafe { Cr3::load_unsafe() }.directory()
    }

    #[inline]
    unsafe fn load_directory(&self, directory: PhysicalPage) {
        unsafe { Cr3::from_directory(directory).store_unsafe() };
    }

    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        // Safety: the kernel runs in ring 0.
        unsafe { kernel_registers::tlb::invlpg(va) };
    }

    #[inline]
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        unsafe { &mut *(va.as_u32() as usize as *mut T) }
    }
}
