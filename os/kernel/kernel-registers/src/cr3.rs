#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalPage;

/// CR3 with 32-bit paging: the page-directory base register.
///
/// Holds the frame of the loaded page directory and the cache-control flags
/// used when the CPU walks it.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    /// Bits 0–2 — Ignored.
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3 — PWT: Page-level Write-Through for the page directory.
    pub pwt: bool,

    /// Bit 4 — PCD: Page-level Cache Disable for the page directory.
    pub pcd: bool,

    /// Bits 5–11 — Ignored.
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–31 — Page-directory frame number.
    #[bits(20)]
    directory_pfn: u32,
}

impl Cr3 {
    /// CR3 value selecting `directory` with write-back caching.
    #[must_use]
    pub const fn from_directory(directory: PhysicalPage) -> Self {
        Self::new().with_directory_pfn(directory.pfn())
    }

    /// Frame of the page directory this value selects.
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage {
        PhysicalPage::from_pfn(self.directory_pfn())
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u32;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl StoreRegisterUnsafe for Cr3 {
    /// Loading CR3 also flushes every non-global TLB entry.
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
