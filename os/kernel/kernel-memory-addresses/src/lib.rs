//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw 32-bit addresses and 4 KiB page bases used
//! by the paging and memory management code.
//!
//! ## Overview
//!
//! | Type | Description |
//! |----------|-------------|
//! | [`MemoryAddress`] | A raw 32-bit address, either physical or virtual. |
//! | [`VirtualAddress`] / [`VirtualPage`] | Virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage`] | Physical memory or MMIO regions. |
//!
//! Only 4 KiB pages exist here; large pages are never created by the kernel.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC000_1234);
//! let page = va.page();
//! assert_eq!(page.base().as_u32(), 0xC000_1000);
//! assert_eq!(page.join(va.page_offset()), va);
//!
//! let pa = PhysicalAddress::new(0x0020_0042);
//! assert_eq!(pa.page().pfn(), 0x200);
//! ```
//!
//! All types are `#[repr(transparent)]` over `u32` and implement `Copy`, `Eq`,
//! `Ord` and `Hash`.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod memory_address;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_address::MemoryAddress;
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Size of a page or frame in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// log2([`PAGE_SIZE`]).
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the in-page offset bits.
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_address_splits_into_indices() {
        let va = VirtualAddress::new(0xFFFF_F123);
        assert_eq!(va.pd_index(), 1023);
        assert_eq!(va.pt_index(), 1023);
        assert_eq!(va.page_offset(), 0x123);

        let va = VirtualAddress::new(0x0040_0000);
        assert_eq!(va.pd_index(), 1);
        assert_eq!(va.pt_index(), 0);
    }

    #[test]
    fn page_from_indices_round_trips() {
        let page = VirtualPage::from_indices(0x300, 0x155);
        assert_eq!(page.pd_index(), 0x300);
        assert_eq!(page.pt_index(), 0x155);
        assert_eq!(page, page.base().page());
    }

    #[test]
    fn alignment_helpers() {
        let a = MemoryAddress::new(0x12345);
        assert_eq!(a.align_down().as_u32(), 0x12000);
        assert_eq!(a.checked_align_up(), Some(MemoryAddress::new(0x13000)));
        assert_eq!(a.page_offset(), 0x345);
        assert!(!a.is_page_aligned());
        assert_eq!(MemoryAddress::new(0xFFFF_F001).checked_align_up(), None);
    }

    #[test]
    fn page_arithmetic_is_checked() {
        let top = PhysicalPage::from_pfn(0xF_FFFF);
        assert_eq!(top.base().as_u32(), 0xFFFF_F000);
        assert_eq!(top.checked_add_pages(1), None);

        let low = PhysicalPage::from_pfn(1);
        assert_eq!(low.checked_add_pages(2), Some(PhysicalPage::from_pfn(3)));

        let vp = VirtualAddress::new(0xFFFF_E000).page();
        assert_eq!(vp.checked_add_pages(1).map(VirtualPage::pd_index), Some(1023));
        assert_eq!(vp.checked_add_pages(2), None);
    }

    #[test]
    fn display_uses_eight_hex_digits() {
        assert_eq!(VirtualAddress::new(0xC000_0000).to_string(), "0xC0000000");
        assert_eq!(PhysicalAddress::new(0x1000).to_string(), "0x00001000");
        assert_eq!(PhysicalPage::from_pfn(1).to_string(), "0x00001000/4K");
    }
}
