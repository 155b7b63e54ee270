use crate::{MemoryAddress, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use core::fmt;

/// Base of a 4 KiB physical page frame.
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let frame = PhysicalPage::from_pfn(0x100);
/// assert_eq!(frame.base(), PhysicalAddress::new(0x0010_0000));
/// assert_eq!(frame.join(0x10).as_u32(), 0x0010_0010);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(MemoryAddress);

impl PhysicalPage {
    /// Frame that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: PhysicalAddress) -> Self {
        Self(addr.0.align_down())
    }

    /// Frame from a physical frame number (`address >> 12`).
    #[inline]
    #[must_use]
    pub const fn from_pfn(pfn: u32) -> Self {
        Self(MemoryAddress::new(pfn << PAGE_SHIFT))
    }

    #[inline]
    #[must_use]
    pub const fn pfn(self) -> u32 {
        self.0.as_u32() >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0)
    }

    /// Combine with an in-page offset to form a full address.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u32) -> PhysicalAddress {
        PhysicalAddress::new(self.0.as_u32() | (offset & PAGE_MASK))
    }

    /// The frame `n` pages further up, `None` past 4 GiB.
    #[inline]
    #[must_use]
    pub const fn checked_add_pages(self, n: u32) -> Option<Self> {
        match n.checked_mul(PAGE_SIZE) {
            Some(bytes) => match self.0.checked_add(bytes) {
                Some(a) => Some(Self(a)),
                None => None,
            },
            None => None,
        }
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/4K", self.0)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(0x{:08X})", self.0.as_u32())
    }
}

impl From<PhysicalPage> for PhysicalAddress {
    #[inline]
    fn from(value: PhysicalPage) -> Self {
        value.base()
    }
}
