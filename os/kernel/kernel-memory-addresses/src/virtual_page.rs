use crate::{MemoryAddress, PAGE_MASK, PAGE_SIZE, VirtualAddress};
use core::fmt;

/// Base of a 4 KiB virtual page.
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let page = VirtualPage::from_indices(768, 3);
/// assert_eq!(page.base().as_u32(), 0xC000_3000);
/// assert_eq!(page.pd_index(), 768);
/// assert_eq!(page.pt_index(), 3);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(MemoryAddress);

impl VirtualPage {
    /// Page that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        Self(addr.0.align_down())
    }

    /// Page addressed by a directory slot and a table slot.
    ///
    /// Both indices are masked to 10 bits.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_indices(pd_index: usize, pt_index: usize) -> Self {
        let pd = (pd_index as u32) & 0x3FF;
        let pt = (pt_index as u32) & 0x3FF;
        Self(MemoryAddress::new((pd << 22) | (pt << 12)))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u32) -> VirtualAddress {
        VirtualAddress::new(self.0.as_u32() | (offset & PAGE_MASK))
    }

    #[inline]
    #[must_use]
    pub const fn pd_index(self) -> usize {
        self.base().pd_index()
    }

    #[inline]
    #[must_use]
    pub const fn pt_index(self) -> usize {
        self.base().pt_index()
    }

    /// The page `n` pages further up, `None` past 4 GiB.
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

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/4K", self.0)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(0x{:08X})", self.0.as_u32())
    }
}

impl From<VirtualPage> for VirtualAddress {
    #[inline]
    fn from(value: VirtualPage) -> Self {
        value.base()
    }
}
