use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// A 32-bit x86 paging entry in its raw bitfield form.
///
/// Directory entries (PDE) and table entries (PTE) share this layout; a few
/// bits only mean something at one of the two levels.
///
/// ### Bit layout
///
/// | Bits   | Name / Mnemonic | Meaning |
/// |--------|-----------------|---------|
/// | 0      | `P`             | Valid entry if set |
/// | 1      | `RW`            | Writable if set |
/// | 2      | `US`            | User-mode accessible if set |
/// | 3      | `PWT`           | Write-through caching |
/// | 4      | `PCD`           | Disable caching |
/// | 5      | `A`             | Accessed |
/// | 6      | `D`             | Dirty (PTE only) |
/// | 7      | `PS` / `PAT`    | 4 MiB page in a PDE, PAT in a PTE; always 0 here |
/// | 8      | `G`             | Global (PTE only) |
/// | 9      | owned           | Frame was allocated for this mapping (software) |
/// | 10–11  | OS avail        | Reserved for OS use |
/// | 12–31  | `addr`          | Physical frame bits [31:12] |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalPage;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::kernel_rw().with_frame(PhysicalPage::from_pfn(0x123));
/// assert!(e.present() && e.writable() && !e.user_access());
/// assert_eq!(e.into_bits(), 0x0012_3003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// In a PDE this gates every page behind the table.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on first write through a PTE.
    pub dirty: bool,

    /// Page size in a PDE, PAT selector in a PTE (bit 7).
    ///
    /// The kernel never creates 4 MiB pages and never programs the PAT.
    pub large_page: bool,

    /// Global (G, bit 8).
    ///
    /// The translation survives CR3 reloads. Used for kernel-space pages,
    /// which look the same in every address space.
    pub global_translation: bool,

    /// Software bit 9: the frame behind this PTE was allocated together with
    /// the mapping and is returned to the frame allocator on unmap.
    pub frame_owned: bool,

    /// OS-available (bits 10..=11).
    #[bits(2)]
    pub os_available: u8,

    /// Physical frame bits [31:12].
    #[bits(20)]
    frame_bits_31_12: u32,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_frame(&mut self, frame: PhysicalPage) {
        self.set_frame_bits_31_12(frame.pfn());
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(mut self, frame: PhysicalPage) -> Self {
        self.set_frame(frame);
        self
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage {
        PhysicalPage::from_pfn(self.frame_bits_31_12())
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        self.frame().base()
    }

    /// Only the permission and caching bits, without frame or CPU-set bits.
    #[inline]
    #[must_use]
    pub const fn permissions(self) -> Self {
        Self::new()
            .with_present(self.present())
            .with_writable(self.writable())
            .with_user_access(self.user_access())
            .with_write_through(self.write_through())
            .with_cache_disabled(self.cache_disabled())
            .with_global_translation(self.global_translation())
    }

    /// Supervisor read/write.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Supervisor read/write, kept across address-space switches.
    #[inline]
    #[must_use]
    pub const fn kernel_global() -> Self {
        Self::kernel_rw().with_global_translation(true)
    }

    /// User read/write. Also used for directory entries of user tables.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
    }

    /// User read-only.
    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new().with_present(true).with_user_access(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_occupies_the_top_twenty_bits() {
        let e = PageEntryBits::new().with_frame(PhysicalPage::from_pfn(0xF_FFFF));
        assert_eq!(e.into_bits(), 0xFFFF_F000);
        assert_eq!(e.physical_address().as_u32(), 0xFFFF_F000);
    }

    #[test]
    fn flag_positions_match_hardware() {
        assert_eq!(PageEntryBits::kernel_rw().into_bits(), 0b11);
        assert_eq!(PageEntryBits::user_rw().into_bits(), 0b111);
        assert_eq!(PageEntryBits::kernel_global().into_bits(), 0x103);
        assert_eq!(PageEntryBits::new().with_frame_owned(true).into_bits(), 0x200);
    }

    #[test]
    fn permissions_drop_cpu_and_software_bits() {
        let raw = PageEntryBits::user_ro()
            .with_accessed(true)
            .with_dirty(true)
            .with_frame_owned(true)
            .with_frame(PhysicalPage::from_pfn(7));
        assert_eq!(raw.permissions(), PageEntryBits::user_ro());
    }
}
