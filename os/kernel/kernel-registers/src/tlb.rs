//! Translation lookaside buffer maintenance.

use kernel_memory_addresses::VirtualAddress;

/// Drop the TLB entry for the page containing `va` on this CPU.
///
/// # Safety
/// Requires ring 0.
#[inline]
pub unsafe fn invlpg(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
    }
}
