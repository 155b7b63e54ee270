//! # Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌──────────────────────────────┐
//!             │ null guard (never mapped)    │
//! 0x0000_1000 ├──────────────────────────────┤
//!             │ user space (per process)     │
//! KERNEL_BASE ├──────────────────────────────┤ 0xC000_0000, PDE 768
//!             │ kernel image                 │
//! KERNEL_VMEM ├──────────────────────────────┤ 0xC040_0000, PDE 769
//!             │ initial heap (4 MiB)         │
//!             ├──────────────────────────────┤ 0xC080_0000
//!             │ kernel virtual ranges        │
//! RECURSIVE   ├──────────────────────────────┤ 0xFFC0_0000, PDE 1023
//!             │ page tables of active space  │
//!             │ page directory (last page)   │
//! 0xFFFF_FFFF └──────────────────────────────┘
//! ```

/// First kernel-space address; everything below belongs to the current process.
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// Base of the kernel's virtual range allocator. The first
/// [`HEAP_INITIAL_ALLOCATION`] bytes hold the boot heap.
pub const KERNEL_VMEM_BASE: u32 = 0xC040_0000;

/// Size of the statically mapped boot heap at [`KERNEL_VMEM_BASE`].
pub const HEAP_INITIAL_ALLOCATION: u32 = 0x40_0000;

/// Window through which the active directory's page tables are visible.
/// Table `i` lives at `RECURSIVE_TABLES_BASE + i * 4096`.
pub const RECURSIVE_TABLES_BASE: u32 = 0xFFC0_0000;

/// The active page directory, seen through its own last entry.
pub const RECURSIVE_DIRECTORY: u32 = 0xFFFF_F000;

/// First directory slot of kernel space.
pub const KERNEL_PDE_START: usize = 768;

/// Directory slot that points back at the directory itself.
pub const RECURSIVE_PDE: usize = 1023;

/// Number of kernel directory slots shared by every address space.
pub const KERNEL_PDE_COUNT: usize = 1024 - KERNEL_PDE_START;

/// Accesses below this address are null-pointer dereferences.
pub const NULL_GUARD_END: u32 = 0x1000;

const _: () = {
    assert!(KERNEL_BASE as usize >> 22 == KERNEL_PDE_START);
    assert!(RECURSIVE_TABLES_BASE as usize >> 22 == RECURSIVE_PDE);
    assert!(RECURSIVE_DIRECTORY == RECURSIVE_TABLES_BASE + (RECURSIVE_PDE as u32) * 4096);
    assert!(KERNEL_VMEM_BASE > KERNEL_BASE);
    assert!(KERNEL_VMEM_BASE + HEAP_INITIAL_ALLOCATION < RECURSIVE_TABLES_BASE);
    assert!(HEAP_INITIAL_ALLOCATION.is_multiple_of(4096));
};
