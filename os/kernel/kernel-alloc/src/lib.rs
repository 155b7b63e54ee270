//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical frames, kernel virtual address ranges and the page-fault path of
//! the kernel, tied together by one [`MemoryManager`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  MemoryManager                      │
//! │    • Kernel page mappings (shared tables)           │
//! │    • Physical mappings, mmap, frame copies          │
//! │    • Demand paging                                  │
//! └───────┬──────────────────────────────┬──────────────┘
//!         │                              │
//! ┌───────▼───────────────┐   ┌──────────▼──────────────┐
//! │   FrameAllocator      │   │       VmemList          │
//! │ • Buddy bitmaps       │   │ • Kernel virtual ranges │
//! │ • Orders 0..=8        │   │ • First fit, coalescing │
//! └───────────────────────┘   └─────────────────────────┘
//! ```
//!
//! ## Boot sequence
//!
//! 1. Build [`MemoryRanges`] from the boot memory map.
//! 2. [`MemoryManager::new`] captures the boot page tables.
//! 3. Reserve the kernel image, boot modules and low memory with
//!    [`MemoryManager::restrict_range`].
//! 4. [`MemoryManager::finish_boot`] enables demand paging.
//!
//! Process address spaces live in [`kernel_vmem::AddressSpace`] and take the
//! manager as their [`kernel_vmem::PagingContext`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod frame_alloc;
pub mod memory_map;
pub mod page_fault;
pub mod vmem_range;
pub mod vmm;

pub use crate::frame_alloc::{BUDDY_MAX_ORDER, Frame, FrameAllocError, FrameAllocator};
pub use crate::memory_map::{MemoryRange, MemoryRanges};
pub use crate::page_fault::{FaultGuard, FaultOutcome, FaultState, PageFault, PageFaultError};
pub use crate::vmem_range::{VmemList, VmemRange};
pub use crate::vmm::MemoryManager;
