//! # Typed 32-bit x86 Paging Registers
//!
//! CR3 and the TLB, the two pieces of paging hardware the memory manager
//! drives directly. The bit layouts compile everywhere so they can be tested
//! on the host; the instructions themselves only exist on `x86` with the
//! `asm` feature.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr3;
#[cfg(all(feature = "asm", target_arch = "x86"))]
pub mod tlb;

pub use crate::cr3::Cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The register access is privileged and requires ring 0.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements,
    /// and the access requires ring 0.
    unsafe fn store_unsafe(self);
}
