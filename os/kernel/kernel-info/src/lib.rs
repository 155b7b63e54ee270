//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants and the boot memory-map format shared by the
//! allocators, the paging code and the fault handler.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * the user/kernel split at 3 GiB, directory slot 768
//! * the kernel virtual range window and the boot heap inside it
//! * the recursive-mapping window at the top 4 MiB
//!
//! ### Boot Information ([`boot`])
//! * multiboot memory-map records and an iterator over the raw buffer
//!
//! All layout values are compile-time constants and are checked against each
//! other with `const` assertions, so an inconsistent edit fails the build.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
