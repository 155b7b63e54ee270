//! # Virtual Address Range Allocator
//!
//! Hands out page-aligned runs of virtual addresses from `[base, ceiling)`.
//! The interval is covered by an address-ordered list of nodes; each node
//! runs from its own address to the next node's address (or to the ceiling)
//! and is either free or used.
//!
//! ```text
//! base                                                          ceiling
//! |sentinel (used)|  used  |        free         |  used  |  free   |
//! ```
//!
//! The first node is a permanent used sentinel. Nodes live in an index arena;
//! removed slots are recycled.

use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use log::{trace, warn};

const HEAD: usize = 0;

#[derive(Debug, Copy, Clone)]
struct Node {
    address: u32,
    free: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A free-list over one virtual address interval.
#[derive(Debug, Clone)]
pub struct VmemList {
    nodes: Vec<Node>,
    spare: Vec<usize>,
    ceiling: u32,
}

/// One node as seen from outside.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmemRange {
    pub address: VirtualAddress,
    pub length: u32,
    pub free: bool,
}

impl VmemList {
    /// Manage `[base, ceiling)`, with `[base, first_free)` permanently in use.
    #[must_use]
    pub fn new(base: VirtualAddress, first_free: VirtualAddress, ceiling: VirtualAddress) -> Self {
        debug_assert!(base.is_page_aligned() && first_free.is_page_aligned());
        debug_assert!(base <= first_free && first_free <= ceiling);

        let mut nodes = Vec::with_capacity(16);
        nodes.push(Node {
            address: base.as_u32(),
            free: false,
            prev: None,
            next: None,
        });
        let mut list = Self {
            nodes,
            spare: Vec::new(),
            ceiling: ceiling.as_u32(),
        };
        if first_free < ceiling {
            list.insert_after(HEAD, first_free.as_u32(), true);
        }
        list
    }

    #[inline]
    #[must_use]
    pub const fn ceiling(&self) -> VirtualAddress {
        VirtualAddress::new(self.ceiling)
    }

    fn length(&self, i: usize) -> u32 {
        let end = self.nodes[i]
            .next
            .map_or(self.ceiling, |n| self.nodes[n].address);
        end - self.nodes[i].address
    }

    fn insert_after(&mut self, i: usize, address: u32, free: bool) -> usize {
        let next = self.nodes[i].next;
        let node = Node {
            address,
            free,
            prev: Some(i),
            next,
        };
        let slot = if let Some(slot) = self.spare.pop() {
            self.nodes[slot] = node;
            slot
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        };
        self.nodes[i].next = Some(slot);
        if let Some(n) = next {
            self.nodes[n].prev = Some(slot);
        }
        slot
    }

    /// Unlink node `i`; its span goes to its predecessor.
    fn remove(&mut self, i: usize) {
        debug_assert_ne!(i, HEAD);
        let Node { prev, next, .. } = self.nodes[i];
        if let Some(p) = prev {
            self.nodes[p].next = next;
        }
        if let Some(n) = next {
            self.nodes[n].prev = prev;
        }
        self.spare.push(i);
    }

    fn walk(&self) -> impl Iterator<Item = usize> + '_ {
        core::iter::successors(Some(HEAD), |&i| self.nodes[i].next)
    }

    /// Reserve `pages` pages from the first free node that is large enough.
    ///
    /// Returns `None` if no free node can hold the request.
    pub fn alloc(&mut self, pages: u32) -> Option<VirtualAddress> {
        let bytes = pages.checked_mul(PAGE_SIZE).filter(|&b| b > 0)?;
        let i = self
            .walk()
            .find(|&i| self.nodes[i].free && self.length(i) >= bytes)?;

        let address = self.nodes[i].address;
        if self.length(i) > bytes {
            self.insert_after(i, address + bytes, true);
        }
        self.nodes[i].free = false;
        trace!("vmem: allocated {pages} pages at {address:#010x}");
        Some(VirtualAddress::new(address))
    }

    /// Reserve exactly `[start, end)`, rounded out to whole pages.
    ///
    /// Returns `None` unless the whole range lies inside one free node.
    pub fn alloc_specific(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Option<VirtualAddress> {
        let start = start.as_u32() & !(PAGE_SIZE - 1);
        let end = end.as_u32().checked_next_multiple_of(PAGE_SIZE)?;
        if end <= start || end > self.ceiling {
            return None;
        }

        let i = self.walk().find(|&i| {
            let node = &self.nodes[i];
            node.address <= start && start - node.address < self.length(i)
        })?;
        if !self.nodes[i].free || self.nodes[i].address + self.length(i) < end {
            return None;
        }

        let target = if self.nodes[i].address < start {
            self.insert_after(i, start, true)
        } else {
            i
        };
        if self.nodes[target].address + self.length(target) > end {
            self.insert_after(target, end, true);
        }
        self.nodes[target].free = false;
        trace!("vmem: reserved {start:#010x}..{end:#010x}");
        Some(VirtualAddress::new(start))
    }

    /// Release the used node starting at `address` and merge it with free
    /// neighbours.
    ///
    /// Returns `false` if no used node starts there.
    pub fn free(&mut self, address: VirtualAddress) -> bool {
        let Some(i) = self
            .walk()
            .skip(1)
            .find(|&i| self.nodes[i].address == address.as_u32())
        else {
            warn!("vmem: no range starts at {address}");
            return false;
        };
        if self.nodes[i].free {
            warn!("vmem: range at {address} is already free");
            return false;
        }

        self.nodes[i].free = true;
        if let Some(next) = self.nodes[i].next.filter(|&n| self.nodes[n].free) {
            self.remove(next);
        }
        if let Some(prev) = self.nodes[i].prev.filter(|&p| self.nodes[p].free) {
            debug_assert_ne!(prev, HEAD);
            self.remove(i);
        }
        trace!("vmem: freed {address}");
        true
    }

    /// Every node in address order, the sentinel first.
    pub fn iter(&self) -> impl Iterator<Item = VmemRange> + '_ {
        self.walk().map(|i| VmemRange {
            address: VirtualAddress::new(self.nodes[i].address),
            length: self.length(i),
            free: self.nodes[i].free,
        })
    }

    /// Total bytes in free nodes.
    #[must_use]
    pub fn free_bytes(&self) -> u32 {
        self.iter().filter(|r| r.free).map(|r| r.length).sum()
    }
}
