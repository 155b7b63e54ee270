//! # Memory Page Table

pub mod pd;
pub mod pt;

use crate::page_table::pd::PdIndex;
use crate::page_table::pt::PtIndex;
use kernel_memory_addresses::VirtualAddress;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (PdIndex, PtIndex) {
    (PdIndex::from(va), PtIndex::from(va))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_ok() {
        let (pd, pt) = split_indices(VirtualAddress::new(0xC080_3123));
        assert_eq!(pd.as_usize(), 770);
        assert_eq!(pt.as_usize(), 3);
    }
}
