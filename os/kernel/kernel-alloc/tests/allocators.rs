//! Property checks of the allocator invariants over generated sequences of
//! allocations and frees.

#![allow(clippy::cast_possible_truncation)]

use kernel_alloc::{BUDDY_MAX_ORDER, Frame, FrameAllocError, FrameAllocator, MemoryRanges, VmemList};
use kernel_info::boot::{MEMORY_USABLE, MemoryMapEntry};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use proptest::prelude::*;
use proptest::sample::Index;

/// One step of a generated workload.
#[derive(Debug, Clone)]
enum Op {
    Alloc(u32),
    /// Free one of the live allocations.
    Free(Index),
}

fn ops(max_pages: u32, len: usize) -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        2 => (1..=max_pages).prop_map(Op::Alloc),
        1 => any::<Index>().prop_map(Op::Free),
    ];
    prop::collection::vec(op, 1..len)
}

fn allocator(frames: u64) -> FrameAllocator {
    FrameAllocator::new(MemoryRanges::from_entries([MemoryMapEntry::new(
        0x10_0000,
        frames * u64::from(PAGE_SIZE),
        MEMORY_USABLE,
    )]))
}

/// A parent block is marked exactly when one of its halves is.
fn check_buddy_invariant(frames: &FrameAllocator) -> Result<(), TestCaseError> {
    let total = frames.total_frames();
    for order in 1..=BUDDY_MAX_ORDER {
        for block in 0..total >> order {
            let children = frames.is_allocated(2 * block, order - 1)
                || frames.is_allocated(2 * block + 1, order - 1);
            prop_assert_eq!(
                frames.is_allocated(block, order),
                children,
                "order-{} block {}",
                order,
                block
            );
        }
    }
    Ok(())
}

#[test]
fn exhausted_allocator_reports_and_unlocks() {
    let frames = allocator(4);
    for _ in 0..4 {
        frames.allocate_one().unwrap();
    }
    assert_eq!(
        frames.allocate_one(),
        Err(FrameAllocError::Exhausted { order: 0 })
    );
    assert!(!frames.is_locked());
    assert_eq!(frames.allocate(1), Err(FrameAllocError::Exhausted { order: 0 }));
    assert!(!frames.is_locked());
}

fn snapshot(frames: &FrameAllocator) -> Vec<bool> {
    (0..=BUDDY_MAX_ORDER)
        .flat_map(|order| (0..frames.total_frames() >> order).map(move |block| (block, order)))
        .map(|(block, order)| frames.is_allocated(block, order))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn buddy_maps_stay_consistent(steps in ops(40, 120)) {
        let frames = allocator(1000);
        let mut live: Vec<Vec<Frame>> = Vec::new();

        for op in steps {
            match op {
                Op::Alloc(n) => {
                    if let Ok(run) = frames.allocate(n) {
                        prop_assert_eq!(run.len(), n as usize);
                        live.push(run);
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    frames.deallocate(&live.swap_remove(i.index(live.len())));
                }
                Op::Free(_) => {}
            }

            let in_use: usize = live.iter().map(Vec::len).sum();
            prop_assert_eq!(frames.free_frames() as usize, 1000 - in_use);
            check_buddy_invariant(&frames)?;
        }

        let mut ids: Vec<u32> = live.iter().flatten().filter_map(|f| f.id).collect();
        let count = ids.len();
        ids.sort_unstable();
        ids.dedup();
        prop_assert_eq!(ids.len(), count, "a frame was handed out twice");
    }

    #[test]
    fn freeing_everything_restores_whole_blocks(sizes in prop::collection::vec(1u32..10, 1..300)) {
        let frames = allocator(512);
        let mut live = Vec::new();
        for n in sizes {
            match frames.allocate(n) {
                Ok(run) => live.push(run),
                Err(_) => break,
            }
        }
        for run in live.iter().rev() {
            frames.deallocate(run);
        }

        prop_assert_eq!(frames.free_frames(), 512);
        for block in 0..2 {
            prop_assert!(!frames.is_allocated(block, BUDDY_MAX_ORDER));
        }
        prop_assert_eq!(frames.allocate_specific(1, BUDDY_MAX_ORDER).map(|f| f.len()), Ok(256));
    }

    #[test]
    fn vmem_ranges_tile_the_interval(steps in ops(16, 200)) {
        let base = VirtualAddress::new(0xC040_0000);
        let ceiling = VirtualAddress::new(0xC080_0000);
        let mut list = VmemList::new(base, base + 0x1000, ceiling);
        let mut live: Vec<(VirtualAddress, u32)> = Vec::new();

        for op in steps {
            match op {
                Op::Alloc(pages) => {
                    if let Some(va) = list.alloc(pages) {
                        live.push((va, pages));
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    let (va, _) = live.swap_remove(i.index(live.len()));
                    prop_assert!(list.free(va));
                }
                Op::Free(_) => {}
            }

            let ranges: Vec<_> = list.iter().collect();
            prop_assert_eq!(ranges[0].address, base);
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].address + pair[0].length, pair[1].address);
                prop_assert!(!(pair[0].free && pair[1].free), "free neighbours not merged");
            }
            let last = ranges[ranges.len() - 1];
            prop_assert_eq!(last.address + last.length, ceiling);

            let used: u32 = live.iter().map(|(_, pages)| pages * PAGE_SIZE).sum();
            prop_assert_eq!(list.free_bytes(), ceiling.as_u32() - base.as_u32() - 0x1000 - used);
            for (va, pages) in &live {
                prop_assert!(va.as_u32() >= base.as_u32() + 0x1000);
                prop_assert!(va.as_u32() + pages * PAGE_SIZE <= ceiling.as_u32());
            }
        }
    }

    #[test]
    fn allocate_then_free_leaves_maps_unchanged(
        kept in prop::collection::vec(1u32..=12, 20),
        released in prop::collection::vec(any::<Index>(), 0..4),
        n in 1u32..=300,
    ) {
        let frames = allocator(1024);
        let mut keep: Vec<Vec<Frame>> = kept.iter().map(|&k| frames.allocate(k).unwrap()).collect();
        for i in released {
            frames.deallocate(&keep.swap_remove(i.index(keep.len())));
        }

        let before = snapshot(&frames);
        let run = frames.allocate(n).unwrap();
        prop_assert_ne!(snapshot(&frames), before.clone());
        frames.deallocate(&run);
        prop_assert_eq!(snapshot(&frames), before, "allocate({}) then free", n);
    }
}
