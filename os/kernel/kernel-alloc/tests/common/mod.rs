#![allow(dead_code)]

use kernel_alloc::{MemoryManager, MemoryRanges, PageFault, PageFaultError};
use kernel_info::boot::{MEMORY_USABLE, MemoryMapEntry};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_vmem::testing::SimMachine;

pub const KERNEL_CS: u32 = 0x08;
pub const USER_CS: u32 = 0x1B;

/// The boot page directory sits right above the 1 MiB line.
pub const BOOT_DIRECTORY: PhysicalPage = PhysicalPage::from_pfn(0x100);

/// 4 MiB of RAM with the usual hole below 1 MiB, low memory and the boot
/// directory reserved.
pub fn boot() -> MemoryManager<SimMachine> {
    let mm = boot_unready();
    mm.finish_boot();
    mm
}

pub fn boot_unready() -> MemoryManager<SimMachine> {
    let machine = SimMachine::new(1024);
    machine.boot_directory(BOOT_DIRECTORY);
    let ranges = MemoryRanges::from_entries([
        MemoryMapEntry::new(0, 0x9_F000, MEMORY_USABLE),
        MemoryMapEntry::new(0x9_F000, 0x6_1000, 2),
        MemoryMapEntry::new(0x10_0000, 0x30_0000, MEMORY_USABLE),
    ]);
    let mm = MemoryManager::new(machine, ranges);
    mm.restrict_range(PhysicalAddress::new(0), BOOT_DIRECTORY.base() + 0xFFF);
    mm
}

pub fn fault(address: u32, error: PageFaultError, code_segment: u32) -> PageFault {
    PageFault {
        error,
        address: VirtualAddress::new(address),
        instruction_pointer: 0xC010_1234,
        code_segment,
    }
}

pub fn not_present(address: u32, code_segment: u32) -> PageFault {
    let error = PageFaultError::new().with_user(code_segment & 3 != 0);
    fault(address, error, code_segment)
}

/// Whether the frame holding `pa` is allocated.
pub fn frame_in_use(mm: &MemoryManager<SimMachine>, pa: PhysicalAddress) -> bool {
    let id = mm
        .frames()
        .ranges()
        .frame_of(pa)
        .expect("address is not in RAM");
    mm.frames().is_allocated(id, 0)
}

/// Scribble over every free frame so tests notice missing zeroing.
pub fn dirty_free_frames(mm: &MemoryManager<SimMachine>) {
    let frames = mm.frames();
    for id in 0..frames.total_frames() {
        if frames.is_allocated(id, 0) {
            continue;
        }
        let Some(pa) = frames.ranges().address_of(id) else {
            continue;
        };
        for offset in (0..0x1000).step_by(4) {
            mm.mmu().write_phys_u32(pa + offset, 0xDEAD_BEEF);
        }
    }
}
