mod common;

use common::{BOOT_DIRECTORY, KERNEL_CS, USER_CS, boot, boot_unready, dirty_free_frames, fault, not_present};
use kernel_alloc::{FaultOutcome, PageFaultError};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{AddressSpace, Mmu};

const KERNEL_VA: u32 = 0xD000_0000;
const USER_VA: u32 = 0x0804_8000;

#[test]
fn kernel_page_is_mapped_on_demand() {
    let mm = boot();
    dirty_free_frames(&mm);
    let va = VirtualAddress::new(KERNEL_VA);

    let outcome = mm.handle_page_fault(not_present(KERNEL_VA + 0x10, KERNEL_CS), None);
    assert_eq!(outcome, FaultOutcome::Mapped);
    assert!(!mm.fault_state().is_active());

    let entry = mm.get_pte(va).unwrap().unwrap();
    assert!(entry.flags().global_translation() && entry.flags().frame_owned());
    assert!(!entry.flags().user_access());
    assert_eq!(mm.mmu().read_virt_u32(va + 0xFFC), 0);
}

#[test]
fn kernel_tables_are_shared_between_address_spaces() {
    let mm = boot();
    let a = AddressSpace::new(&mm, 1).unwrap();
    let b = AddressSpace::new(&mm, 2).unwrap();
    let va = VirtualAddress::new(KERNEL_VA);

    unsafe { a.activate(&mm) };
    assert_eq!(
        mm.handle_page_fault(not_present(KERNEL_VA, KERNEL_CS), None),
        FaultOutcome::Mapped
    );
    mm.mmu().write_virt_u32(va, 42);

    // `b` was built before the table existed and is loaded without a refresh.
    unsafe { mm.mmu().load_directory(b.directory_frame()) };
    assert_eq!(mm.mmu().translate(va), None);
    assert_eq!(
        mm.handle_page_fault(not_present(KERNEL_VA, KERNEL_CS), None),
        FaultOutcome::AlreadyPresent
    );
    assert_eq!(mm.mmu().read_virt_u32(va), 42);

    // Mappings added later through either directory show up in the other.
    let frame = mm.frames().allocate_one().unwrap();
    let next = va + 0x1000;
    mm.set_pte(
        next,
        kernel_vmem::PtEntry::new(frame.page(), kernel_vmem::PageEntryBits::kernel_rw()),
    )
    .unwrap();
    unsafe { a.activate(&mm) };
    assert_eq!(mm.mmu().translate(next), Some(frame.address));

    unsafe { mm.mmu().load_directory(BOOT_DIRECTORY) };
    assert!(a.destroy(&mm).is_ok());
    assert!(b.destroy(&mm).is_ok());
}

#[test]
fn user_page_is_mapped_on_demand() {
    let mm = boot();
    dirty_free_frames(&mm);
    let mut space = AddressSpace::new(&mm, 9).unwrap();
    unsafe { space.activate(&mm) };
    let va = VirtualAddress::new(USER_VA);

    let outcome = mm.handle_page_fault(not_present(USER_VA + 0x123, USER_CS), Some(&mut space));
    assert_eq!(outcome, FaultOutcome::Mapped);
    assert_eq!(mm.mmu().read_virt_u32(va + 0x120), 0);
    mm.mmu().write_virt_u32(va, 7);

    let entry = space.get(&mm, va).unwrap();
    assert!(entry.flags().user_access() && entry.flags().writable());

    assert_eq!(
        mm.handle_page_fault(not_present(USER_VA, USER_CS), Some(&mut space)),
        FaultOutcome::AlreadyPresent
    );
    assert_eq!(mm.mmu().read_virt_u32(va), 7);

    unsafe { mm.mmu().load_directory(BOOT_DIRECTORY) };
    assert!(space.destroy(&mm).is_ok());
}

#[test]
fn kernel_mode_fault_on_user_page_is_served() {
    let mm = boot();
    let mut space = AddressSpace::new(&mm, 5).unwrap();
    unsafe { space.activate(&mm) };

    let outcome = mm.handle_page_fault(not_present(USER_VA, KERNEL_CS), Some(&mut space));
    assert_eq!(outcome, FaultOutcome::Mapped);
    assert!(space.get(&mm, VirtualAddress::new(USER_VA)).is_some());

    unsafe { mm.mmu().load_directory(BOOT_DIRECTORY) };
    assert!(space.destroy(&mm).is_ok());
}

#[test]
fn user_protection_violation_is_reported() {
    let mm = boot();
    let error = PageFaultError::new()
        .with_present(true)
        .with_write(true)
        .with_user(true);

    let outcome = mm.handle_page_fault(fault(USER_VA, error, USER_CS), None);
    assert_eq!(
        outcome,
        FaultOutcome::UserProtectionViolation {
            address: VirtualAddress::new(USER_VA)
        }
    );
    assert!(!mm.fault_state().is_active());
}

#[test]
#[should_panic(expected = "kernel-mode memory protection violation at vaddr 0xC0800000")]
fn kernel_protection_violation_is_fatal() {
    let mm = boot();
    let error = PageFaultError::new().with_present(true).with_write(true);
    mm.handle_page_fault(fault(0xC080_0000, error, KERNEL_CS), None);
}

#[test]
#[should_panic(expected = "possible NULL pointer dereference?")]
fn null_page_is_fatal() {
    let mm = boot();
    mm.handle_page_fault(not_present(0x10, USER_CS), None);
}

#[test]
#[should_panic(expected = "before memory management is ready")]
fn fault_before_boot_completes_is_fatal() {
    let mm = boot_unready();
    mm.handle_page_fault(not_present(KERNEL_VA, KERNEL_CS), None);
}

#[test]
#[should_panic(expected = "recursive page-table window")]
fn fault_in_recursive_window_is_fatal() {
    let mm = boot();
    mm.handle_page_fault(not_present(0xFFC0_2000, KERNEL_CS), None);
}

#[test]
#[should_panic(expected = "without an address space")]
fn user_fault_without_process_is_fatal() {
    let mm = boot();
    mm.handle_page_fault(not_present(USER_VA, USER_CS), None);
}

#[test]
#[should_panic(
    expected = "page fault in page fault handler: initial CR2 0xD0000000 (EIP 0xc0101234), recursive CR2 0xD0400000 (EIP 0xc0101234)"
)]
fn nested_fault_is_fatal() {
    let mm = boot();
    let _outer = mm.fault_state().enter(&not_present(KERNEL_VA, KERNEL_CS));
    mm.handle_page_fault(not_present(KERNEL_VA + 0x40_0000, KERNEL_CS), None);
}

#[test]
#[should_panic(expected = "No pageframes left to allocate!")]
fn running_out_of_frames_is_fatal() {
    let mm = boot();
    while mm.frames().allocate_one().is_ok() {}
    mm.handle_page_fault(not_present(KERNEL_VA, KERNEL_CS), None);
}
