mod common;

use common::Machine;
use kernel_arch::Arch;
use kernel_arch::sim::TlbEvent;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{FrameAlloc, MapError, PageFlags, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const USER_PAGE: VirtualAddress = VirtualAddress::new(info::USER_BASE);

#[test]
fn map_get_and_unmap_in_a_process_directory() {
    let machine = Machine::boot(1);
    let kernel = machine.kernel;
    let dir = kernel.create_directory().unwrap();
    let a = kernel.frames().alloc_4k().unwrap();
    let b = kernel.frames().alloc_4k().unwrap();

    assert_eq!(kernel.get(dir, USER_PAGE), None);
    kernel.map(dir, USER_PAGE, a, PageFlags::USER).unwrap();
    assert_eq!(kernel.get(dir, USER_PAGE), Some(a));
    assert_eq!(kernel.get(dir, USER_PAGE + 0x123), Some(a + 0x123));

    // Remapping overwrites.
    kernel.map(dir, USER_PAGE, b, PageFlags::USER).unwrap();
    assert_eq!(kernel.get(dir, USER_PAGE), Some(b));

    assert_eq!(kernel.unmap(dir, USER_PAGE), Some(b));
    assert_eq!(kernel.get(dir, USER_PAGE), None);
    assert_eq!(kernel.unmap(dir, USER_PAGE), None);

    // The kernel half is shared with the kernel directory.
    let kernel_page = VirtualAddress::new(info::KERNEL_BASE + 0x5000);
    assert_eq!(kernel.get(dir, kernel_page), Some(PhysicalAddress::new(0x5000)));
}

#[test]
fn misaligned_map_is_an_error() {
    let machine = Machine::boot(1);
    let kernel = machine.kernel;
    let dir = kernel.create_directory().unwrap();
    let frame = kernel.frames().alloc_4k().unwrap();

    let err = kernel
        .map(dir, USER_PAGE + 0x10, frame, PageFlags::USER)
        .unwrap_err();
    assert!(matches!(err, MapError::Unaligned { .. }));
    assert_eq!(kernel.get(dir, USER_PAGE), None);
}

#[test]
fn destroying_a_directory_returns_its_tables() {
    let machine = Machine::boot(1);
    let kernel = machine.kernel;
    let before = kernel.frames().free_frames();

    let dir = kernel.create_directory().unwrap();
    let frame = kernel.frames().alloc_4k().unwrap();
    kernel.map(dir, USER_PAGE, frame, PageFlags::USER).unwrap();
    kernel
        .map(dir, USER_PAGE + 0x0040_0000, frame, PageFlags::USER)
        .unwrap();
    assert_eq!(kernel.frames().free_frames(), before - 4);

    kernel.destroy_directory(dir);
    // Only the mapped frame stays allocated.
    assert_eq!(kernel.frames().free_frames(), before - 1);
}

#[test]
#[should_panic(expected = "attempt to destroy the kernel page directory")]
fn destroying_the_kernel_directory_is_fatal() {
    let machine = Machine::boot(1);
    machine.kernel.destroy_directory(machine.kernel.kernel_directory());
}

#[test]
#[should_panic(expected = "instead of the kernel page tables")]
fn paging_outside_the_kernel_directory_is_fatal() {
    let machine = Machine::boot(1);
    let kernel = machine.kernel;
    let dir = kernel.create_directory().unwrap();
    let frame = kernel.frames().alloc_4k().unwrap();

    kernel.arch().load_page_directory(dir);
    let _ = kernel.map(dir, USER_PAGE, frame, PageFlags::USER);
}

#[test]
#[should_panic(expected = "map while holding the frame allocator lock")]
fn paging_inside_a_frame_batch_is_fatal() {
    let machine = Machine::boot(1);
    let kernel = machine.kernel;
    let dir = kernel.create_directory().unwrap();

    kernel.frames().batch(|batch| {
        let frame = batch.alloc_4k().unwrap();
        let _ = kernel.map(dir, USER_PAGE, frame, PageFlags::USER);
    });
}

#[test]
#[should_panic(expected = "which is below the kernel base")]
fn kp_map_of_a_user_address_is_fatal() {
    let machine = Machine::boot(1);
    let frame = machine.kernel.frames().alloc_4k().unwrap();
    let _ = machine.kernel.kp_map(USER_PAGE, frame, PageFlags::KERNEL);
}

#[test]
fn kp_map_reaches_every_active_cpu_before_returning() {
    let machine = Machine::boot(2);
    let kernel = machine.kernel;
    machine.start();
    machine.wait_until("both cpus active", || kernel.cpus().active_count() == 2);

    let heap = VirtualAddress::new(info::HEAP_BASE);
    let next = heap + 0x1000;
    let a = kernel.frames().alloc_4k().unwrap();
    let b = kernel.frames().alloc_4k().unwrap();

    // The first heap page needs a new page table: whole-TLB flush.
    kernel.kp_map(heap, a, PageFlags::KERNEL).unwrap();
    // The second lands in the same table: single-page invalidation.
    kernel.kp_map(next, b, PageFlags::KERNEL).unwrap();

    for slot in 0..2 {
        let events = machine.sim.tlb_events(slot);
        let flush = events.iter().position(|e| *e == TlbEvent::FlushAll);
        let invalidate = events
            .iter()
            .position(|e| *e == TlbEvent::InvalidatePage(next));
        assert!(flush.is_some(), "cpu{slot}: {events:?}");
        assert!(flush < invalidate, "cpu{slot}: {events:?}");
        assert!(machine.sim.eoi_count(slot) >= 2);
    }

    assert_eq!(kernel.get(kernel.kernel_directory(), next), Some(b));
    assert_eq!(kernel.kp_unmap(next), Some(b));
    assert_eq!(kernel.get(kernel.kernel_directory(), next), None);
    for slot in 0..2 {
        let invalidations = machine
            .sim
            .tlb_events(slot)
            .into_iter()
            .filter(|e| *e == TlbEvent::InvalidatePage(next))
            .count();
        assert_eq!(invalidations, 2, "cpu{slot}");
    }

    machine.power_off();
}

#[test]
fn kernel_mappings_made_before_a_directory_exists_are_shared() {
    let machine = Machine::boot(1);
    let kernel = machine.kernel;
    let heap = VirtualAddress::new(info::HEAP_BASE);
    let frame = kernel.frames().alloc_4k().unwrap();

    kernel.kp_map(heap, frame, PageFlags::KERNEL).unwrap();
    let dir = kernel.create_directory().unwrap();
    assert_eq!(kernel.get(dir, heap), Some(frame));
}

#[test]
fn global_kernel_changes_reach_a_cpu_running_a_process() {
    let machine = Machine::boot(1);
    let kernel = machine.kernel;
    let running = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    let pid = kernel.create_process("spinner").unwrap();
    let dir = kernel.lock_procs().get(pid).unwrap().directory;
    {
        let (running, stop) = (Arc::clone(&running), Arc::clone(&stop));
        kernel
            .spawn_thread(pid, "spin", move || {
                running.store(true, Ordering::SeqCst);
                while !stop.load(Ordering::SeqCst) {
                    kernel.arch().relax();
                }
            })
            .unwrap();
    }
    machine.start();
    machine.wait_until("the process thread", || running.load(Ordering::SeqCst));

    let kernel_pd = kernel.kernel_directory();
    let heap = VirtualAddress::new(info::HEAP_BASE);
    let frame = kernel.frames().alloc_4k().unwrap();

    // New page table: the global entry is refreshed through the kernel
    // directory while cpu0 keeps running in the process directory.
    kernel.kp_map(heap, frame, PageFlags::KERNEL).unwrap();
    let mapped = machine.sim.tlb_events(0);
    assert!(
        mapped.ends_with(&[TlbEvent::LoadDirectory(kernel_pd), TlbEvent::LoadDirectory(dir)]),
        "{mapped:?}"
    );

    // A directory load keeps global entries, so the page itself must go.
    assert_eq!(kernel.kp_unmap(heap), Some(frame));
    let events = machine.sim.tlb_events(0);
    assert_eq!(
        events[mapped.len()..],
        [
            TlbEvent::LoadDirectory(kernel_pd),
            TlbEvent::LoadDirectory(dir),
            TlbEvent::InvalidatePage(heap),
        ],
        "{events:?}"
    );

    stop.store(true, Ordering::SeqCst);
    machine.power_off();
}
