//! Slot table lifecycle: create, move, reflag, delete, and the invariants
//! readers rely on across those transitions.

use std::sync::Arc;

use proptest::prelude::*;
use vmcore::{
    HeapMemory, MemFlags, MemoryRegion, SlotError, Vm, PAGE_SIZE, USER_MEM_SLOTS,
};

const BASE: u64 = 0x7f00_0000_0000;

fn vm(size: usize) -> Vm {
    Vm::new(Arc::new(HeapMemory::new(BASE, size)))
}

fn region(slot: u16, gpa: u64, size: u64, hva: u64, flags: MemFlags) -> MemoryRegion {
    MemoryRegion {
        slot,
        flags,
        guest_phys_addr: gpa,
        memory_size: size,
        userspace_addr: hva,
    }
}

#[test]
fn create_then_delete_round_trip() {
    let vm = vm(0x10000);
    vm.set_memory_region(&region(3, 0x1000, 0x4000, BASE, MemFlags::empty()))
        .unwrap();

    let slots = vm.memslots();
    let slot = slots.slot(3);
    assert_eq!(slot.base_gfn, 1);
    assert_eq!(slot.npages, 4);
    assert!(slots.gfn_to_slot(4).is_some());

    vm.set_memory_region(&region(3, 0, 0, 0, MemFlags::empty()))
        .unwrap();
    let slots = vm.memslots();
    assert!(slots.slot(3).is_empty());
    assert!(slots.gfn_to_slot(4).is_none());
}

#[test]
fn delete_of_an_empty_slot_is_a_no_op() {
    let vm = vm(0x1000);
    let generation = vm.memslots().generation();

    vm.set_memory_region(&region(7, 0, 0, 0, MemFlags::empty()))
        .unwrap();
    assert_eq!(vm.memslots().generation(), generation);
}

#[test]
fn delete_bumps_generation_twice() {
    // The teardown publish (slot invalid) and the final publish are two
    // distinct table replacements.
    let vm = vm(0x10000);
    vm.set_memory_region(&region(0, 0, 0x1000, BASE, MemFlags::empty()))
        .unwrap();
    let before = vm.memslots().generation();

    vm.set_memory_region(&region(0, 0, 0, 0, MemFlags::empty()))
        .unwrap();
    assert_eq!(vm.memslots().generation(), before + 2);
}

#[test]
fn overlapping_create_is_rejected() {
    let vm = vm(0x10000);
    vm.set_memory_region(&region(0, 0x1000, 0x3000, BASE, MemFlags::empty()))
        .unwrap();

    assert_eq!(
        vm.set_memory_region(&region(1, 0x3000, 0x2000, BASE + 0x4000, MemFlags::empty())),
        Err(SlotError::Overlap { id: 0 })
    );
    // Adjacent is fine.
    vm.set_memory_region(&region(1, 0x4000, 0x2000, BASE + 0x4000, MemFlags::empty()))
        .unwrap();
}

#[test]
fn private_slots_are_exempt_from_overlap_and_visibility() {
    let vm = vm(0x10000);
    vm.set_memory_region(&region(
        USER_MEM_SLOTS,
        0x1000,
        0x2000,
        BASE,
        MemFlags::empty(),
    ))
    .unwrap();

    // A user slot may cover the same guest range as a private slot.
    vm.set_memory_region(&region(0, 0x1000, 0x2000, BASE + 0x4000, MemFlags::empty()))
        .unwrap();

    assert!(vm.is_visible_gfn(1));
    vm.set_memory_region(&region(0, 0, 0, 0, MemFlags::empty()))
        .unwrap();
    // Only the private slot remains; the gfn still resolves but is not
    // user-visible.
    assert!(vm.memslots().gfn_to_slot(1).is_some());
    assert!(!vm.is_visible_gfn(1));
}

#[test]
fn move_relocates_and_preserves_dirty_bits() {
    let vm = vm(0x10000);
    vm.set_memory_region(&region(0, 0x1000, 0x2000, BASE, MemFlags::LOG_DIRTY))
        .unwrap();
    vm.write_guest(0x2000, &[1u8]).unwrap();

    let mut log = vec![0u8; 8];
    assert!(vm.get_dirty_log(0, &mut log).unwrap());
    assert_eq!(log[0], 1 << 1);

    // Move the slot up by four pages; the second page's dirty bit rides
    // along.
    vm.set_memory_region(&region(0, 0x5000, 0x2000, BASE, MemFlags::LOG_DIRTY))
        .unwrap();

    let slots = vm.memslots();
    assert_eq!(slots.slot(0).base_gfn, 5);
    assert!(slots.gfn_to_slot(1).is_none());

    log.fill(0);
    assert!(vm.get_dirty_log(0, &mut log).unwrap());
    assert_eq!(log[0], 1 << 1);

    // Bytes moved with the backing, not with the guest address.
    let mut buf = [0u8; 1];
    vm.read_guest(0x6000, &mut buf).unwrap();
    assert_eq!(buf[0], 1);
}

#[test]
fn reflag_toggles_dirty_logging() {
    let vm = vm(0x10000);
    vm.set_memory_region(&region(0, 0, 0x2000, BASE, MemFlags::empty()))
        .unwrap();
    assert_eq!(
        vm.get_dirty_log(0, &mut [0u8; 8]),
        Err(SlotError::NoDirtyLog { id: 0 })
    );

    vm.set_memory_region(&region(0, 0, 0x2000, BASE, MemFlags::LOG_DIRTY))
        .unwrap();
    assert!(!vm.get_dirty_log(0, &mut [0u8; 8]).unwrap());

    vm.write_guest(0, &[1u8]).unwrap();
    assert!(vm.get_dirty_log(0, &mut [0u8; 8]).unwrap());

    // Dropping the flag discards the bitmap; re-enabling starts clean.
    vm.set_memory_region(&region(0, 0, 0x2000, BASE, MemFlags::empty()))
        .unwrap();
    vm.set_memory_region(&region(0, 0, 0x2000, BASE, MemFlags::LOG_DIRTY))
        .unwrap();
    assert!(!vm.get_dirty_log(0, &mut [0u8; 8]).unwrap());
}

#[test]
fn dirty_log_buffer_must_fit() {
    let vm = vm(0x10000);
    vm.set_memory_region(&region(0, 0, 0x2000, BASE, MemFlags::LOG_DIRTY))
        .unwrap();
    assert_eq!(
        vm.get_dirty_log(0, &mut [0u8; 4]),
        Err(SlotError::BufferTooSmall { got: 4, need: 8 })
    );
}

#[test]
fn dirty_log_rejects_private_slot_ids() {
    let vm = vm(0x1000);
    assert_eq!(
        vm.get_dirty_log(USER_MEM_SLOTS, &mut [0u8; 8]),
        Err(SlotError::InvalidId { id: USER_MEM_SLOTS })
    );
}

#[test]
fn in_flight_snapshot_survives_a_delete() {
    let vm = vm(0x10000);
    vm.set_memory_region(&region(0, 0x1000, 0x2000, BASE, MemFlags::empty()))
        .unwrap();
    vm.write_guest(0x1000, b"persist").unwrap();

    let snapshot = vm.memslots();
    vm.set_memory_region(&region(0, 0, 0, 0, MemFlags::empty()))
        .unwrap();

    // The reader's snapshot still resolves the range it took before the
    // delete, and the backing bytes are intact.
    let slot = snapshot.gfn_to_slot(1).unwrap();
    assert_eq!(slot.npages, 2);
    assert!(vm.memslots().gfn_to_slot(1).is_none());
}

proptest! {
    /// No pair of live user slots ever overlaps, no matter what sequence of
    /// region requests was accepted or rejected along the way.
    #[test]
    fn accepted_user_slots_never_overlap(
        requests in proptest::collection::vec(
            (0u16..4, 0u64..32, 0u64..8, any::<bool>()),
            1..24,
        )
    ) {
        let vm = vm(0x10000);
        for (slot, base_page, npages, log_dirty) in requests {
            let flags = if log_dirty { MemFlags::LOG_DIRTY } else { MemFlags::empty() };
            let _ = vm.set_memory_region(&region(
                slot,
                base_page * PAGE_SIZE,
                npages * PAGE_SIZE,
                BASE + base_page * PAGE_SIZE,
                flags,
            ));
        }

        let slots = vm.memslots();
        let live: Vec<_> = slots.iter().collect();
        for (i, a) in live.iter().enumerate() {
            for b in live.iter().skip(i + 1) {
                let disjoint = a.base_gfn + a.npages <= b.base_gfn
                    || b.base_gfn + b.npages <= a.base_gfn;
                prop_assert!(disjoint, "slots {} and {} overlap", a.id, b.id);
            }
        }
    }
}
