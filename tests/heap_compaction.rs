//! Heap compaction tests
//!
//! Builds fragmented arenas by hand and checks that relocation produces the
//! expected layout, keeps pinned blocks in place and preserves block contents.

use assetheap::{BlockLocation, BlockState, Heap, HeapError, HeapHandle};

fn fill(heap: &mut Heap, handle: HeapHandle, byte: u8) {
    heap.lock(handle).unwrap();
    heap.data_mut(handle).unwrap().fill(byte);
    heap.unlock(handle).unwrap();
}

fn check(heap: &mut Heap, handle: HeapHandle, byte: u8, len: usize) {
    heap.lock(handle).unwrap();
    let data = heap.data(handle).unwrap();
    assert!(data[..len].iter().all(|&b| b == byte), "block {} lost its contents", handle);
    heap.unlock(handle).unwrap();
}

#[test]
fn test_compaction_joins_fragmented_extent() {
    // 4096 + 4 byte arena
    let mut heap = Heap::new(4096).unwrap();

    let a0 = heap.allocate(200, false).unwrap();
    let a1 = heap.allocate(200, false).unwrap();
    let a2 = heap.allocate(200, false).unwrap();
    let a3 = heap.allocate(200, false).unwrap();
    let pin = heap.allocate(200, false).unwrap();
    let t1 = heap.allocate(300, false).unwrap();
    let t2 = heap.allocate(2400, false).unwrap();

    fill(&mut heap, a1, 0xA1);
    fill(&mut heap, a3, 0xA3);
    fill(&mut heap, pin, 0x99);
    fill(&mut heap, t2, 0x72);

    assert_eq!(heap.lock(pin).unwrap(), BlockLocation::Arena { offset: 880 });

    heap.deallocate(a0).unwrap();
    heap.deallocate(a2).unwrap();
    heap.deallocate(t1).unwrap();

    // Free blocks: 200, 200, 300 and a 240 byte tail; none holds 860 bytes,
    // but the run in front of the pinned block does once a1 and a3 move out.
    let big = heap.allocate(860, false).unwrap();

    assert_eq!(heap.location(big).unwrap(), BlockLocation::Arena { offset: 0 });
    assert_eq!(heap.state(big).unwrap(), BlockState::Movable);
    assert_eq!(heap.counters().system_blocks, 0);
    assert_eq!(heap.counters().free_blocks, 0);

    // Leftovers below the split size were absorbed by the new homes.
    assert_eq!(heap.block_size(a1).unwrap(), 240);
    assert_eq!(heap.block_size(a3).unwrap(), 300);

    assert_eq!(heap.location(pin).unwrap(), BlockLocation::Arena { offset: 880 });
    assert_eq!(heap.data(pin).unwrap(), &[0x99u8; 200][..]);
    heap.unlock(pin).unwrap();

    check(&mut heap, a1, 0xA1, 200);
    check(&mut heap, a3, 0xA3, 200);
    check(&mut heap, t2, 0x72, 2400);

    assert!(heap.validate().is_ok());
}

#[test]
fn test_locked_blocks_bound_extents() {
    let mut heap = Heap::new(1024).unwrap();

    let a = heap.allocate(300, false).unwrap();
    let b = heap.allocate(300, false).unwrap();
    let c = heap.allocate(300, false).unwrap();

    heap.lock(b).unwrap();
    heap.deallocate(a).unwrap();
    heap.deallocate(c).unwrap();

    // Each side of the pinned block is too small on its own.
    assert!(matches!(
        heap.allocate(400, false),
        Err(HeapError::AllocationFailed { size: 400 })
    ));

    let spill = heap.allocate(400, true).unwrap();
    assert_eq!(heap.location(spill).unwrap(), BlockLocation::System);
    assert_eq!(heap.counters().system_size, 400);
    assert!(heap.validate().is_ok());

    heap.unlock(b).unwrap();
    let joined = heap.allocate(400, false);
    assert!(joined.is_err(), "b has nowhere to go, so the extent cannot be emptied");

    heap.deallocate(b).unwrap();
    let joined = heap.allocate(400, false).unwrap();
    assert_eq!(heap.location(joined).unwrap(), BlockLocation::Arena { offset: 0 });
    assert!(heap.validate().is_ok());
}

#[test]
fn test_pinned_blocks_survive_repeated_compaction() {
    // Leaves a tail of a few hundred bytes once all blocks are in.
    let mut heap = Heap::new(9216).unwrap();

    let mut pinned = Vec::new();
    let mut movable = Vec::new();
    for i in 0..24u8 {
        let handle = heap.allocate(256 + i as usize * 8, false).unwrap();
        fill(&mut heap, handle, i);
        if i % 6 == 5 {
            let at = heap.lock(handle).unwrap();
            pinned.push((handle, i, at));
        } else {
            movable.push((handle, i));
        }
    }

    // Punch holes so that later requests need relocation.
    let mut survivors = Vec::new();
    for (n, (handle, byte)) in movable.into_iter().enumerate() {
        if n % 2 == 0 {
            heap.deallocate(handle).unwrap();
        } else {
            survivors.push((handle, byte));
        }
    }

    for round in 0..6 {
        if let Ok(handle) = heap.allocate(600 + round * 64, false) {
            fill(&mut heap, handle, 0xEE);
            survivors.push((handle, 0xEE));
        }

        for &(handle, byte, at) in &pinned {
            assert_eq!(heap.location(handle).unwrap(), at);
            assert!(heap.data(handle).unwrap().iter().all(|&b| b == byte));
        }
        assert!(heap.validate().is_ok());
    }

    for (handle, byte) in survivors {
        heap.lock(handle).unwrap();
        let len = heap.block_size(handle).unwrap().min(256);
        assert!(heap.data(handle).unwrap()[..len].iter().all(|&b| b == byte));
        heap.unlock(handle).unwrap();
    }
}

#[test]
fn test_system_blocks_never_move() {
    let mut heap = Heap::new(1024).unwrap();
    let fill_arena = heap.allocate(1000, false).unwrap();

    let spilled = heap.allocate(512, true).unwrap();
    fill(&mut heap, spilled, 0x5E);
    heap.deallocate(fill_arena).unwrap();

    let _arena = heap.allocate(600, false).unwrap();

    assert_eq!(heap.state(spilled).unwrap(), BlockState::System);
    check(&mut heap, spilled, 0x5E, 512);
    assert!(heap.validate().is_ok());
}
