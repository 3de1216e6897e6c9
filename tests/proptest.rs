//! Property-based tests: random operation sequences driven against a live
//! model of the heap, checking alignment, disjointness and data survival
//! after every single operation.

use proptest::prelude::*;
use tagalloc::Tagalloc;

/// Number of simultaneously tracked allocations.
const SLOTS: usize = 8;

#[derive(Debug, Clone)]
enum Op {
    Alloc { slot: usize, size: usize },
    Free { slot: usize },
    Resize { slot: usize, size: usize },
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (0..SLOTS, 1usize..2048).prop_map(|(slot, size)| Op::Alloc { slot, size }),
            (0..SLOTS).prop_map(|slot| Op::Free { slot }),
            (0..SLOTS, 0usize..2048).prop_map(|(slot, size)| Op::Resize { slot, size }),
        ],
        1..128,
    )
}

/// A live allocation as the model expects it: where it is, how many bytes
/// the caller asked for, and the byte every one of them was filled with.
#[derive(Debug, Clone, Copy)]
struct Live {
    ptr: usize,
    len: usize,
    fill: u8,
}

fn fill_block(heap: &mut Tagalloc, live: &Live) {
    heap.payload_mut(live.ptr)[..live.len].fill(live.fill);
}

fn assert_contents(heap: &Tagalloc, live: &Live, len: usize) {
    assert!(
        heap.payload(live.ptr)[..len].iter().all(|&b| b == live.fill),
        "allocation at {} lost its contents",
        live.ptr
    );
}

fn assert_disjoint(heap: &Tagalloc, slots: &[Option<Live>]) {
    let mut ranges: Vec<(usize, usize)> = slots
        .iter()
        .flatten()
        .map(|live| (live.ptr, live.ptr + heap.usable_size(live.ptr)))
        .collect();
    ranges.sort_unstable();

    for pair in ranges.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "overlapping payloads: {pair:?}"
        );
    }
}

proptest! {
    #[test]
    fn every_allocation_is_aligned_and_sufficient(
        sizes in prop::collection::vec(1usize..4096, 1..64),
    ) {
        let mut heap = Tagalloc::with_capacity(1 << 20).unwrap();

        for size in sizes {
            let ptr = heap.allocate(size).unwrap();
            prop_assert_eq!(ptr % 8, 0);
            prop_assert!(heap.usable_size(ptr) >= size);
        }
    }

    #[test]
    fn operation_sequences_preserve_heap_invariants(ops in ops()) {
        let _ = env_logger::try_init();

        let mut heap = Tagalloc::with_capacity(1 << 20).unwrap();
        let mut slots: [Option<Live>; SLOTS] = [None; SLOTS];
        let mut next_fill = 1u8;

        for op in ops {
            match op {
                Op::Alloc { slot, size } => {
                    if let Some(old) = slots[slot].take() {
                        assert_contents(&heap, &old, old.len);
                        heap.deallocate(old.ptr);
                    }

                    let ptr = heap.allocate(size).unwrap();
                    prop_assert_eq!(ptr % 8, 0);
                    prop_assert!(heap.usable_size(ptr) >= size);

                    let live = Live { ptr, len: size, fill: next_fill };
                    next_fill = next_fill.wrapping_add(1).max(1);
                    fill_block(&mut heap, &live);
                    slots[slot] = Some(live);
                }
                Op::Free { slot } => {
                    if let Some(live) = slots[slot].take() {
                        assert_contents(&heap, &live, live.len);
                        heap.deallocate(live.ptr);
                    }
                }
                Op::Resize { slot, size } => {
                    let Some(live) = slots[slot].take() else { continue };

                    let Some(ptr) = heap.resize(Some(live.ptr), size) else {
                        prop_assert_eq!(size, 0, "resize failed with plenty of room");
                        continue;
                    };

                    let moved = Live { ptr, ..live };
                    assert_contents(&heap, &moved, live.len.min(size));

                    let resized = Live { ptr, len: size, fill: next_fill };
                    next_fill = next_fill.wrapping_add(1).max(1);
                    fill_block(&mut heap, &resized);
                    slots[slot] = Some(resized);
                }
            }

            assert_disjoint(&heap, &slots);
        }

        // Once everything is freed, immediate coalescing must have folded
        // the whole heap back into a single free block.
        for live in slots.into_iter().flatten() {
            heap.deallocate(live.ptr);
        }
        prop_assert_eq!(heap.free_blocks(), 1);
        prop_assert_eq!(heap.free_bytes(), heap.heap_size() - 4 * 8);
    }
}
