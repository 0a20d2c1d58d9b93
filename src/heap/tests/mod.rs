use std::env;
use std::ops::Deref;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::arena::FIRST_CHUNK;
use crate::bins::{bin_index, BIN_COUNT, NIL};
use crate::growers::arena_grower::ArenaGrower;
use crate::growers::BrkGrower;
use crate::header::{usable_size, MAPPED, PREV_IN_USE};
use crate::large::MMAP_THRESHOLD;

use super::*;


const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// A heap over a private buffer, so tests neither touch the program break
/// nor disturb each other.
struct TestHeap {
    heap: Heap<ArenaGrower>,
    _buf: Vec<u128>,
}

impl TestHeap {
    fn new(bytes: usize) -> Self {
        format::init_logging();
        let mut buf = vec![0_u128; bytes / 16];
        let grower = ArenaGrower::new(buf.as_mut_ptr().cast(), bytes, 0);
        TestHeap {
            heap: unsafe { Heap::with_grower(grower) },
            _buf: buf,
        }
    }
}

impl Deref for TestHeap {
    type Target = Heap<ArenaGrower>;

    fn deref(&self) -> &Self::Target {
        &self.heap
    }
}

/// Walks every pooled chunk and every bin and checks that they agree with each other.
unsafe fn assert_consistent(heap: &Heap<ArenaGrower>) {
    let state = heap.state();
    let mem = &state.arena.mem;
    let top = state.arena.top();
    if mem.extent() == 0 {
        return;
    }

    let mut chunk = FIRST_CHUNK;
    let mut prev_free = false;
    let mut walked_free = 0;
    while chunk < top {
        let header = mem.header(chunk);
        let size = header.size();
        assert!(header.is_well_formed(), "bad header {header:?} at {chunk}");
        assert!(size >= MIN_CHUNK_SIZE, "undersized chunk at {chunk}");
        assert!(!header.is_mapped(), "mapped bit in arena chunk at {chunk}");
        assert_eq!(header.prev_in_use(), !prev_free, "stale PREV_IN_USE at {chunk}");
        assert!(mem.starts.contains(chunk), "unrecorded chunk start {chunk}");
        assert_eq!(
            mem.starts.last_at_or_before(chunk + size - ALIGNMENT),
            Some(chunk),
            "recorded start inside the chunk at {chunk}"
        );

        let free = !mem.header(chunk + size).prev_in_use();
        if free {
            assert!(!prev_free, "adjacent free chunks at {chunk}");
            assert_eq!(mem.word(chunk + size - HEADER_SIZE), size, "boundary tag at {chunk}");
            walked_free += size;
        }
        prev_free = free;
        chunk += size;
    }
    assert_eq!(chunk, top, "chunks overrun the top");
    assert!(!prev_free, "free chunk left next to the top");
    assert_eq!(mem.header(top).size(), state.arena.top_size());
    assert!(mem.starts.contains(top), "unrecorded top");
    assert_eq!(mem.starts.last_at_or_before(mem.extent()), Some(top));

    let mut binned = 0;
    for idx in 0..BIN_COUNT {
        let mut p = state.bins.head(idx).unwrap_or(NIL);
        let mut bwd = NIL;
        while p != NIL {
            let size = mem.header(p).size();
            assert_eq!(bin_index(size), idx, "chunk {p} filed in the wrong bin");
            assert!(!mem.header(p + size).prev_in_use(), "binned chunk {p} in use");
            assert_eq!(mem.word(p + 2 * HEADER_SIZE), bwd, "broken back link at {p}");
            binned += size;
            bwd = p;
            p = mem.word(p + HEADER_SIZE);
        }
    }
    assert_eq!(binned, walked_free);
    assert_eq!(binned, state.bins.free_bytes());
}

#[test]
fn chunk_sizes_and_flags() {
    let heap = TestHeap::new(MIB);
    for size in 0..2 * KIB {
        unsafe {
            let p = heap.allocate(size);
            assert!(!p.is_null());
            assert_eq!(p as usize % ALIGNMENT, 0);

            let header = header_at(p);
            assert_eq!(header.size(), MIN_CHUNK_SIZE.max((size + HEADER_SIZE + 15) & !15));
            assert_eq!(header.flags(), PREV_IN_USE);
            assert!(heap.usable_size(p) >= size);
            heap.release(p);
        }
    }
    unsafe { assert_consistent(&heap) };
}

#[test]
fn zero_sized_allocations_are_distinct() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let ptrs: Vec<_> = (0..64).map(|_| heap.allocate(0)).collect();
        for w in ptrs.windows(2) {
            assert!(!w[0].is_null());
            assert!(w[1] as usize >= w[0] as usize + MIN_CHUNK_SIZE - HEADER_SIZE);
        }
        for p in ptrs {
            heap.release(p);
        }
        assert_consistent(&heap);
    }
}

#[test]
fn freed_chunk_is_reused_first() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let _guard = heap.allocate(16);
        for size in [1, 24, 100, 500, 1000, 3000, 60_000] {
            let p = heap.allocate(size);
            let fence = heap.allocate(16);
            heap.release(p);
            assert_eq!(heap.allocate(size), p, "size {size}");
            heap.release(p);
            heap.release(fence);
        }
        assert_consistent(&heap);
    }
}

#[test]
fn neighbors_coalesce() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let p: Vec<_> = (0..4).map(|_| heap.allocate(1024)).collect();
        assert_eq!(header_at(p[0]).size(), 1040);

        heap.release(p[1]);
        assert_eq!(heap.allocate(1024), p[1]);

        heap.release(p[1]);
        heap.release(p[0]);
        heap.release(p[2]);
        assert_eq!(heap.stats().binned_bytes, 3 * 1040);
        assert_consistent(&heap);

        // All three were merged into one chunk starting at p[0].
        assert_eq!(heap.allocate(2048), p[0]);
        assert_consistent(&heap);
    }
}

#[test]
fn release_next_to_top_returns_memory_to_it() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let a = heap.allocate(100);
        let top_bytes = heap.stats().top_bytes;
        let b = heap.allocate(200);
        heap.release(b);
        assert_eq!(heap.stats().top_bytes, top_bytes);
        assert_eq!(heap.stats().binned_bytes, 0);

        heap.release(a);
        assert_eq!(heap.stats().top_bytes, heap.stats().arena_bytes - ALIGNMENT);
        assert_consistent(&heap);
    }
}

#[test]
fn reuse_does_not_grow_the_arena() {
    let heap = TestHeap::new(4 * MIB);
    unsafe {
        let mut ptrs: Vec<_> = (1..1000).map(|size| heap.allocate(size)).collect();
        let grown = heap.stats().growth_events;
        assert!(grown > 0);

        for p in ptrs.drain(..) {
            heap.release(p);
        }
        ptrs = (1..1000).rev().map(|size| heap.allocate(size)).collect();
        assert_eq!(heap.stats().growth_events, grown);
        assert_consistent(&heap);

        for p in ptrs.drain(..) {
            heap.release(p);
        }
        let small: Vec<_> = (1..500).map(|size| heap.allocate(size)).collect();
        let _fence = heap.allocate(16);
        let grown = heap.stats().growth_events;
        for p in small {
            heap.release(p);
        }
        // One coalesced free chunk now sits below the fence.
        assert!(heap.stats().binned_bytes >= 150 * usable_size(700).unwrap());
        for _ in 0..150 {
            assert!(!heap.allocate(700).is_null());
        }
        assert_eq!(heap.stats().growth_events, grown);
        assert_consistent(&heap);
    }
}

#[test]
fn growth_is_amortized() {
    let heap = TestHeap::new(16 * MIB);
    unsafe {
        for size in 1..5000 {
            assert!(!heap.allocate(size).is_null());
        }
        let stats = heap.stats();
        assert!(stats.growth_events <= 100, "{stats:?}");
        assert!(stats.arena_bytes >= (1..5000).sum::<usize>());
        assert_consistent(&heap);
    }
}

#[test]
fn failed_growth_keeps_the_heap_usable() {
    let heap = TestHeap::new(256 * KIB);
    unsafe {
        let mut ptrs = vec![];
        loop {
            let p = heap.allocate(4000);
            if p.is_null() {
                break;
            }
            p.write_bytes(0x5A, 4000);
            ptrs.push(p);
        }
        assert!(ptrs.len() > 32);
        let stats = heap.stats();
        assert_eq!(stats.arena_bytes, 256 * KIB);
        assert_consistent(&heap);

        // Small requests can still be served from what is left of the top.
        assert!(!heap.allocate(16).is_null());

        let victim = ptrs[ptrs.len() / 2];
        heap.release(victim);
        assert_eq!(heap.allocate(4000), victim);
        assert!(ptrs.iter().all(|&p| *p == 0x5A || p == victim));
        assert_consistent(&heap);
    }
}

#[test]
fn large_requests_are_mapped() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let big = heap.allocate(2 * MIB);
        let small = heap.allocate(1040);
        assert!(!big.is_null() && !small.is_null());
        assert_eq!(big as usize % ALIGNMENT, 0);
        assert_eq!(small as usize % ALIGNMENT, 0);

        assert_ne!(header_at(big).raw() & MAPPED, 0);
        assert_eq!(header_at(small).raw() & MAPPED, 0);
        assert_eq!(heap.stats().mapped_blocks, 1);
        assert!(heap.usable_size(big) >= 2 * MIB);
        assert!(heap.check(big).is_ok());

        // Everything below the threshold stays in the arena.
        let below = heap.allocate(MMAP_THRESHOLD - 2 * ALIGNMENT);
        assert_eq!(header_at(below).raw() & MAPPED, 0);
        heap.release(below);

        big.write_bytes(0xCD, 2 * MIB);
        heap.release(big);
        assert_eq!(heap.stats().mapped_blocks, 0);
        assert!(heap.check(big).is_err());
        heap.release(small);
        assert_consistent(&heap);
    }
}

#[test]
fn resize_within_the_same_bucket_keeps_the_pointer() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let p = heap.allocate(1024);
        p.write_bytes(0xA5, 1024);
        assert_eq!(heap.resize(p, 1030), p);
        assert!((0..1024).all(|i| *p.add(i) == 0xA5));

        for size in 1..1000 {
            let q = heap.allocate(size);
            let byte = size as u8;
            q.write_bytes(byte, size);
            let rounded = size + (8 - size % 8) % 8;
            assert_eq!(heap.resize(q, rounded), q, "size {size}");
            assert!((0..size).all(|i| *q.add(i) == byte), "contents lost at size {size}");
            heap.release(q);
        }
        heap.release(p);
        assert_consistent(&heap);
    }
}

#[test]
fn resize_shrinks_in_place() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let p = heap.allocate(1024);
        let _fence = heap.allocate(16);
        p.write_bytes(b'x', 1024);

        assert_eq!(heap.resize(p, 50), p);
        assert_eq!(header_at(p).size(), 64);
        assert!((0..50).all(|i| *p.add(i) == b'x'));
        // The tail went back to a bin.
        assert_eq!(heap.stats().binned_bytes, 1040 - 64);
        assert_consistent(&heap);

        // The freed tail is too small to grow into, so this one moves.
        let q = heap.resize(p, 2000);
        assert!(heap.usable_size(q) >= 2000);
        assert!((0..50).all(|i| *q.add(i) == b'x'));
        assert_consistent(&heap);
    }
}

#[test]
fn resize_grows_in_place_when_there_is_room() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let a = heap.allocate(64);
        let b = heap.allocate(64);
        let c = heap.allocate(64);
        a.write_bytes(1, 64);

        heap.release(b);
        assert_eq!(heap.resize(a, 100), a);
        assert!((0..64).all(|i| *a.add(i) == 1));
        assert_consistent(&heap);

        // c borders the top chunk.
        assert_eq!(heap.resize(c, 4000), c);
        assert_eq!(header_at(c).size(), usable_size(4000).unwrap());
        assert_consistent(&heap);
    }
}

#[test]
fn resize_moves_and_preserves_contents() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let array = heap.allocate(7 * 8).cast::<usize>();
        let other = heap.allocate(100);
        for i in 0..7 {
            *array.add(i) = 0xffff_ffff_ffff_fff0 + i;
        }
        other.write_bytes(b'o', 100);

        let moved = heap.resize(array.cast(), 11 * 8).cast::<usize>();
        assert!(!moved.is_null());
        assert_ne!(moved, array);
        for i in 0..7 {
            assert_eq!(*moved.add(i), 0xffff_ffff_ffff_fff0 + i);
        }
        assert!((0..100).all(|i| *other.add(i) == b'o'));
        assert_eq!(heap.check(array.cast()), Err(Corruption::DoubleFree));
        assert_consistent(&heap);
    }
}

#[test]
fn resize_edge_cases() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let p = heap.resize(null_mut(), 40);
        assert!(!p.is_null());
        assert!(heap.usable_size(p) >= 40);

        // Failure leaves the original allocation alone.
        p.write_bytes(7, 40);
        assert!(heap.resize(p, usize::MAX).is_null());
        assert!(heap.check(p).is_ok());
        assert!((0..40).all(|i| *p.add(i) == 7));

        assert!(heap.resize(p, 0).is_null());
        assert_eq!(heap.check(p), Err(Corruption::DoubleFree));
        assert_consistent(&heap);
    }
}

#[test]
fn resize_mapped_blocks() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let p = heap.allocate(200 * KIB);
        p.write_bytes(3, 200 * KIB);

        assert_eq!(heap.resize(p, 150 * KIB), p);
        assert!(heap.usable_size(p) >= 150 * KIB);

        let small = heap.resize(p, 100);
        assert_ne!(small, p);
        assert_eq!(header_at(small).raw() & MAPPED, 0);
        assert!((0..100).all(|i| *small.add(i) == 3));
        assert_eq!(heap.stats().mapped_blocks, 0);

        let big = heap.resize(small, 3 * MIB);
        assert_ne!(header_at(big).raw() & MAPPED, 0);
        assert!((0..100).all(|i| *big.add(i) == 3));
        heap.release(big);
        assert_eq!(heap.stats().mapped_blocks, 0);
        assert_consistent(&heap);
    }
}

#[test]
fn zero_allocate_clears_reused_memory() {
    let heap = TestHeap::new(MIB);
    unsafe {
        for round in 0..100_u8 {
            let dirty = heap.allocate(256);
            dirty.write_bytes(0xFF, 256);
            heap.release(dirty);

            let p = heap.zero_allocate(256, 1);
            assert_eq!(p, dirty);
            assert!((0..256).all(|i| *p.add(i) == 0));
            p.write_bytes(round, 256);
            assert!((0..256).all(|i| *p.add(i) == round));
            heap.release(p);
        }

        let big = heap.zero_allocate(1024, 1024);
        assert!((0..MIB).all(|i| *big.add(i) == 0));
        heap.release(big);

        assert!(heap.zero_allocate(usize::MAX, 2).is_null());
        assert!(heap.zero_allocate(2, usize::MAX).is_null());
        assert_consistent(&heap);
    }
}

#[test]
fn check_classifies_bad_pointers() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let a = heap.allocate(64);
        let b = heap.allocate(64);
        let _fence = heap.allocate(64);

        assert_eq!(heap.check(a.add(4)), Err(Corruption::InvalidPointer));
        #[repr(align(16))]
        struct Local([u8; 16]);
        let local = Local([0; 16]);
        assert_eq!(
            heap.check(local.0.as_ptr()),
            Err(Corruption::InvalidPointer)
        );

        heap.release(b);
        assert_eq!(heap.check(b), Err(Corruption::DoubleFree));
        // b is swallowed by a and no longer starts a chunk.
        heap.release(a);
        assert_eq!(heap.check(a), Err(Corruption::DoubleFree));
        assert_eq!(heap.check(b), Err(Corruption::DoubleFree));
        assert_eq!(heap.usable_size(b), 0);
        assert_consistent(&heap);
    }
}

#[test]
fn check_rejects_pointers_into_live_payloads() {
    let heap = TestHeap::new(MIB);
    unsafe {
        // Payload words that happen to look like a well-formed header.
        let p = heap.allocate(100);
        let words = p.cast::<usize>();
        for i in 0..100 / 8 {
            *words.add(i) = 33;
        }
        assert_eq!(heap.check(p.add(16)), Err(Corruption::InvalidPointer));
        assert_eq!(heap.check(p.add(32)), Err(Corruption::InvalidPointer));

        // A zeroed payload must not pass for a released chunk either.
        let z = heap.zero_allocate(100, 1);
        assert_eq!(heap.check(z.add(16)), Err(Corruption::InvalidPointer));

        // Nor a forged header sized to fit inside the payload.
        *words.add(1) = 48 | PREV_IN_USE;
        assert_eq!(heap.check(p.add(16)), Err(Corruption::InvalidPointer));

        // The real allocations are untouched by all of the above.
        assert_eq!(heap.check(p), Ok(()));
        assert_eq!(heap.check(z), Ok(()));
        heap.release(p);
        heap.release(z);
        assert_consistent(&heap);
    }
}

#[test]
fn global_alloc_interface() {
    let heap = TestHeap::new(MIB);
    unsafe {
        let layout = Layout::from_size_align(100, 16).unwrap();
        let p = heap.alloc(layout);
        assert!(!p.is_null());
        let q = heap.realloc(p, layout, 300);
        assert!(heap.usable_size(q) >= 300);
        heap.dealloc(q, Layout::from_size_align(300, 16).unwrap());

        let z = heap.alloc_zeroed(layout);
        assert!((0..100).all(|i| *z.add(i) == 0));
        heap.dealloc(z, layout);

        let over_aligned = Layout::from_size_align(64, 64).unwrap();
        assert!(heap.alloc(over_aligned).is_null());
        assert_consistent(&heap);
    }
}

#[test]
fn random_churn() {
    let heap = TestHeap::new(8 * MIB);
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut live: Vec<(*mut u8, usize, u8)> = vec![];

    unsafe {
        for round in 0..20_000_u32 {
            let fill = round as u8;
            match rng.gen_range(0..10) {
                0..=3 if !live.is_empty() => {
                    let (p, size, byte) = live.swap_remove(rng.gen_range(0..live.len()));
                    assert!((0..size).all(|i| *p.add(i) == byte));
                    heap.release(p);
                }
                4..=5 if !live.is_empty() => {
                    let idx = rng.gen_range(0..live.len());
                    let (p, size, byte) = live[idx];
                    let new_size = rng.gen_range(1..4000);
                    let q = heap.resize(p, new_size);
                    assert!(!q.is_null());
                    assert!((0..size.min(new_size)).all(|i| *q.add(i) == byte));
                    q.write_bytes(fill, new_size);
                    live[idx] = (q, new_size, fill);
                }
                _ => {
                    let size = match rng.gen_ratio(1, 50) {
                        true => rng.gen_range(MMAP_THRESHOLD..4 * MMAP_THRESHOLD),
                        false => rng.gen_range(0..3000),
                    };
                    let p = heap.allocate(size);
                    assert!(!p.is_null());
                    assert_eq!(p as usize % ALIGNMENT, 0);
                    p.write_bytes(fill, size);
                    live.push((p, size, fill));
                }
            }
            if round % 1000 == 0 {
                assert_consistent(&heap);
            }
        }

        for (p, size, byte) in live.drain(..) {
            assert!((0..size).all(|i| *p.add(i) == byte));
            heap.release(p);
        }
        assert_consistent(&heap);
        let stats = heap.stats();
        assert_eq!(stats.mapped_blocks, 0);
        assert_eq!(stats.binned_bytes, 0);
        assert_eq!(stats.top_bytes, stats.arena_bytes - ALIGNMENT);
    }
}

//---------------Fatal paths, run in a child process---------------//

const CHILD_ENV: &str = "BINNED_MALLOC_DEATH_TEST";

fn in_child() -> bool {
    env::var_os(CHILD_ENV).is_some()
}

/// Reruns the single test `name` in a fresh copy of the test binary.
fn run_child(name: &str) -> Output {
    Command::new(env::current_exe().unwrap())
        .args([name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap()
}

fn assert_aborted(output: &Output, message: &str) {
    assert_eq!(output.status.signal(), Some(libc::SIGABRT), "{output:?}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(message), "{stderr}");
}

#[test]
fn invalid_release_aborts() {
    if in_child() {
        let heap = TestHeap::new(MIB);
        unsafe {
            let p = heap.allocate(100);
            heap.release(p.add(4));
        }
        return;
    }
    let output = run_child("heap::tests::invalid_release_aborts");
    assert_aborted(&output, "invalid pointer");
}

#[test]
fn double_release_aborts() {
    if in_child() {
        let heap = TestHeap::new(MIB);
        unsafe {
            let p = heap.allocate(100);
            let _fence = heap.allocate(100);
            heap.release(p);
            heap.release(p);
        }
        return;
    }
    let output = run_child("heap::tests::double_release_aborts");
    assert_aborted(&output, "double free");
}

#[test]
fn resize_of_released_pointer_aborts() {
    if in_child() {
        let heap = TestHeap::new(MIB);
        unsafe {
            let p = heap.allocate(100);
            heap.release(p);
            heap.resize(p, 200);
        }
        return;
    }
    let output = run_child("heap::tests::resize_of_released_pointer_aborts");
    assert_aborted(&output, "double free");
}

#[test]
fn release_of_interior_pointer_aborts() {
    if in_child() {
        let heap = TestHeap::new(MIB);
        unsafe {
            let p = heap.allocate(100);
            *p.add(8).cast::<usize>() = 48 | PREV_IN_USE;
            heap.release(p.add(16));
        }
        return;
    }
    let output = run_child("heap::tests::release_of_interior_pointer_aborts");
    assert_aborted(&output, "invalid pointer");
}

#[test]
fn foreign_break_movement_stops_growth() {
    if in_child() {
        format::init_logging();
        let heap = unsafe { Heap::with_grower(BrkGrower::new(0)) };
        unsafe {
            let p = heap.allocate(100);
            assert!(!p.is_null());
            assert_eq!(heap.stats().growth_events, 1);

            assert_ne!(libc::sbrk(4096) as isize, -1);

            // The first block still fits the top, the second would need the break.
            let q = heap.allocate(100 * KIB);
            assert!(!q.is_null());
            assert!(heap.allocate(100 * KIB).is_null());
            assert_eq!(heap.stats().growth_events, 1);

            let r = heap.allocate(100);
            assert!(!r.is_null());
            heap.release(r);
            heap.release(q);
            heap.release(p);
        }
        return;
    }
    let output = run_child("heap::tests::foreign_break_movement_stops_growth");
    assert!(output.status.success(), "{output:?}");
}
