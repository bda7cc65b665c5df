use std::collections::VecDeque;
use std::sync::Arc;

use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stagecoach::gpu::NullBackend;
use stagecoach::{Allocator, Region, StagingRing};

fn ring(size: u64) -> StagingRing<NullBackend> {
    let allocator = Allocator::new(Arc::new(NullBackend::default()));
    StagingRing::new(&allocator, size).unwrap()
}

#[test]
fn queued_request_is_granted_once_space_is_released() {
    let ring = ring(1024);
    assert_eq!(ring.capacity(), 1024);

    let first = ring.enqueue_allocation(700).now_or_never().unwrap().unwrap();
    assert_eq!(first.offset(), 0);
    assert_eq!(first.size(), 700);

    let mut second = ring.enqueue_allocation(500);
    assert!(second.is_queued());
    assert_eq!(ring.poll_pending(), 0);
    assert!((&mut second).now_or_never().is_none());

    drop(first);
    assert_eq!(ring.poll_pending(), 1);
    let second = second.now_or_never().unwrap().unwrap();
    assert_eq!(second.offset(), 0);
    assert_eq!(second.size(), 500);
}

#[test]
fn later_small_request_never_overtakes_an_earlier_one() {
    let ring = ring(1024);
    let held = ring.enqueue_allocation(1000).now_or_never().unwrap().unwrap();

    let mut big = ring.enqueue_allocation(600);
    // Would fit in what is left, but must wait behind `big`.
    let mut small = ring.enqueue_allocation(10);
    assert!(big.is_queued());
    assert!(small.is_queued());
    assert_eq!(ring.pending_count(), 2);

    assert_eq!(ring.poll_pending(), 0);
    assert!((&mut small).now_or_never().is_none());

    drop(held);
    assert_eq!(ring.poll_pending(), 2);
    let big = (&mut big).now_or_never().unwrap().unwrap();
    let small = (&mut small).now_or_never().unwrap().unwrap();
    assert_eq!(big.offset(), 0);
    assert!(small.offset() >= 600);
    assert_eq!(ring.stats().granted_total, 3);
}

#[test]
fn polling_with_nothing_pending_is_a_no_op() {
    let ring = ring(2048);
    let before = ring.stats();
    assert_eq!(ring.poll_pending(), 0);
    assert_eq!(ring.poll_pending(), 0);
    assert_eq!(ring.stats(), before);
    assert_eq!(before.pending, 0);
    assert_eq!(before.free_bytes, 2048);
}

fn assert_disjoint(live: &[Region<NullBackend>]) {
    let mut ranges: Vec<(u64, u64)> = live.iter().map(|r| (r.offset(), r.size())).collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (a_off, a_len) = pair[0];
        let (b_off, _) = pair[1];
        assert!(
            a_off + a_len <= b_off,
            "regions [{}, {}) and [{}, ..) overlap",
            a_off,
            a_off + a_len,
            b_off
        );
    }
}

#[test]
fn random_interleavings_keep_regions_disjoint_and_ordered() {
    let mut rng = StdRng::seed_from_u64(0x5747_4743);
    let ring = ring(4096);
    let mut live: Vec<Region<NullBackend>> = Vec::new();
    let mut waiting = VecDeque::new();

    for _ in 0..2000 {
        match rng.gen_range(0..10) {
            0..=3 => {
                let size = rng.gen_range(1..=1024);
                let mut fut = ring.enqueue_allocation(size);
                if fut.is_queued() {
                    waiting.push_back(fut);
                } else {
                    live.push((&mut fut).now_or_never().unwrap().unwrap());
                }
            }
            4..=6 if !live.is_empty() => {
                let idx = rng.gen_range(0..live.len());
                live.swap_remove(idx);
            }
            _ => {
                ring.poll_pending();
            }
        }

        // Granted requests must always form a prefix of the queue.
        while let Some(front) = waiting.front_mut() {
            match front.now_or_never() {
                Some(region) => {
                    live.push(region.unwrap());
                    waiting.pop_front();
                }
                None => break,
            }
        }
        for later in waiting.iter_mut() {
            assert!(later.now_or_never().is_none(), "request granted out of order");
        }

        assert_disjoint(&live);
        let used: u64 = live.iter().map(|r| r.size()).sum();
        assert!(used <= ring.capacity());
    }

    live.clear();
    while !waiting.is_empty() {
        assert!(ring.poll_pending() > 0);
        while let Some(front) = waiting.front_mut() {
            match front.now_or_never() {
                Some(region) => {
                    drop(region.unwrap());
                    waiting.pop_front();
                }
                None => break,
            }
        }
    }
    assert_eq!(ring.stats().free_bytes, 4096);
}
