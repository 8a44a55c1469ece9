use proptest::prelude::*;
use sluice::parallel::{Batch, BatchConfig, Batcher};
use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

fn sizes<T>(batches: &[Batch<T>]) -> Vec<usize> {
    batches.iter().map(Batch::len).collect()
}

#[test]
fn test_ten_items_make_batches_of_four_four_two() {
    let (batcher, batches) =
        Batcher::channel(BatchConfig::new(4, Duration::from_millis(1000))).unwrap();

    let start = Instant::now();
    for i in 0..10 {
        batcher.submit(i).unwrap();
    }

    // The two full batches close on size, well before the wait elapses
    let first = batches.recv_timeout(Duration::from_millis(500)).unwrap();
    let second = batches.recv_timeout(Duration::from_millis(500)).unwrap();
    assert!(start.elapsed() < Duration::from_millis(900));

    // The remainder closes on the timer
    let third = batches.recv_timeout(Duration::from_secs(3)).unwrap();
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(900), "closed after {:?}", waited);
    assert!(waited < Duration::from_secs(3), "closed after {:?}", waited);

    let all = vec![first, second, third];
    assert_eq!(sizes(&all), vec![4, 4, 2]);
    let payloads: Vec<i32> = all
        .iter()
        .flat_map(|batch| batch.items.iter().map(|item| item.payload))
        .collect();
    assert_eq!(payloads, (0..10).collect::<Vec<_>>());

    let stats = batcher.shutdown().unwrap();
    assert_eq!(stats.items, 10);
    assert_eq!(stats.batches, 3);
    assert_eq!(stats.size_triggered, 2);
    assert_eq!(stats.time_triggered, 1);
    assert!(batches.recv().is_err());
}

#[test]
fn test_shutdown_flushes_partial_batch() {
    let (batcher, batches) = Batcher::channel(BatchConfig::new(8, Duration::from_secs(60))).unwrap();
    for name in ["a", "b", "c"] {
        batcher.submit(name.to_string()).unwrap();
    }

    let stats = batcher.shutdown().unwrap();
    assert_eq!(stats.flushed_on_close, 1);

    let batch = batches.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(batch.indices(), vec![0, 1, 2]);
    assert!(batches.recv().is_err());
}

#[test]
fn test_drop_flushes_partial_batch() {
    let (batcher, batches) = Batcher::channel(BatchConfig::new(8, Duration::from_secs(60))).unwrap();
    batcher.submit(1u8).unwrap();
    batcher.submit(2u8).unwrap();
    drop(batcher);

    let batch = batches.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(batch.len(), 2);
}

#[test]
fn test_concurrent_submitters_lose_nothing() {
    let (batcher, batches) =
        Batcher::channel(BatchConfig::new(7, Duration::from_millis(20))).unwrap();

    thread::scope(|scope| {
        for submitter in 0..4 {
            let batcher = &batcher;
            scope.spawn(move || {
                for i in 0..25 {
                    batcher.submit(submitter * 100 + i).unwrap();
                }
            });
        }
    });
    assert_eq!(batcher.submitted(), 100);
    batcher.shutdown().unwrap();

    let received: Vec<Batch<i32>> = batches.iter().collect();
    assert!(received.iter().all(|batch| !batch.is_empty() && batch.len() <= 7));

    let indices: HashSet<usize> = received.iter().flat_map(Batch::indices).collect();
    assert_eq!(indices, (0..100).collect::<HashSet<_>>());
    let payloads: HashSet<i32> = received
        .iter()
        .flat_map(|batch| batch.items.iter().map(|item| item.payload))
        .collect();
    assert_eq!(payloads.len(), 100);
}

#[test]
fn test_zero_batch_size_is_rejected() {
    assert!(Batcher::<u32>::channel(BatchConfig::new(0, Duration::from_millis(10))).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_batches_partition_the_input(n in 0usize..60, k in 1usize..9) {
        let (batcher, batches) =
            Batcher::channel(BatchConfig::new(k, Duration::from_secs(30))).unwrap();
        for i in 0..n {
            batcher.submit(i).unwrap();
        }
        batcher.shutdown().unwrap();

        let received: Vec<Batch<usize>> = batches.iter().collect();
        prop_assert_eq!(received.len(), (n + k - 1) / k);
        prop_assert!(received.iter().all(|batch| batch.len() <= k));

        let indices: Vec<usize> = received.iter().flat_map(Batch::indices).collect();
        prop_assert_eq!(indices, (0..n).collect::<Vec<_>>());
    }
}
