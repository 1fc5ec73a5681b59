//! Property-based tests for the pending operations queue.
//!
//! Whatever the handler outcomes, every enqueued mutation ends up in
//! exactly one place: replayed, dropped at the retry ceiling, or still
//! queued.

use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use repsync_common::Error;
use repsync_storage::MemoryStore;
use repsync_sync::{ManualProbe, NetworkMonitor, NetworkState, PendingOperationsQueue, QueueConfig};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn online_queue(max_retries: u32) -> PendingOperationsQueue {
    let monitor = NetworkMonitor::new(Arc::new(ManualProbe::new(NetworkState::online("wifi"))));
    monitor.start_monitoring().await.unwrap();
    PendingOperationsQueue::new(
        Arc::new(MemoryStore::new()),
        monitor,
        QueueConfig::default().with_max_retries(max_retries),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// before = replayed + dropped + remaining
    #[test]
    fn mutations_are_conserved(
        count in 1usize..12,
        max_retries in 1u32..4,
        outcomes in prop::collection::vec(any::<bool>(), 1..40),
        passes in 1usize..6,
    ) {
        let (replayed, dropped, remaining) = runtime().block_on(async {
            let queue = online_queue(max_retries).await;
            for i in 0..count {
                queue
                    .enqueue("workouts", serde_json::json!({ "n": i }))
                    .await
                    .unwrap();
            }
            let mut dropped_rx = queue.subscribe_dropped();

            let script = Arc::new(Mutex::new(outcomes.into_iter().collect::<VecDeque<bool>>()));
            let replayed = Arc::new(AtomicUsize::new(0));

            for _ in 0..passes {
                let script = script.clone();
                let replayed = replayed.clone();
                queue
                    .process_all(move |_| {
                        let ok = script.lock().unwrap().pop_front().unwrap_or(true);
                        let replayed = replayed.clone();
                        async move {
                            if ok {
                                replayed.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            } else {
                                Err(Error::Network("flaky".to_string()))
                            }
                        }
                    })
                    .await
                    .unwrap();
            }

            let mut dropped = 0;
            while dropped_rx.try_recv().is_ok() {
                dropped += 1;
            }
            (
                replayed.load(Ordering::SeqCst),
                dropped,
                queue.count().await.unwrap(),
            )
        });

        prop_assert_eq!(count, replayed + dropped + remaining);
    }

    /// Retry counts never reach the ceiling while queued.
    #[test]
    fn queued_retry_counts_stay_below_ceiling(
        count in 1usize..8,
        max_retries in 1u32..4,
        failures in 0usize..20,
    ) {
        let counts = runtime().block_on(async {
            let queue = online_queue(max_retries).await;
            for i in 0..count {
                queue.enqueue("friends", serde_json::json!(i)).await.unwrap();
            }

            let budget = Arc::new(AtomicUsize::new(failures));
            for _ in 0..failures + 1 {
                let budget = budget.clone();
                queue
                    .process_next(move |_| {
                        let fail = budget
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                            .is_ok();
                        async move {
                            if fail {
                                Err(Error::Timeout("slow".to_string()))
                            } else {
                                Ok(())
                            }
                        }
                    })
                    .await
                    .unwrap();
            }

            queue
                .all()
                .await
                .unwrap()
                .into_iter()
                .map(|m| m.retry_count)
                .collect::<Vec<_>>()
        });

        prop_assert!(counts.iter().all(|&c| c < max_retries));
    }
}
