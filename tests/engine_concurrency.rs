#![allow(missing_docs)]

mod common;

use common::test_helpers::FakeHttpError;
use redoubt::{Command, CommandEngine, CommandError, IsolationMode, PoolPolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn slow_command(
    name: &str,
    pool: PoolPolicy,
    isolation: IsolationMode,
    concurrent: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
) -> Command<u32, FakeHttpError> {
    Command::builder()
        .name(name)
        .uri("http://api.example.com")
        .pool(pool)
        .isolation(isolation)
        .max_attempts(1)
        .callback(move |_ctx, _base| {
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(80)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(1)
            }
        })
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_slot_pool_rejects_second_parallel_submission() {
    let engine = CommandEngine::new();
    let pool = PoolPolicy { core_size: 1, max_queue_size: 0, queue_rejection_threshold: 0 };
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let command = slow_command(
        "SingleSlot",
        pool,
        IsolationMode::Pool,
        concurrent.clone(),
        peak.clone(),
    );

    let first = engine.enqueue(command.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = engine.enqueue(command.clone());

    let (a, b) = tokio::join!(first, second);
    assert!(a.is_ok());
    match b.unwrap_err() {
        CommandError::PoolRejected { in_flight, max } => {
            assert_eq!(max, 1);
            assert_eq!(in_flight, 1);
        }
        e => panic!("expected PoolRejected, got {e:?}"),
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_wave_never_exceeds_core_size() {
    let engine = CommandEngine::new();
    let pool = PoolPolicy { core_size: 3, max_queue_size: 0, queue_rejection_threshold: 0 };
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let command =
        slow_command("Wave", pool, IsolationMode::Pool, concurrent.clone(), peak.clone());

    let handles: Vec<_> = (0..12).map(|_| engine.enqueue(command.clone())).collect();
    let results = futures::future::join_all(handles).await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(CommandError::PoolRejected { .. })))
        .count();

    assert!(peak.load(Ordering::SeqCst) <= 3, "peak {}", peak.load(Ordering::SeqCst));
    assert_eq!(admitted + rejected, 12);
    assert!(admitted >= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_submissions_run_after_slots_free() {
    let engine = CommandEngine::new();
    let pool = PoolPolicy { core_size: 1, max_queue_size: 2, queue_rejection_threshold: 2 };
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let command =
        slow_command("Queued", pool, IsolationMode::Pool, concurrent.clone(), peak.clone());

    // Three submissions: one runs, two queue; all eventually succeed.
    let handles: Vec<_> = (0..3).map(|_| engine.enqueue(command.clone())).collect();
    let results = futures::future::join_all(handles).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn semaphore_isolation_bounds_without_queue() {
    let engine = CommandEngine::new();
    // Queue options are ignored under semaphore isolation.
    let pool = PoolPolicy { core_size: 2, max_queue_size: 50, queue_rejection_threshold: 50 };
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let command = slow_command(
        "SemaphoreMode",
        pool,
        IsolationMode::Semaphore,
        concurrent.clone(),
        peak.clone(),
    );

    let handles: Vec<_> = (0..8).map(|_| engine.enqueue(command.clone())).collect();
    let results = futures::future::join_all(handles).await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(CommandError::PoolRejected { .. })))
        .count();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(admitted + rejected, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slots_release_after_completion() {
    let engine = CommandEngine::new();
    let pool = PoolPolicy { core_size: 1, max_queue_size: 0, queue_rejection_threshold: 0 };
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let command =
        slow_command("Release", pool, IsolationMode::Pool, concurrent.clone(), peak.clone());

    // Sequential submissions reuse the single slot.
    for _ in 0..3 {
        assert!(engine.execute(&command).await.is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_rejections_feed_breaker_statistics() {
    let engine = CommandEngine::new();
    let pool = PoolPolicy { core_size: 1, max_queue_size: 0, queue_rejection_threshold: 0 };
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let command =
        slow_command("Counted", pool, IsolationMode::Pool, concurrent.clone(), peak.clone());

    let first = engine.enqueue(command.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = engine.enqueue(command.clone());
    let _ = tokio::join!(first, second);

    let breaker = engine.breaker("Counted").unwrap();
    assert_eq!(breaker.metrics().rejected, 1);
}
