//! Awaiting promises from async code

mod common;

use std::future::IntoFuture;
use std::time::Duration;

use rust_deferred::{all, block_on, race, Deferred, Outcome, Promise, Reason};

#[tokio::test]
async fn test_await_inline_promise() {
    common::setup_tracing();
    assert_eq!(Promise::resolved(3u32).await, Outcome::Resolved(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_await_promise_settled_by_tokio_task() {
    common::setup_tracing();
    let (deferred, promise) = Deferred::<String>::new();

    let producer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        deferred.resolve("ready".to_string()).unwrap();
    });

    assert_eq!(promise.await, Outcome::Resolved("ready".to_string()));
    producer.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_await_combinator_settled_from_threads() {
    common::setup_tracing();
    let (deferreds, promises) = common::pending::<u32>(8);
    let parent = all(promises).unwrap();

    let producers: Vec<_> = deferreds
        .into_iter()
        .enumerate()
        .map(|(index, deferred)| {
            std::thread::spawn(move || deferred.resolve(index as u32).unwrap())
        })
        .collect();

    assert_eq!(parent.await, Outcome::Resolved((0..8).collect()));
    for producer in producers {
        producer.join().unwrap();
    }
}

#[tokio::test]
async fn test_await_rejection() {
    common::setup_tracing();
    let (deferred, promise) = Deferred::<u32>::new();
    let chained = promise.then(|v| v * 2).unwrap();

    deferred.reject(Reason::msg("refused")).unwrap();
    assert_eq!(chained.await, Outcome::rejected_with("refused"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_race_against_tokio_timer() {
    common::setup_tracing();
    let (slow, slow_promise) = Deferred::<&'static str>::new();
    let (timeout, timeout_promise) = Deferred::<&'static str>::new();
    let winner = race(vec![slow_promise, timeout_promise]).unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        timeout.resolve("timeout").unwrap();
    });

    assert_eq!(winner.await, Outcome::Resolved("timeout"));
    slow.resolve("slow").unwrap();
}

#[test]
fn test_block_on_promise() {
    common::setup_tracing();
    let (deferred, promise) = Deferred::<u64>::new();
    let producer = std::thread::spawn(move || deferred.resolve(64).unwrap());

    assert_eq!(block_on(promise.into_future()), Outcome::Resolved(64));
    producer.join().unwrap();
}

#[test]
fn test_dropped_future_reports_unobserved_rejection() {
    common::setup_tracing();
    let (pool, seen) = common::recording_pool::<u32>();
    let (deferred, promise) = Deferred::new_in(&pool);

    let future = promise.into_future();
    drop(future);
    deferred.reject(Reason::msg("nobody listening")).unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(pool.idle(), 1);
}
