#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use rust_deferred::{Config, Deferred, NodePool, Promise, UncaughtRejection, Value};

static INIT: Once = Once::new();

/// Sets up the tracing subscriber for tests, ensuring it's only initialized once.
pub fn setup_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// `n` pending promises with their producers
pub fn pending<T: Value>(n: usize) -> (Vec<Deferred<T>>, Vec<Promise<T>>) {
    (0..n).map(|_| Deferred::new()).unzip()
}

/// A private pool whose uncaught rejections are collected instead of logged
pub fn recording_pool<T: Value>() -> (Arc<NodePool<T>>, Arc<Mutex<Vec<UncaughtRejection>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let config = Config::builder()
        .on_uncaught_rejection(move |rejection| sink.lock().unwrap().push(rejection))
        .build();
    (NodePool::with_config(config), seen)
}
