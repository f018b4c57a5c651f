//! Shared helpers for the crate's tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::mem::MemStore;
use crate::source::ChangeHub;
use crate::watch::{Watch, Watcher};

pub(crate) fn init() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_names(true),
        )
        .with(EnvFilter::from_default_env())
        .try_init()
        .unwrap_or(());
}

/// A hub, an in-memory store feeding it, and a watcher factory over both
pub(crate) fn harness() -> (ChangeHub, Arc<MemStore>, Watch) {
    init();
    let hub = ChangeHub::spawn();
    let store = Arc::new(MemStore::new(hub.clone()));
    let watch = Watch::new(store.clone(), hub.clone());
    (hub, store, watch)
}

/// Assert that no batch is delivered within a short grace period
pub(crate) async fn assert_no_event<T>(watcher: &mut Watcher<T>) {
    assert!(
        timeout(Duration::from_millis(50), watcher.next()).await.is_err(),
        "expected no event"
    );
}

pub(crate) fn sorted<T: Ord>(mut items: Vec<T>) -> Vec<T> {
    items.sort();
    items
}

pub(crate) fn settings_map(entries: &[(&str, i64)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect()
}
