//! muster turns a shared stream of per-document change notifications into
//! coalesced, lifecycle-aware event streams for cluster orchestration state.
//!
//! A deployment is described by documents in a store (machines, services,
//! units, relations, settings) and a process-wide change source (the
//! [`ChangeHub`](source::ChangeHub)) that tails the store's operation log.
//! This crate provides the *watchers*: long-lived tasks that subscribe to
//! the change source, re-read the documents they care about, and deliver
//! entity-scoped events to a consumer.
//!
//! # Guarantees
//!
//! - **Initial event.** The first batch from every watcher reflects the
//!   state at subscription time; incremental batches follow. (Settings
//!   watchers gate the initial event on the document existing.)
//! - **Coalescing.** Changes arriving faster than the consumer reads are
//!   merged into one pending batch; no identifier appears twice in a batch.
//!   Producers never block on a slow consumer.
//! - **Absorbing Dead.** Once a watcher reports an entity with
//!   [`Life::Dead`](life::Life), no later batch from that watcher contains
//!   it.
//! - **Deterministic teardown.** [`stop`](watch::Watcher::stop) drains the
//!   loop, releases its subscriptions and returns the terminal error; after
//!   it returns, [`next`](watch::Watcher::next) yields `None`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use muster::mem::MemStore;
//! use muster::source::ChangeHub;
//! use muster::watch::Watch;
//!
//! # tokio_test::block_on(async {
//! let hub = ChangeHub::spawn();
//! let store = Arc::new(MemStore::new(hub.clone()));
//! let watch = Watch::new(store.clone(), hub.clone());
//!
//! store.add_machine(0).await;
//!
//! let mut machines = watch.machines();
//! // First batch: all machine ids at subscription time
//! let initial = machines.next().await.unwrap();
//! assert_eq!(initial, vec![0]);
//!
//! machines.stop().await.unwrap();
//! # })
//! ```
//!
//! # Observability
//!
//! The crate is instrumented with the [tracing](https://crates.io/crates/tracing)
//! crate: each watcher task runs in its own span, merges log at `trace`,
//! terminations at `debug` and suppressed configuration parse failures at
//! `warn`.

pub mod config;
pub mod errors;
pub mod life;
pub mod mem;
pub mod source;
pub mod store;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EnvironConfig;
pub use errors::{Error, StoreError};
pub use life::Life;
pub use source::{Change, ChangeHub, Collection, Delivery, DocId, Subscription};
pub use store::{
    Endpoint, MachineDoc, RelationDoc, ServiceDoc, Settings, Store, UnitDoc,
};
pub use watch::{
    PrincipalsChange, RelationUnitsChange, ScopeChange, UnitSettings, Watch, Watcher,
};
