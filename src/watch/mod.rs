//! Watcher base and factory
//!
//! Every watcher in this crate is a spawned task structured as one
//! `tokio::select!` loop over three ports: the upstream change subscription,
//! the downstream delivery slot and the halt signal. The loop accumulates a
//! pending batch and only answers delivery requests while the batch is armed,
//! so bursts of upstream notifications coalesce into a single event.
//!
//! Consumers interact through the generic [`Watcher`] handle:
//!
//! - [`next`](Watcher::next) receives the next batch (`None` after
//!   termination),
//! - [`stop`](Watcher::stop) halts the loop and returns its terminal error,
//! - [`err`](Watcher::err) reads the terminal error without blocking.
//!
//! Delivery is a rendezvous: a batch is handed over only to an active
//! `next` call, never parked in a buffer. Whatever accumulates between two
//! reads is merged into one batch.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, debug_span, Instrument};

use crate::errors::Error;
use crate::source::ChangeHub;
use crate::store::{MachineDoc, ServiceDoc, Settings, Store, UnitDoc};
use crate::store::{service_settings_key, ENVIRON_SETTINGS_KEY};
use crate::config::EnvironConfig;

mod collection;
mod entity;
mod machine;
mod relation;
mod settings;

pub use machine::PrincipalsChange;
pub use relation::{RelationUnitsChange, ScopeChange, UnitSettings};

/// One-way halt signal shared between a watcher handle and its loop
///
/// Once raised the signal stays raised; the loop observes it at its next
/// suspension point and tears down.
#[derive(Clone, Default)]
pub(crate) struct Halt {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Halt {
    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until the signal is raised
    pub async fn wait(&self) {
        loop {
            if self.is_raised() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register as a waiter before the final flag check so a
            // concurrent raise cannot slip between check and await
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

type TerminalStatus = Option<Result<(), Error>>;

/// Handle to a running watcher delivering batches of type `T`
///
/// Dropping the handle halts the watcher; [`stop`](Watcher::stop) halts it
/// and reports the terminal error.
pub struct Watcher<T> {
    requests: mpsc::Sender<oneshot::Sender<T>>,
    halt: Halt,
    status: watch::Receiver<TerminalStatus>,
}

impl<T> Watcher<T> {
    /// Receive the next batch
    ///
    /// The first batch is always the initial event, reflecting the state at
    /// subscription time. Returns `None` once the watcher has terminated;
    /// the terminal error is then available through [`err`](Watcher::err)
    /// or [`stop`](Watcher::stop).
    ///
    /// Note that multiple upstream changes may be observed as a single
    /// batch.
    pub async fn next(&mut self) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests.send(reply_tx).await.ok()?;
        reply_rx.await.ok()
    }

    /// Halt the watcher and wait for it to finish
    ///
    /// Blocks until the loop has unsubscribed and released the delivery
    /// channel. Returns the terminal error: `Ok(())` on a clean stop, the
    /// latched loop error otherwise. Idempotent.
    pub async fn stop(&mut self) -> Result<(), Error> {
        self.halt.raise();
        let mut status = self.status.clone();
        loop {
            if let Some(res) = status.borrow_and_update().clone() {
                return res;
            }
            if status.changed().await.is_err() {
                return Err(Error::internal(anyhow!(
                    "watcher task terminated without reporting status"
                )));
            }
        }
    }

    /// The watcher's terminal error
    ///
    /// Returns [`Error::StillAlive`] while the loop is running.
    pub fn err(&self) -> Result<(), Error> {
        match self.status.borrow().clone() {
            Some(res) => res,
            None => Err(Error::StillAlive),
        }
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        self.halt.raise();
    }
}

/// Loop-side ports of a watcher
pub(crate) struct Ports<T> {
    pub requests: mpsc::Receiver<oneshot::Sender<T>>,
    pub halt: Halt,
}

/// Spawn a watcher loop and return its handle
///
/// The loop future receives the ports and must return its terminal error;
/// the result is latched into the status channel the handle observes.
pub(crate) fn spawn<T, F, Fut>(kind: &'static str, f: F) -> Watcher<T>
where
    T: Send + 'static,
    F: FnOnce(Ports<T>) -> Fut,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    let (req_tx, req_rx) = mpsc::channel(1);
    let halt = Halt::default();
    let (status_tx, status_rx) = watch::channel(None);

    let ports = Ports {
        requests: req_rx,
        halt: halt.clone(),
    };
    let fut = f(ports);

    tokio::spawn(
        async move {
            let res = fut.await;
            if let Err(err) = &res {
                debug!(%err, "watcher terminated");
            }
            let _ = status_tx.send(Some(res));
        }
        .instrument(debug_span!("watcher", kind)),
    );

    Watcher {
        requests: req_tx,
        halt,
        status: status_rx,
    }
}

/// Factory for all watchers over one store and change source
///
/// Watchers hold non-owning handles to both; the change source must outlive
/// every watcher created from it.
#[derive(Clone)]
pub struct Watch {
    store: Arc<dyn Store>,
    hub: ChangeHub,
}

impl Watch {
    pub fn new(store: Arc<dyn Store>, hub: ChangeHub) -> Self {
        Watch { store, hub }
    }

    /// Watch a single machine document
    ///
    /// Each change delivers the refreshed machine snapshot. The watcher
    /// terminates with [`Error::NotFound`] if the machine is removed.
    pub fn machine(&self, id: i64) -> Watcher<MachineDoc> {
        entity::machine(self.store.clone(), self.hub.clone(), id)
    }

    /// Watch a single service document
    pub fn service(&self, name: &str) -> Watcher<ServiceDoc> {
        entity::service(self.store.clone(), self.hub.clone(), name.to_string())
    }

    /// Watch a single unit document
    pub fn unit(&self, name: &str) -> Watcher<UnitDoc> {
        entity::unit(self.store.clone(), self.hub.clone(), name.to_string())
    }

    /// Watch lifecycle changes across all machines
    ///
    /// The first batch holds the ids of all machines irrespective of their
    /// life state. Subsequent batches hold machines that were added or
    /// changed lifecycle. After a machine is reported Dead, no further batch
    /// will include it.
    pub fn machines(&self) -> Watcher<Vec<i64>> {
        collection::machines(self.store.clone(), self.hub.clone())
    }

    /// Watch lifecycle changes across all services
    pub fn services(&self) -> Watcher<Vec<String>> {
        collection::services(self.store.clone(), self.hub.clone())
    }

    /// Watch lifecycle changes of the units belonging to a service
    pub fn service_units(&self, service: &str) -> Watcher<Vec<String>> {
        collection::service_units(self.store.clone(), self.hub.clone(), service.to_string())
    }

    /// Watch lifecycle changes of the relations a service participates in
    pub fn service_relations(&self, service: &str) -> Watcher<Vec<i64>> {
        collection::service_relations(self.store.clone(), self.hub.clone(), service.to_string())
    }

    /// Watch assignments and lifecycle changes of all units of a machine,
    /// including subordinates of its principal units
    pub fn machine_units(&self, machine: i64) -> Watcher<Vec<String>> {
        machine::units(self.store.clone(), self.hub.clone(), machine)
    }

    /// Watch principal units being assigned to or removed from a machine
    pub fn machine_principals(&self, machine: i64) -> Watcher<PrincipalsChange> {
        machine::principals(self.store.clone(), self.hub.clone(), machine)
    }

    /// Watch membership of a relation scope
    ///
    /// `scope` identifies the scope; `ignore` names the unit whose own
    /// membership is not reported (the watching unit itself).
    pub fn relation_scope(&self, scope: &str, ignore: &str) -> Watcher<ScopeChange> {
        relation::scope(
            self.store.clone(),
            self.hub.clone(),
            format!("{scope}#"),
            ignore.to_string(),
        )
    }

    /// Watch counterpart units of a relation: scope membership plus their
    /// settings revisions
    pub fn relation_units(&self, scope: &str, ignore: &str) -> Watcher<RelationUnitsChange> {
        relation::units(
            self.store.clone(),
            self.hub.clone(),
            format!("{scope}#"),
            ignore.to_string(),
        )
    }

    /// Watch a settings document
    ///
    /// If the document does not exist yet, the first event is delivered once
    /// it is created.
    pub fn settings(&self, key: &str) -> Watcher<Settings> {
        settings::settings(self.store.clone(), self.hub.clone(), key.to_string())
    }

    /// Watch a service's configuration settings
    pub fn service_config(&self, service: &str) -> Watcher<Settings> {
        settings::settings(
            self.store.clone(),
            self.hub.clone(),
            service_settings_key(service),
        )
    }

    /// Watch the environment configuration
    ///
    /// Settings revisions that fail to parse are suppressed; only valid
    /// configurations are delivered.
    pub fn environ_config(&self) -> Watcher<EnvironConfig> {
        settings::environ_config(
            self.store.clone(),
            self.hub.clone(),
            ENVIRON_SETTINGS_KEY.to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_halt_wakes_waiters() {
        let halt = Halt::default();
        let waiter = halt.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        halt.raise();

        timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn test_halt_wait_returns_immediately_when_raised() {
        let halt = Halt::default();
        halt.raise();
        halt.wait().await;
    }
}
