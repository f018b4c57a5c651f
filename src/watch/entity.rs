//! Single-document watchers
//!
//! An entity watcher observes one document and delivers the refreshed
//! snapshot on every change. It keeps a single "latest" slot rather than an
//! accumulating batch: coalesced upstream changes overwrite the undelivered
//! snapshot. Disappearance of the entity is fatal.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{Error, StoreError};
use crate::source::{ChangeHub, Collection, DocId};
use crate::store::{MachineDoc, Revisioned, ServiceDoc, Store, UnitDoc};

use super::{spawn, Ports, Watcher};

#[async_trait]
trait EntityView: Send + Sync + 'static {
    type Doc: Revisioned + Clone + Send + Sync + 'static;

    fn collection(&self) -> Collection;

    fn id(&self) -> DocId;

    /// Human-readable entity description used in not-found errors
    fn label(&self) -> String;

    async fn fetch(&self, store: &dyn Store) -> Result<Option<Self::Doc>, StoreError>;
}

struct MachineView(i64);

#[async_trait]
impl EntityView for MachineView {
    type Doc = MachineDoc;

    fn collection(&self) -> Collection {
        Collection::Machines
    }

    fn id(&self) -> DocId {
        DocId::Int(self.0)
    }

    fn label(&self) -> String {
        format!("machine {}", self.0)
    }

    async fn fetch(&self, store: &dyn Store) -> Result<Option<MachineDoc>, StoreError> {
        store.machine(self.0).await
    }
}

struct ServiceView(String);

#[async_trait]
impl EntityView for ServiceView {
    type Doc = ServiceDoc;

    fn collection(&self) -> Collection {
        Collection::Services
    }

    fn id(&self) -> DocId {
        DocId::Str(self.0.clone())
    }

    fn label(&self) -> String {
        format!("service {}", self.0)
    }

    async fn fetch(&self, store: &dyn Store) -> Result<Option<ServiceDoc>, StoreError> {
        store.service(&self.0).await
    }
}

struct UnitView(String);

#[async_trait]
impl EntityView for UnitView {
    type Doc = UnitDoc;

    fn collection(&self) -> Collection {
        Collection::Units
    }

    fn id(&self) -> DocId {
        DocId::Str(self.0.clone())
    }

    fn label(&self) -> String {
        format!("unit {}", self.0)
    }

    async fn fetch(&self, store: &dyn Store) -> Result<Option<UnitDoc>, StoreError> {
        store.unit(&self.0).await
    }
}

pub(crate) fn machine(store: Arc<dyn Store>, hub: ChangeHub, id: i64) -> Watcher<MachineDoc> {
    spawn("machine", move |ports| run(store, hub, MachineView(id), ports))
}

pub(crate) fn service(store: Arc<dyn Store>, hub: ChangeHub, name: String) -> Watcher<ServiceDoc> {
    spawn("service", move |ports| {
        run(store, hub, ServiceView(name), ports)
    })
}

pub(crate) fn unit(store: Arc<dyn Store>, hub: ChangeHub, name: String) -> Watcher<UnitDoc> {
    spawn("unit", move |ports| run(store, hub, UnitView(name), ports))
}

async fn run<V: EntityView>(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    view: V,
    mut ports: Ports<V::Doc>,
) -> Result<(), Error> {
    let doc = view
        .fetch(store.as_ref())
        .await?
        .ok_or_else(|| Error::not_found(view.label()))?;

    let mut sub = hub.subscription();
    hub.watch(view.collection(), view.id(), doc.revno(), &sub);

    // The fetched snapshot is the initial event
    let mut pending = Some(doc);

    let res = loop {
        tokio::select! {
            _ = hub.closed() => break Err(hub.terminal_error()),

            _ = ports.halt.wait() => break Ok(()),

            delivery = sub.recv() => {
                let Some(delivery) = delivery else {
                    break Err(hub.terminal_error());
                };
                let fetched = view.fetch(store.as_ref()).await;
                delivery.ack();
                match fetched {
                    Ok(Some(doc)) => pending = Some(doc),
                    Ok(None) => break Err(Error::not_found(view.label())),
                    Err(err) => break Err(err.into()),
                }
            }

            Some(reply) = ports.requests.recv(), if pending.is_some() => {
                let doc = pending.take().expect("delivery slot armed");
                if let Err(doc) = reply.send(doc) {
                    pending = Some(doc);
                }
            }
        }
    };

    hub.unwatch(view.collection(), view.id(), &sub);
    res
}

#[cfg(test)]
mod tests {
    use crate::errors::Error;
    use crate::life::Life;
    use crate::testing::{assert_no_event, harness};

    #[tokio::test]
    async fn test_unit_watcher_initial_snapshot() {
        let (_hub, store, watch) = harness();
        store.add_service("wordpress").await;
        store.add_unit("wordpress", "wordpress/0", None).await;

        let mut w = watch.unit("wordpress/0");
        let doc = w.next().await.unwrap();
        assert_eq!(doc.name, "wordpress/0");
        assert_eq!(doc.life, Life::Alive);

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unit_watcher_coalesces_to_latest_snapshot() {
        let (_hub, store, watch) = harness();
        store.add_service("wordpress").await;
        store.add_unit("wordpress", "wordpress/0", None).await;

        let mut w = watch.unit("wordpress/0");
        w.next().await.unwrap();

        // Two changes before the consumer reads again: one snapshot, the
        // most recent one
        store.set_unit_address("wordpress/0", "10.0.0.1").await;
        store.set_unit_address("wordpress/0", "10.0.0.2").await;

        let doc = w.next().await.unwrap();
        assert_eq!(doc.public_address.as_deref(), Some("10.0.0.2"));
        assert_no_event(&mut w).await;

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unit_watcher_terminates_on_removal() {
        let (_hub, store, watch) = harness();
        store.add_service("wordpress").await;
        store.add_unit("wordpress", "wordpress/0", None).await;

        let mut w = watch.unit("wordpress/0");
        w.next().await.unwrap();

        store.remove_unit("wordpress/0").await;

        assert!(w.next().await.is_none());
        match w.stop().await {
            Err(Error::NotFound(what)) => assert_eq!(what, "unit wordpress/0"),
            other => panic!("unexpected stop result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unit_watcher_missing_at_start() {
        let (_hub, _store, watch) = harness();

        let mut w = watch.unit("wordpress/0");
        assert!(w.next().await.is_none());
        assert!(matches!(w.stop().await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_machine_watcher_delivers_refreshed_snapshot() {
        let (_hub, store, watch) = harness();
        store.add_machine(0).await;

        let mut w = watch.machine(0);
        assert_eq!(w.next().await.unwrap().life, Life::Alive);

        store.set_machine_life(0, Life::Dying).await;
        assert_eq!(w.next().await.unwrap().life, Life::Dying);

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_service_watcher_err_while_running() {
        let (_hub, store, watch) = harness();
        store.add_service("wordpress").await;

        let mut w = watch.service("wordpress");
        w.next().await.unwrap();

        assert!(matches!(w.err(), Err(Error::StillAlive)));
        w.stop().await.unwrap();
        assert!(w.err().is_ok());
    }

    #[tokio::test]
    async fn test_entity_watcher_source_death() {
        let (hub, store, watch) = harness();
        store.add_machine(0).await;

        let mut w = watch.machine(0);
        w.next().await.unwrap();

        hub.kill("oplog tailer lost connection");

        assert!(w.next().await.is_none());
        assert!(matches!(w.stop().await, Err(Error::SourceClosed(_))));
    }
}
