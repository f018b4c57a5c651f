//! Lifecycle collection watchers
//!
//! These watchers observe a whole collection and report the identifiers of
//! entities that were added or changed lifecycle. All four variants
//! (machines, services, a service's units, a service's relations) share one
//! merge core; they differ only in how change keys are filtered and how
//! documents are looked up, which the [`LifecycleView`] trait captures.
//!
//! The first batch holds every in-scope identifier irrespective of life
//! state. After an entity is reported Dead it is never announced again.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::errors::{Error, StoreError};
use crate::life::Life;
use crate::source::{ChangeHub, Collection, DocId, REMOVED};
use crate::store::Store;

use super::{spawn, Ports, Watcher};

#[async_trait]
pub(crate) trait LifecycleView: Send + Sync + 'static {
    /// Key the change stream identifies documents by
    type Key: Eq + Hash + Clone + Send + Sync;
    /// Identifier reported to the consumer
    type Id: PartialEq + Clone + Send + Sync + 'static;

    fn collection(&self) -> Collection;

    /// Filter a change-stream id down to a key, or ignore it
    fn key_for(&self, id: &DocId) -> Option<Self::Key>;

    /// All in-scope documents at subscription time
    async fn initial(&self, store: &dyn Store)
        -> Result<Vec<(Self::Key, Self::Id, Life)>, StoreError>;

    /// Look up one document; `Ok(None)` means removed
    async fn lookup(
        &self,
        store: &dyn Store,
        key: &Self::Key,
    ) -> Result<Option<(Self::Id, Life)>, StoreError>;
}

struct MachinesView;

#[async_trait]
impl LifecycleView for MachinesView {
    type Key = i64;
    type Id = i64;

    fn collection(&self) -> Collection {
        Collection::Machines
    }

    fn key_for(&self, id: &DocId) -> Option<i64> {
        id.as_int()
    }

    async fn initial(&self, store: &dyn Store) -> Result<Vec<(i64, i64, Life)>, StoreError> {
        Ok(store
            .machines()
            .await?
            .into_iter()
            .map(|doc| (doc.id, doc.id, doc.life))
            .collect())
    }

    async fn lookup(&self, store: &dyn Store, key: &i64) -> Result<Option<(i64, Life)>, StoreError> {
        Ok(store.machine(*key).await?.map(|doc| (doc.id, doc.life)))
    }
}

struct ServicesView;

#[async_trait]
impl LifecycleView for ServicesView {
    type Key = String;
    type Id = String;

    fn collection(&self) -> Collection {
        Collection::Services
    }

    fn key_for(&self, id: &DocId) -> Option<String> {
        id.as_str().map(str::to_string)
    }

    async fn initial(&self, store: &dyn Store) -> Result<Vec<(String, String, Life)>, StoreError> {
        Ok(store
            .services()
            .await?
            .into_iter()
            .map(|doc| (doc.name.clone(), doc.name, doc.life))
            .collect())
    }

    async fn lookup(
        &self,
        store: &dyn Store,
        key: &String,
    ) -> Result<Option<(String, Life)>, StoreError> {
        Ok(store.service(key).await?.map(|doc| (doc.name, doc.life)))
    }
}

struct ServiceUnitsView {
    service: String,
    /// `"{service}/"`: unit names of the service share this prefix
    prefix: String,
}

#[async_trait]
impl LifecycleView for ServiceUnitsView {
    type Key = String;
    type Id = String;

    fn collection(&self) -> Collection {
        Collection::Units
    }

    fn key_for(&self, id: &DocId) -> Option<String> {
        id.as_str()
            .filter(|name| name.starts_with(&self.prefix))
            .map(str::to_string)
    }

    async fn initial(&self, store: &dyn Store) -> Result<Vec<(String, String, Life)>, StoreError> {
        Ok(store
            .service_units(&self.service)
            .await?
            .into_iter()
            .map(|doc| (doc.name.clone(), doc.name, doc.life))
            .collect())
    }

    async fn lookup(
        &self,
        store: &dyn Store,
        key: &String,
    ) -> Result<Option<(String, Life)>, StoreError> {
        Ok(store.unit(key).await?.map(|doc| (doc.name, doc.life)))
    }
}

struct ServiceRelationsView {
    service: String,
    /// `"{service}:"` at the start of the relation key
    head: String,
    /// `" {service}:"` anywhere later in the relation key
    tail: String,
}

#[async_trait]
impl LifecycleView for ServiceRelationsView {
    type Key = String;
    type Id = i64;

    fn collection(&self) -> Collection {
        Collection::Relations
    }

    fn key_for(&self, id: &DocId) -> Option<String> {
        id.as_str()
            .filter(|key| key.starts_with(&self.head) || key.contains(&self.tail))
            .map(str::to_string)
    }

    async fn initial(&self, store: &dyn Store) -> Result<Vec<(String, i64, Life)>, StoreError> {
        Ok(store
            .service_relations(&self.service)
            .await?
            .into_iter()
            .map(|doc| (doc.key, doc.id, doc.life))
            .collect())
    }

    async fn lookup(
        &self,
        store: &dyn Store,
        key: &String,
    ) -> Result<Option<(i64, Life)>, StoreError> {
        Ok(store.relation(key).await?.map(|doc| (doc.id, doc.life)))
    }
}

pub(crate) fn machines(store: Arc<dyn Store>, hub: ChangeHub) -> Watcher<Vec<i64>> {
    spawn("machines", move |ports| run(store, hub, MachinesView, ports))
}

pub(crate) fn services(store: Arc<dyn Store>, hub: ChangeHub) -> Watcher<Vec<String>> {
    spawn("services", move |ports| run(store, hub, ServicesView, ports))
}

pub(crate) fn service_units(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    service: String,
) -> Watcher<Vec<String>> {
    let view = ServiceUnitsView {
        prefix: format!("{service}/"),
        service,
    };
    spawn("service_units", move |ports| run(store, hub, view, ports))
}

pub(crate) fn service_relations(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    service: String,
) -> Watcher<Vec<i64>> {
    let view = ServiceRelationsView {
        head: format!("{service}:"),
        tail: format!(" {service}:"),
        service,
    };
    spawn("service_relations", move |ports| {
        run(store, hub, view, ports)
    })
}

struct Tracker<V: LifecycleView> {
    view: V,
    /// Last life value announced per in-scope entity. Dead entries stay in
    /// the map as tombstones until the document is removed, so a Dead
    /// entity is never announced twice and its removal is silent.
    known: HashMap<V::Key, (V::Id, Life)>,
}

impl<V: LifecycleView> Tracker<V> {
    async fn initial(&mut self, store: &dyn Store) -> Result<Vec<V::Id>, StoreError> {
        let mut ids = Vec::new();
        for (key, id, life) in self.view.initial(store).await? {
            ids.push(id.clone());
            self.known.insert(key, (id, life));
        }
        Ok(ids)
    }

    async fn merge(
        &mut self,
        store: &dyn Store,
        batch: &mut Vec<V::Id>,
        key: V::Key,
        revno: i64,
    ) -> Result<(), StoreError> {
        if revno == REMOVED {
            if let Some((id, life)) = self.known.remove(&key) {
                if !life.is_dead() {
                    push_unique(batch, id);
                }
            }
            return Ok(());
        }
        match self.view.lookup(store, &key).await? {
            Some((id, life)) => match self.known.get(&key) {
                Some((_, old)) if *old == life => {}
                // An unknown entity is announced whatever its life; a
                // known one only when its life changed
                _ => {
                    self.known.insert(key, (id.clone(), life));
                    push_unique(batch, id);
                }
            },
            None => {
                if let Some((id, life)) = self.known.remove(&key) {
                    if !life.is_dead() {
                        push_unique(batch, id);
                    }
                }
            }
        }
        Ok(())
    }
}

fn push_unique<I: PartialEq>(batch: &mut Vec<I>, id: I) {
    if !batch.contains(&id) {
        batch.push(id);
    }
}

async fn run<V: LifecycleView>(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    view: V,
    mut ports: Ports<Vec<V::Id>>,
) -> Result<(), Error> {
    let collection = view.collection();
    let mut sub = hub.subscription();
    hub.watch_collection(collection, &sub);

    let mut tracker = Tracker {
        view,
        known: HashMap::new(),
    };

    // The initial batch is armed even when empty
    let mut pending = match tracker.initial(store.as_ref()).await {
        Ok(ids) => Some(ids),
        Err(err) => {
            hub.unwatch_collection(collection, &sub);
            return Err(err.into());
        }
    };
    let mut sent_initial = false;

    let res = loop {
        tokio::select! {
            _ = hub.closed() => break Err(hub.terminal_error()),

            _ = ports.halt.wait() => break Ok(()),

            delivery = sub.recv() => {
                let Some(delivery) = delivery else {
                    break Err(hub.terminal_error());
                };
                let Some(key) = tracker.view.key_for(&delivery.change().id) else {
                    continue;
                };
                let revno = delivery.change().revno;
                let mut batch = pending.take().unwrap_or_default();
                let merged = tracker.merge(store.as_ref(), &mut batch, key, revno).await;
                delivery.ack();
                if let Err(err) = merged {
                    break Err(err.into());
                }
                trace!(pending = batch.len(), "merged change");
                pending = if !batch.is_empty() || !sent_initial {
                    Some(batch)
                } else {
                    None
                };
            }

            Some(reply) = ports.requests.recv(), if pending.is_some() => {
                let batch = pending.take().expect("delivery slot armed");
                if let Err(batch) = reply.send(batch) {
                    pending = Some(batch);
                } else {
                    sent_initial = true;
                }
            }
        }
    };

    hub.unwatch_collection(collection, &sub);
    res
}
