//! Machine unit watchers
//!
//! [`units`] reports assignments and lifecycle changes for all units of a
//! machine, including subordinates of its principal units. It cross-watches
//! the machine document and every unit it currently knows about, keeping its
//! document subscriptions in lockstep with the known-set.
//!
//! [`principals`] is the simpler variant that only diffs the machine's
//! principal list, reporting added and removed unit snapshots.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::trace;

use crate::errors::Error;
use crate::life::Life;
use crate::source::{ChangeHub, Collection, DocId, Subscription};
use crate::store::{MachineDoc, Store, UnitDoc};

use super::{spawn, Ports, Watcher};

pub(crate) fn units(store: Arc<dyn Store>, hub: ChangeHub, machine: i64) -> Watcher<Vec<String>> {
    spawn("machine_units", move |ports| {
        run_units(store, hub, machine, ports)
    })
}

pub(crate) fn principals(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    machine: i64,
) -> Watcher<PrincipalsChange> {
    spawn("machine_principals", move |ports| {
        run_principals(store, hub, machine, ports)
    })
}

fn push_unique(batch: &mut Vec<String>, name: &str) {
    if !batch.iter().any(|n| n == name) {
        batch.push(name.to_string());
    }
}

struct UnitsTracker {
    store: Arc<dyn Store>,
    hub: ChangeHub,
    machine: i64,
    /// Life last announced per unit; every entry has a matching document
    /// subscription
    known: HashMap<String, Life>,
}

impl UnitsTracker {
    fn missing(&self) -> Error {
        Error::not_found(format!("machine {}", self.machine))
    }

    /// Reconcile against a fresh machine document: merge new principals and
    /// units that disappeared from the principal list
    async fn apply_machine(
        &mut self,
        doc: &MachineDoc,
        batch: &mut Vec<String>,
        sub: &Subscription,
    ) -> Result<(), Error> {
        for name in &doc.principals {
            if !self.known.contains_key(name) {
                self.merge(batch, name.clone(), sub).await?;
            }
        }
        let gone: Vec<String> = self
            .known
            .keys()
            .filter(|name| !doc.principals.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            // An earlier removal in this pass may have dropped the unit
            // already (subordinates go with their principal)
            if self.known.contains_key(&name) {
                self.merge(batch, name, sub).await?;
            }
        }
        Ok(())
    }

    /// Merge one unit (and, transitively, its subordinates) into the batch
    ///
    /// A unit that no longer exists, or no longer references this machine
    /// either directly or through a principal, is treated as removed: it is
    /// unsubscribed, announced unless already Dead, and its known
    /// subordinates are removed along with it.
    async fn merge(
        &mut self,
        batch: &mut Vec<String>,
        name: String,
        sub: &Subscription,
    ) -> Result<(), Error> {
        let mut queue = VecDeque::from([name]);
        while let Some(name) = queue.pop_front() {
            let doc = self.store.unit(&name).await.map_err(Error::from)?;
            let attached = match &doc {
                None => false,
                Some(d) => d.principal.is_some() || d.machine_id == Some(self.machine),
            };

            if !attached {
                if let Some(life) = self.known.remove(&name) {
                    trace!(unit = %name, "unit detached");
                    self.hub.unwatch(Collection::Units, name.as_str(), sub);
                    if !life.is_dead() {
                        push_unique(batch, &name);
                    }
                    if let Some(d) = &doc {
                        for subunit in &d.subordinates {
                            if let Some(sublife) = self.known.remove(subunit) {
                                self.hub.unwatch(Collection::Units, subunit.as_str(), sub);
                                if !sublife.is_dead() {
                                    push_unique(batch, subunit);
                                }
                            }
                        }
                    }
                }
                continue;
            }

            let d = doc.expect("attached unit exists");
            match self.known.get(&name) {
                None => {
                    self.hub.watch(Collection::Units, name.as_str(), d.revno, sub);
                    push_unique(batch, &name);
                }
                Some(old) if *old != d.life => push_unique(batch, &name),
                _ => {}
            }
            self.known.insert(name.clone(), d.life);

            for subunit in &d.subordinates {
                if !self.known.contains_key(subunit) {
                    queue.push_back(subunit.clone());
                }
            }
        }
        Ok(())
    }
}

async fn run_units(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    machine: i64,
    mut ports: Ports<Vec<String>>,
) -> Result<(), Error> {
    let mut tracker = UnitsTracker {
        store: store.clone(),
        hub: hub.clone(),
        machine,
        known: HashMap::new(),
    };

    let doc = store
        .machine(machine)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| tracker.missing())?;

    let mut machine_sub = hub.subscription();
    let mut units_sub = hub.subscription();
    hub.watch(Collection::Machines, machine, doc.revno, &machine_sub);

    let mut batch = Vec::new();
    if let Err(err) = tracker.apply_machine(&doc, &mut batch, &units_sub).await {
        hub.unwatch(Collection::Machines, machine, &machine_sub);
        for name in tracker.known.keys() {
            hub.unwatch(Collection::Units, name.as_str(), &units_sub);
        }
        return Err(err);
    }

    let mut pending = Some(batch);
    let mut sent_initial = false;

    let res = loop {
        tokio::select! {
            _ = hub.closed() => break Err(hub.terminal_error()),

            _ = ports.halt.wait() => break Ok(()),

            delivery = machine_sub.recv() => {
                let Some(delivery) = delivery else {
                    break Err(hub.terminal_error());
                };
                let mut batch = pending.take().unwrap_or_default();
                let merged = match store.machine(machine).await {
                    Err(err) => Err(Error::from(err)),
                    Ok(None) => Err(tracker.missing()),
                    Ok(Some(doc)) => tracker.apply_machine(&doc, &mut batch, &units_sub).await,
                };
                delivery.ack();
                if let Err(err) = merged {
                    break Err(err);
                }
                pending = if !batch.is_empty() || !sent_initial {
                    Some(batch)
                } else {
                    None
                };
            }

            delivery = units_sub.recv() => {
                let Some(delivery) = delivery else {
                    break Err(hub.terminal_error());
                };
                let DocId::Str(name) = delivery.change().id.clone() else {
                    continue;
                };
                let mut batch = pending.take().unwrap_or_default();
                let merged = tracker.merge(&mut batch, name, &units_sub).await;
                delivery.ack();
                if let Err(err) = merged {
                    break Err(err);
                }
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

    hub.unwatch(Collection::Machines, machine, &machine_sub);
    for name in tracker.known.keys() {
        hub.unwatch(Collection::Units, name.as_str(), &units_sub);
    }
    res
}

/// Principal units assigned to or removed from a machine
///
/// The `added` field of the first event holds the machine's current
/// principal units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrincipalsChange {
    pub added: Vec<UnitDoc>,
    pub removed: Vec<UnitDoc>,
}

impl PrincipalsChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

async fn run_principals(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    machine: i64,
    mut ports: Ports<PrincipalsChange>,
) -> Result<(), Error> {
    let missing = || Error::not_found(format!("machine {machine}"));

    let doc = store
        .machine(machine)
        .await
        .map_err(Error::from)?
        .ok_or_else(missing)?;

    let mut sub = hub.subscription();
    hub.watch(Collection::Machines, machine, doc.revno, &sub);

    let mut known: HashMap<String, UnitDoc> = HashMap::new();
    let mut batch = PrincipalsChange::default();
    if let Err(err) = diff_principals(store.as_ref(), &doc, &mut known, &mut batch).await {
        hub.unwatch(Collection::Machines, machine, &sub);
        return Err(err);
    }

    let mut pending = Some(batch);
    let mut sent_initial = false;

    let res = loop {
        tokio::select! {
            _ = hub.closed() => break Err(hub.terminal_error()),

            _ = ports.halt.wait() => break Ok(()),

            delivery = sub.recv() => {
                let Some(delivery) = delivery else {
                    break Err(hub.terminal_error());
                };
                let mut batch = pending.take().unwrap_or_default();
                let merged = match store.machine(machine).await {
                    Err(err) => Err(Error::from(err)),
                    Ok(None) => Err(missing()),
                    Ok(Some(doc)) => {
                        diff_principals(store.as_ref(), &doc, &mut known, &mut batch).await
                    }
                };
                delivery.ack();
                if let Err(err) = merged {
                    break Err(err);
                }
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

    hub.unwatch(Collection::Machines, machine, &sub);
    res
}

async fn diff_principals(
    store: &dyn Store,
    doc: &MachineDoc,
    known: &mut HashMap<String, UnitDoc>,
    batch: &mut PrincipalsChange,
) -> Result<(), Error> {
    for name in &doc.principals {
        if known.contains_key(name) {
            continue;
        }
        // A principal whose document is not readable yet is skipped until
        // the next notification
        let Some(unit) = store.unit(name).await.map_err(Error::from)? else {
            continue;
        };
        known.insert(name.clone(), unit.clone());
        batch.added.push(unit);
    }
    let gone: Vec<String> = known
        .keys()
        .filter(|name| !doc.principals.contains(*name))
        .cloned()
        .collect();
    for name in gone {
        let unit = known.remove(&name).expect("known principal");
        batch.removed.push(unit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::life::Life;
    use crate::testing::{assert_no_event, harness, sorted};

    #[tokio::test]
    async fn test_machine_units_principals_and_subordinates() {
        let (_hub, store, watch) = harness();
        store.add_machine(0).await;
        store.add_service("svc").await;
        store.add_service("sub").await;
        store.add_unit("svc", "svc/0", Some(0)).await;
        store.add_subordinate("sub", "sub/0", "svc/0").await;

        let mut w = watch.machine_units(0);
        assert_eq!(
            sorted(w.next().await.unwrap()),
            vec!["sub/0".to_string(), "svc/0".to_string()]
        );

        // Subordinate dies: announced once, then absorbed
        store.set_unit_life("sub/0", Life::Dead).await;
        assert_eq!(w.next().await.unwrap(), vec!["sub/0".to_string()]);
        store.set_unit_address("sub/0", "10.0.0.9").await;
        assert_no_event(&mut w).await;

        // Unassigning the principal announces it and silently drops the
        // dead subordinate
        store.unassign_unit("svc/0").await;
        assert_eq!(w.next().await.unwrap(), vec!["svc/0".to_string()]);
        assert_no_event(&mut w).await;

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_machine_units_initial_event_when_empty() {
        let (_hub, store, watch) = harness();
        store.add_machine(0).await;

        let mut w = watch.machine_units(0);
        assert_eq!(w.next().await.unwrap(), Vec::<String>::new());

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_machine_units_lifecycle_change() {
        let (_hub, store, watch) = harness();
        store.add_machine(0).await;
        store.add_service("svc").await;
        store.add_unit("svc", "svc/0", Some(0)).await;

        let mut w = watch.machine_units(0);
        assert_eq!(w.next().await.unwrap(), vec!["svc/0".to_string()]);

        store.set_unit_life("svc/0", Life::Dying).await;
        assert_eq!(w.next().await.unwrap(), vec!["svc/0".to_string()]);

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_machine_units_late_assignment() {
        let (_hub, store, watch) = harness();
        store.add_machine(0).await;
        store.add_service("svc").await;
        store.add_unit("svc", "svc/1", None).await;

        let mut w = watch.machine_units(0);
        assert_eq!(w.next().await.unwrap(), Vec::<String>::new());

        store.assign_unit("svc/1", 0).await;
        assert_eq!(w.next().await.unwrap(), vec!["svc/1".to_string()]);

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_machine_principals_diff() {
        let (_hub, store, watch) = harness();
        store.add_machine(0).await;
        store.add_service("svc").await;
        store.add_unit("svc", "svc/0", Some(0)).await;

        let mut w = watch.machine_principals(0);
        let first = w.next().await.unwrap();
        assert_eq!(first.added.len(), 1);
        assert_eq!(first.added[0].name, "svc/0");
        assert!(first.removed.is_empty());

        store.add_unit("svc", "svc/1", Some(0)).await;
        let second = w.next().await.unwrap();
        assert_eq!(second.added.len(), 1);
        assert_eq!(second.added[0].name, "svc/1");

        store.unassign_unit("svc/0").await;
        let third = w.next().await.unwrap();
        assert!(third.added.is_empty());
        assert_eq!(third.removed.len(), 1);
        assert_eq!(third.removed[0].name, "svc/0");

        w.stop().await.unwrap();
    }
}
