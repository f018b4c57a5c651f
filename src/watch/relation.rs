//! Relation scope and relation unit watchers
//!
//! Scope membership documents are keyed `<scope>#<unit>`; the unit name is
//! the segment after the last `#`. A [`scope`] watcher reports units
//! entering and leaving one scope, never reporting the watching unit itself.
//! A [`units`] watcher composes a scope watcher with per-unit settings
//! subscriptions to report joined/changed/departed counterparts together
//! with their settings revisions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::{Map, Value};
use tracing::trace;

use crate::errors::Error;
use crate::source::{ChangeHub, Collection, DocId, Subscription, REMOVED};
use crate::store::Store;

use super::{spawn, Ports, Watcher};

/// Units that entered or left a relation scope
///
/// The `entered` field of the first event holds the initial membership.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeChange {
    pub entered: Vec<String>,
    pub left: Vec<String>,
}

impl ScopeChange {
    pub fn is_empty(&self) -> bool {
        self.entered.is_empty() && self.left.is_empty()
    }
}

/// A unit's relation settings as last read: version plus content
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSettings {
    pub version: i64,
    pub settings: Map<String, Value>,
}

/// Changes to the counterpart units of a relation
///
/// When a counterpart enters scope it is noted in `joined` and its settings
/// appear in `changed`. Subsequent settings changes are noted in `changed`
/// alone. When it leaves, it is noted in `departed` and no further events
/// mention it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationUnitsChange {
    pub joined: Vec<String>,
    pub changed: HashMap<String, UnitSettings>,
    pub departed: Vec<String>,
}

impl RelationUnitsChange {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.changed.is_empty() && self.departed.is_empty()
    }
}

/// The unit name encoded in a scope document key
fn unit_name(key: &str) -> &str {
    key.rsplit('#').next().unwrap_or(key)
}

pub(crate) fn scope(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    prefix: String,
    ignore: String,
) -> Watcher<ScopeChange> {
    spawn("relation_scope", move |ports| {
        run_scope(store, hub, prefix, ignore, ports)
    })
}

fn merge_scope_change(
    known: &mut HashSet<String>,
    batch: &mut ScopeChange,
    prefix: &str,
    ignore: &str,
    key: &str,
    revno: i64,
) {
    if !key.starts_with(prefix) {
        return;
    }
    let name = unit_name(key);
    if name == ignore {
        return;
    }
    if revno == REMOVED {
        if known.remove(name) {
            batch.left.push(name.to_string());
        }
    } else if known.insert(name.to_string()) {
        batch.entered.push(name.to_string());
    }
}

async fn run_scope(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    prefix: String,
    ignore: String,
    mut ports: Ports<ScopeChange>,
) -> Result<(), Error> {
    let mut sub = hub.subscription();
    hub.watch_collection(Collection::RelationScopes, &sub);

    let mut known = HashSet::new();
    let mut initial = ScopeChange::default();
    match store.scope_members(&prefix).await {
        Ok(keys) => {
            for key in keys {
                let name = unit_name(&key);
                if name != ignore && known.insert(name.to_string()) {
                    initial.entered.push(name.to_string());
                }
            }
        }
        Err(err) => {
            hub.unwatch_collection(Collection::RelationScopes, &sub);
            return Err(err.into());
        }
    }

    // The initial membership is delivered even when empty
    let mut pending = Some(initial);
    let mut sent_initial = false;

    let res = loop {
        tokio::select! {
            _ = hub.closed() => break Err(hub.terminal_error()),

            _ = ports.halt.wait() => break Ok(()),

            delivery = sub.recv() => {
                let Some(delivery) = delivery else {
                    break Err(hub.terminal_error());
                };
                let DocId::Str(key) = delivery.change().id.clone() else {
                    continue;
                };
                let revno = delivery.change().revno;
                delivery.ack();
                let mut batch = pending.take().unwrap_or_default();
                merge_scope_change(&mut known, &mut batch, &prefix, &ignore, &key, revno);
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

    hub.unwatch_collection(Collection::RelationScopes, &sub);
    res
}

pub(crate) fn units(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    prefix: String,
    ignore: String,
) -> Watcher<RelationUnitsChange> {
    let scope_watcher = scope(store.clone(), hub.clone(), prefix.clone(), ignore);
    spawn("relation_units", move |ports| {
        run_units(store, hub, prefix, scope_watcher, ports)
    })
}

/// Read a unit's settings node and record it in the `changed` map
///
/// Returns the settings version for subscription bookkeeping.
async fn merge_settings(
    store: &dyn Store,
    changes: &mut RelationUnitsChange,
    key: &str,
) -> Result<i64, Error> {
    let settings = store
        .settings(key)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::not_found(format!("settings {key}")))?;
    let version = settings.version;
    changes.changed.insert(
        unit_name(key).to_string(),
        UnitSettings {
            version,
            settings: settings.map,
        },
    );
    Ok(version)
}

/// Start and stop settings subscriptions for units entering and leaving the
/// scope, applying the transitions to the pending change
async fn merge_scope(
    store: &dyn Store,
    hub: &ChangeHub,
    prefix: &str,
    updates: &Subscription,
    watching: &mut HashSet<String>,
    changes: &mut RelationUnitsChange,
    delta: ScopeChange,
) -> Result<(), Error> {
    for name in delta.entered {
        let key = format!("{prefix}{name}");
        let version = merge_settings(store, changes, &key).await?;
        changes.joined.push(name.clone());
        changes.departed.retain(|n| n != &name);
        hub.watch(Collection::Settings, key.as_str(), version, updates);
        watching.insert(key);
    }
    for name in delta.left {
        let key = format!("{prefix}{name}");
        changes.departed.push(name.clone());
        changes.changed.remove(&name);
        changes.joined.retain(|n| n != &name);
        hub.unwatch(Collection::Settings, key.as_str(), updates);
        watching.remove(&key);
    }
    Ok(())
}

async fn run_units(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    prefix: String,
    mut scope: Watcher<ScopeChange>,
    mut ports: Ports<RelationUnitsChange>,
) -> Result<(), Error> {
    let mut updates = hub.subscription();
    let mut watching: HashSet<String> = HashSet::new();
    let mut changes = RelationUnitsChange::default();
    let mut armed = false;
    let mut sent_initial = false;

    let res = loop {
        tokio::select! {
            _ = hub.closed() => break Err(hub.terminal_error()),

            _ = ports.halt.wait() => break Ok(()),

            delta = scope.next() => {
                let Some(delta) = delta else {
                    break Err(match scope.stop().await {
                        Err(err) => err,
                        Ok(()) => Error::internal(anyhow!("scope watcher terminated unexpectedly")),
                    });
                };
                trace!(entered = delta.entered.len(), left = delta.left.len(), "scope change");
                if let Err(err) = merge_scope(
                    store.as_ref(),
                    &hub,
                    &prefix,
                    &updates,
                    &mut watching,
                    &mut changes,
                    delta,
                )
                .await
                {
                    break Err(err);
                }
                // The first scope event is the synchronization point and is
                // forwarded even when empty
                armed = !sent_initial || !changes.is_empty();
            }

            delivery = updates.recv() => {
                let Some(delivery) = delivery else {
                    break Err(hub.terminal_error());
                };
                let DocId::Str(key) = delivery.change().id.clone() else {
                    continue;
                };
                // A delivery can be in flight when its unit departs; the
                // departed unit must not reappear in `changed`
                if !watching.contains(&key) {
                    continue;
                }
                let merged = merge_settings(store.as_ref(), &mut changes, &key).await;
                delivery.ack();
                if let Err(err) = merged {
                    break Err(err);
                }
                armed = true;
            }

            Some(reply) = ports.requests.recv(), if armed => {
                let batch = std::mem::take(&mut changes);
                if let Err(batch) = reply.send(batch) {
                    changes = batch;
                } else {
                    sent_initial = true;
                    armed = false;
                }
            }
        }
    };

    let _ = scope.stop().await;
    for key in &watching {
        hub.unwatch(Collection::Settings, key.as_str(), &updates);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_no_event, harness, settings_map, sorted};

    #[test]
    fn test_unit_name_extraction() {
        assert_eq!(unit_name("peer#svc/1"), "svc/1");
        assert_eq!(unit_name("r#0#peer#svc/1"), "svc/1");
    }

    #[tokio::test]
    async fn test_scope_initial_membership_excludes_self() {
        let (_hub, store, watch) = harness();
        store.enter_scope("peer#svc/0").await;
        store.enter_scope("peer#svc/1").await;

        let mut w = watch.relation_scope("peer", "svc/0");
        let first = w.next().await.unwrap();
        assert_eq!(first.entered, vec!["svc/1".to_string()]);
        assert!(first.left.is_empty());

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_enter_leave_and_prefix_filter() {
        let (_hub, store, watch) = harness();
        store.enter_scope("peer#svc/0").await;
        store.enter_scope("peer#svc/1").await;

        let mut w = watch.relation_scope("peer", "svc/0");
        w.next().await.unwrap();

        store.enter_scope("peer#svc/2").await;
        let change = w.next().await.unwrap();
        assert_eq!(change.entered, vec!["svc/2".to_string()]);

        store.leave_scope("peer#svc/1").await;
        let change = w.next().await.unwrap();
        assert!(change.entered.is_empty());
        assert_eq!(change.left, vec!["svc/1".to_string()]);

        // Wrong prefix: no event
        store.enter_scope("other#svc/3").await;
        assert_no_event(&mut w).await;

        // The ignored unit never appears
        store.leave_scope("peer#svc/0").await;
        assert_no_event(&mut w).await;

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_initial_event_when_empty() {
        let (_hub, _store, watch) = harness();

        let mut w = watch.relation_scope("peer", "svc/0");
        assert!(w.next().await.unwrap().is_empty());

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_coalesces_enter_and_leave() {
        let (_hub, store, watch) = harness();

        let mut w = watch.relation_scope("peer", "svc/0");
        w.next().await.unwrap();

        store.enter_scope("peer#svc/1").await;
        store.enter_scope("peer#svc/2").await;
        store.leave_scope("peer#svc/2").await;

        let change = w.next().await.unwrap();
        assert_eq!(
            sorted(change.entered),
            vec!["svc/1".to_string(), "svc/2".to_string()]
        );
        assert_eq!(change.left, vec!["svc/2".to_string()]);

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_relation_units_join_change_depart() {
        let (_hub, store, watch) = harness();
        store
            .put_settings("peer#svc/1", settings_map(&[("a", 1)]))
            .await;
        store.enter_scope("peer#svc/1").await;

        let mut w = watch.relation_units("peer", "svc/0");

        let first = w.next().await.unwrap();
        assert_eq!(first.joined, vec!["svc/1".to_string()]);
        assert!(first.departed.is_empty());
        let entry = &first.changed["svc/1"];
        assert_eq!(entry.version, 1);
        assert_eq!(entry.settings, settings_map(&[("a", 1)]));

        // Settings revision bump: changed only
        store
            .put_settings("peer#svc/1", settings_map(&[("a", 2)]))
            .await;
        let second = w.next().await.unwrap();
        assert!(second.joined.is_empty());
        assert!(second.departed.is_empty());
        let entry = &second.changed["svc/1"];
        assert_eq!(entry.version, 2);
        assert_eq!(entry.settings, settings_map(&[("a", 2)]));

        // Departure clears any pending settings entry
        store.leave_scope("peer#svc/1").await;
        let third = w.next().await.unwrap();
        assert!(third.joined.is_empty());
        assert!(third.changed.is_empty());
        assert_eq!(third.departed, vec!["svc/1".to_string()]);

        // No further settings events for a departed unit
        store
            .put_settings("peer#svc/1", settings_map(&[("a", 3)]))
            .await;
        assert_no_event(&mut w).await;

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_relation_units_initial_event_when_empty() {
        let (_hub, _store, watch) = harness();

        let mut w = watch.relation_units("peer", "svc/0");
        assert!(w.next().await.unwrap().is_empty());

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_relation_units_join_and_depart_before_read() {
        let (_hub, store, watch) = harness();

        let mut w = watch.relation_units("peer", "svc/0");
        assert!(w.next().await.unwrap().is_empty());

        store
            .put_settings("peer#svc/1", settings_map(&[("a", 1)]))
            .await;
        store.enter_scope("peer#svc/1").await;
        store.leave_scope("peer#svc/1").await;

        // Coalesced into one batch: the unit appears as departed and its
        // settings entry is gone
        let change = w.next().await.unwrap();
        assert!(change.changed.is_empty());
        assert_eq!(change.departed, vec!["svc/1".to_string()]);

        w.stop().await.unwrap();
    }
}
