//! Shared change source
//!
//! A [`ChangeHub`] is a cheap-to-clone handle to a process-lifetime task that
//! multiplexes per-document change notifications over any number of
//! subscriptions. The external oplog tailer feeds it through
//! [`publish`](ChangeHub::publish); watchers subscribe to single documents or
//! whole collections and receive [`Change`] notifications on their
//! [`Subscription`].
//!
//! Publishing is acknowledged: `publish` resolves only after every interested
//! subscriber has taken delivery. Together with the rendezvous delivery used
//! by the watchers this gives the layer its coalescing behavior: a slow
//! consumer never causes queuing, only merging.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, span, trace, warn, Instrument, Level};

use crate::errors::Error;

/// The collections a change notification can originate from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Machines,
    Services,
    Units,
    Relations,
    RelationScopes,
    Settings,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Collection::Machines => "machines",
            Collection::Services => "services",
            Collection::Units => "units",
            Collection::Relations => "relations",
            Collection::RelationScopes => "relationscopes",
            Collection::Settings => "settings",
        };
        f.write_str(name)
    }
}

/// A document identifier
///
/// Machines use integer ids; everything else is keyed by strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocId {
    Int(i64),
    Str(String),
}

impl DocId {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DocId::Str(s) => Some(s),
            DocId::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            DocId::Int(i) => Some(*i),
            DocId::Str(_) => None,
        }
    }
}

impl From<i64> for DocId {
    fn from(id: i64) -> Self {
        DocId::Int(id)
    }
}

impl From<&str> for DocId {
    fn from(id: &str) -> Self {
        DocId::Str(id.to_string())
    }
}

impl From<String> for DocId {
    fn from(id: String) -> Self {
        DocId::Str(id)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocId::Int(i) => write!(f, "{i}"),
            DocId::Str(s) => f.write_str(s),
        }
    }
}

/// A single document change notification
///
/// `revno` is the document's revision after the change; `-1` means the
/// document was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub collection: Collection,
    pub id: DocId,
    pub revno: i64,
}

/// Revision number used on the wire for a removed document
pub const REMOVED: i64 = -1;

/// A change notification held by a subscriber
///
/// The hub's [`publish`](ChangeHub::publish) stays blocked until every
/// subscriber has acknowledged (or dropped) its delivery, so a watcher that
/// acknowledges only after merging gives publishers a hard guarantee: when
/// `publish` returns, the change has been absorbed everywhere.
pub struct Delivery {
    change: Change,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    pub fn change(&self) -> &Change {
        &self.change
    }

    /// Acknowledge the delivery, releasing the publisher
    pub fn ack(mut self) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(ack) = self.ack.take() {
            // A dropped delivery must not wedge the publisher
            let _ = ack.send(());
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("change", &self.change)
            .finish()
    }
}

/// A subscriber channel registered with a [`ChangeHub`]
///
/// One subscription may be registered for any number of documents and
/// collections; all of their notifications arrive on the same channel.
pub struct Subscription {
    id: u64,
    tx: mpsc::Sender<Delivery>,
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription {
    /// Receive the next change notification
    ///
    /// Returns `None` once the hub has released the subscription, which only
    /// happens after the hub terminated.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

struct Entry {
    sub: u64,
    tx: mpsc::Sender<Delivery>,
}

impl Entry {
    /// Hand one change to the subscriber and wait until it is taken
    ///
    /// Returns false when the subscription is gone.
    async fn notify(&self, change: &Change) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        let delivery = Delivery {
            change: change.clone(),
            ack: Some(ack_tx),
        };
        if self.tx.send(delivery).await.is_err() {
            return false;
        }
        let _ = ack_rx.await;
        true
    }
}

enum Cmd {
    Watch {
        collection: Collection,
        id: DocId,
        revno: i64,
        entry: Entry,
    },
    Unwatch {
        collection: Collection,
        id: DocId,
        sub: u64,
    },
    WatchCollection {
        collection: Collection,
        entry: Entry,
    },
    UnwatchCollection {
        collection: Collection,
        sub: u64,
    },
    Publish {
        collection: Collection,
        id: DocId,
        revno: i64,
        done: oneshot::Sender<()>,
    },
    Kill {
        reason: String,
    },
}

/// Handle to the shared change source
///
/// The hub outlives every watcher; watchers hold clones of this handle and
/// release their subscriptions on termination.
#[derive(Clone)]
pub struct ChangeHub {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    closed_rx: watch::Receiver<Option<String>>,
    sub_ids: Arc<AtomicU64>,
}

impl ChangeHub {
    /// Spawn the hub task and return a handle to it
    pub fn spawn() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);

        tokio::spawn(run(cmd_rx, closed_tx).instrument(span!(Level::TRACE, "change_hub")));

        ChangeHub {
            cmd_tx,
            closed_rx,
            sub_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a new subscriber channel
    pub fn subscription(&self) -> Subscription {
        let id = self.sub_ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        Subscription { id, tx, rx }
    }

    /// Register interest in a single document
    ///
    /// `revno` is the revision the subscriber last observed; if the hub has
    /// already seen a different revision of the document, one catch-up
    /// notification is delivered immediately.
    pub fn watch(&self, collection: Collection, id: impl Into<DocId>, revno: i64, sub: &Subscription) {
        let _ = self.cmd_tx.send(Cmd::Watch {
            collection,
            id: id.into(),
            revno,
            entry: Entry {
                sub: sub.id,
                tx: sub.tx.clone(),
            },
        });
    }

    /// Release interest in a single document
    pub fn unwatch(&self, collection: Collection, id: impl Into<DocId>, sub: &Subscription) {
        let _ = self.cmd_tx.send(Cmd::Unwatch {
            collection,
            id: id.into(),
            sub: sub.id,
        });
    }

    /// Register interest in every document of a collection
    pub fn watch_collection(&self, collection: Collection, sub: &Subscription) {
        let _ = self.cmd_tx.send(Cmd::WatchCollection {
            collection,
            entry: Entry {
                sub: sub.id,
                tx: sub.tx.clone(),
            },
        });
    }

    /// Release interest in a collection
    pub fn unwatch_collection(&self, collection: Collection, sub: &Subscription) {
        let _ = self.cmd_tx.send(Cmd::UnwatchCollection {
            collection,
            sub: sub.id,
        });
    }

    /// Feed one document change into the hub
    ///
    /// Resolves after every interested subscriber has acknowledged delivery.
    /// This is the entry point for the oplog tailer.
    pub async fn publish(&self, collection: Collection, id: impl Into<DocId>, revno: i64) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Cmd::Publish {
                collection,
                id: id.into(),
                revno,
                done: done_tx,
            })
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    /// Terminate the hub with the given reason
    ///
    /// All subscriptions are released; watchers observe the termination via
    /// [`closed`](ChangeHub::closed) and report
    /// [`Error::SourceClosed`] as their terminal error.
    pub fn kill(&self, reason: impl Into<String>) {
        let _ = self.cmd_tx.send(Cmd::Kill {
            reason: reason.into(),
        });
    }

    /// Wait until the hub has terminated
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        loop {
            if rx.borrow().is_some() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The hub's terminal error
    ///
    /// Only meaningful after [`closed`](ChangeHub::closed) has resolved.
    pub fn terminal_error(&self) -> Error {
        match &*self.closed_rx.borrow() {
            Some(reason) => Error::SourceClosed(reason.clone()),
            None => Error::internal(anyhow!("change source has not terminated")),
        }
    }
}

struct Registry {
    docs: HashMap<(Collection, DocId), Vec<Entry>>,
    collections: HashMap<Collection, Vec<Entry>>,
    latest: HashMap<(Collection, DocId), i64>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            docs: HashMap::new(),
            collections: HashMap::new(),
            latest: HashMap::new(),
        }
    }

    async fn publish(&mut self, collection: Collection, id: DocId, revno: i64) {
        let key = (collection, id.clone());
        self.latest.insert(key.clone(), revno);

        let change = Change {
            collection,
            id,
            revno,
        };
        trace!(%collection, id = %change.id, revno, "publishing change");

        if let Some(entries) = self.docs.get_mut(&key) {
            deliver(entries, &change).await;
        }
        if let Some(entries) = self.collections.get_mut(&collection) {
            deliver(entries, &change).await;
        }
    }

    async fn watch(&mut self, collection: Collection, id: DocId, revno: i64, entry: Entry) {
        let key = (collection, id.clone());
        let entries = self.docs.entry(key.clone()).or_default();
        if entries.iter().any(|e| e.sub == entry.sub) {
            warn!(%collection, %id, "subscription already watching document");
            return;
        }

        // Close the read-then-subscribe race: if the document moved past the
        // revision the subscriber read, deliver one catch-up notification.
        let catch_up = match self.latest.get(&key) {
            Some(&latest) if latest != revno => Some(Change {
                collection,
                id,
                revno: latest,
            }),
            _ => None,
        };

        if let Some(change) = &catch_up {
            trace!(%collection, id = %change.id, revno = change.revno, "catch-up delivery");
            if !entry.notify(change).await {
                return;
            }
        }
        entries.push(entry);
    }
}

async fn deliver(entries: &mut Vec<Entry>, change: &Change) {
    let mut stale = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        if !entry.notify(change).await {
            stale.push(idx);
        }
    }
    // Subscribers that dropped their channel are pruned on the spot
    for idx in stale.into_iter().rev() {
        entries.swap_remove(idx);
    }
}

async fn run(mut cmd_rx: mpsc::UnboundedReceiver<Cmd>, closed_tx: watch::Sender<Option<String>>) {
    let mut registry = Registry::new();
    let mut dead = false;

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Cmd::Watch {
                collection,
                id,
                revno,
                entry,
            } => {
                if !dead {
                    registry.watch(collection, id, revno, entry).await;
                }
            }
            Cmd::Unwatch {
                collection,
                id,
                sub,
            } => {
                if let Some(entries) = registry.docs.get_mut(&(collection, id)) {
                    entries.retain(|e| e.sub != sub);
                }
            }
            Cmd::WatchCollection { collection, entry } => {
                if !dead {
                    registry
                        .collections
                        .entry(collection)
                        .or_default()
                        .push(entry);
                }
            }
            Cmd::UnwatchCollection { collection, sub } => {
                if let Some(entries) = registry.collections.get_mut(&collection) {
                    entries.retain(|e| e.sub != sub);
                }
            }
            Cmd::Publish {
                collection,
                id,
                revno,
                done,
            } => {
                if !dead {
                    registry.publish(collection, id, revno).await;
                }
                let _ = done.send(());
            }
            Cmd::Kill { reason } => {
                if !dead {
                    debug!(%reason, "change hub terminating");
                    dead = true;
                    registry.docs.clear();
                    registry.collections.clear();
                    let _ = closed_tx.send(Some(reason));
                }
            }
        }
    }

    if !dead {
        // Every handle is gone; flag termination for any remaining observer
        let _ = closed_tx.send(Some("change stream closed".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_document_subscription_receives_changes() {
        let hub = ChangeHub::spawn();
        let mut sub = hub.subscription();
        hub.watch(Collection::Units, "wp/0", 1, &sub);

        // publish blocks until the delivery is acknowledged below
        let publisher = hub.clone();
        let publish =
            tokio::spawn(async move { publisher.publish(Collection::Units, "wp/0", 2).await });

        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.change().id, DocId::from("wp/0"));
        assert_eq!(delivery.change().revno, 2);
        delivery.ack();

        publish.await.unwrap();
    }

    #[tokio::test]
    async fn test_other_documents_are_filtered() {
        let hub = ChangeHub::spawn();
        let mut sub = hub.subscription();
        hub.watch(Collection::Units, "wp/0", 1, &sub);

        hub.publish(Collection::Units, "wp/1", 2).await;

        assert!(timeout(Duration::from_millis(20), sub.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_collection_subscription_receives_all() {
        let hub = ChangeHub::spawn();
        let mut sub = hub.subscription();
        hub.watch_collection(Collection::Machines, &sub);

        let publisher = hub.clone();
        let publish = tokio::spawn(async move {
            publisher.publish(Collection::Machines, 0, 1).await;
            publisher.publish(Collection::Machines, 3, 1).await;
        });

        let first = sub.recv().await.unwrap();
        assert_eq!(first.change().id, DocId::Int(0));
        first.ack();

        let second = sub.recv().await.unwrap();
        assert_eq!(second.change().id, DocId::Int(3));
        second.ack();

        publish.await.unwrap();
    }

    #[tokio::test]
    async fn test_catch_up_on_stale_subscribe() {
        let hub = ChangeHub::spawn();
        hub.publish(Collection::Settings, "e", 4).await;

        let mut sub = hub.subscription();
        hub.watch(Collection::Settings, "e", 2, &sub);

        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.change().revno, 4);
        delivery.ack();
    }

    #[tokio::test]
    async fn test_no_catch_up_when_current() {
        let hub = ChangeHub::spawn();
        hub.publish(Collection::Settings, "e", 4).await;

        let mut sub = hub.subscription();
        hub.watch(Collection::Settings, "e", 4, &sub);

        assert!(timeout(Duration::from_millis(20), sub.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unwatch_stops_delivery() {
        let hub = ChangeHub::spawn();
        let mut sub = hub.subscription();
        hub.watch(Collection::Units, "wp/0", 1, &sub);
        hub.unwatch(Collection::Units, "wp/0", &sub);

        hub.publish(Collection::Units, "wp/0", 2).await;

        assert!(timeout(Duration::from_millis(20), sub.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_blocks_until_acknowledged() {
        let hub = ChangeHub::spawn();
        let mut sub = hub.subscription();
        hub.watch(Collection::Units, "wp/0", 1, &sub);

        let publisher = hub.clone();
        let publish =
            tokio::spawn(async move { publisher.publish(Collection::Units, "wp/0", 2).await });

        let delivery = sub.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publish.is_finished());

        delivery.ack();
        publish.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_delivery_releases_publisher() {
        let hub = ChangeHub::spawn();
        let mut sub = hub.subscription();
        hub.watch(Collection::Units, "wp/0", 1, &sub);

        let publisher = hub.clone();
        let publish =
            tokio::spawn(async move { publisher.publish(Collection::Units, "wp/0", 2).await });

        let delivery = sub.recv().await.unwrap();
        drop(delivery);

        publish.await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_reports_terminal_error() {
        let hub = ChangeHub::spawn();
        hub.kill("connection reset");
        hub.closed().await;

        match hub.terminal_error() {
            Error::SourceClosed(reason) => assert_eq!(reason, "connection reset"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
