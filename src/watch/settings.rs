//! Settings and configuration watchers
//!
//! A settings watcher observes one settings document and delivers the
//! re-read document on every revision change. If the document does not
//! exist at startup, no initial event is sent; the watcher delivers its
//! first event once the document is created. Disappearance after that is
//! fatal.
//!
//! The environment configuration watcher layers a typed parse on top of the
//! settings watcher for the well-known environment key: revisions that fail
//! to parse are logged and suppressed, never delivered and never fatal.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::warn;

use crate::config::EnvironConfig;
use crate::errors::Error;
use crate::source::{ChangeHub, Collection};
use crate::store::{Settings, Store};

use super::{spawn, Ports, Watcher};

pub(crate) fn settings(store: Arc<dyn Store>, hub: ChangeHub, key: String) -> Watcher<Settings> {
    spawn("settings", move |ports| run(store, hub, key, ports))
}

pub(crate) fn environ_config(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    key: String,
) -> Watcher<EnvironConfig> {
    let inner = settings(store, hub.clone(), key);
    spawn("environ_config", move |ports| {
        run_environ(hub, inner, ports)
    })
}

async fn run(
    store: Arc<dyn Store>,
    hub: ChangeHub,
    key: String,
    mut ports: Ports<Settings>,
) -> Result<(), Error> {
    // A missing document suppresses the initial event; the watcher then
    // waits for creation
    let (revno, mut pending) = match store.settings(&key).await.map_err(Error::from)? {
        Some(doc) => (doc.version, Some(doc)),
        None => (-1, None),
    };

    let mut sub = hub.subscription();
    hub.watch(Collection::Settings, key.as_str(), revno, &sub);

    let res = loop {
        tokio::select! {
            _ = hub.closed() => break Err(hub.terminal_error()),

            _ = ports.halt.wait() => break Ok(()),

            delivery = sub.recv() => {
                let Some(delivery) = delivery else {
                    break Err(hub.terminal_error());
                };
                let fetched = store.settings(&key).await;
                delivery.ack();
                match fetched {
                    Ok(Some(doc)) => pending = Some(doc),
                    Ok(None) => break Err(Error::not_found(format!("settings {key}"))),
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

    hub.unwatch(Collection::Settings, key.as_str(), &sub);
    res
}

async fn run_environ(
    hub: ChangeHub,
    mut inner: Watcher<Settings>,
    mut ports: Ports<EnvironConfig>,
) -> Result<(), Error> {
    let mut pending: Option<EnvironConfig> = None;

    let res = loop {
        tokio::select! {
            _ = hub.closed() => break Err(hub.terminal_error()),

            _ = ports.halt.wait() => break Ok(()),

            doc = inner.next() => {
                let Some(doc) = doc else {
                    break Err(match inner.stop().await {
                        Err(err) => err,
                        Ok(()) => Error::internal(anyhow!("settings watcher terminated unexpectedly")),
                    });
                };
                match EnvironConfig::from_settings(&doc) {
                    Ok(cfg) => pending = Some(cfg),
                    // An invalid revision is dropped; any undelivered valid
                    // configuration stays armed
                    Err(err) => warn!(%err, "ignoring invalid environment configuration"),
                }
            }

            Some(reply) = ports.requests.recv(), if pending.is_some() => {
                let cfg = pending.take().expect("delivery slot armed");
                if let Err(cfg) = reply.send(cfg) {
                    pending = Some(cfg);
                }
            }
        }
    };

    let _ = inner.stop().await;
    res
}

#[cfg(test)]
mod tests {
    use crate::errors::Error;
    use crate::store::service_settings_key;
    use crate::testing::{assert_no_event, harness, settings_map};

    #[tokio::test]
    async fn test_settings_watcher_delivers_revisions() {
        let (_hub, store, watch) = harness();
        store.put_settings("s#wordpress", settings_map(&[("blog-title", 1)])).await;

        let mut w = watch.settings("s#wordpress");
        let first = w.next().await.unwrap();
        assert_eq!(first.version, 1);

        store.put_settings("s#wordpress", settings_map(&[("blog-title", 2)])).await;
        let second = w.next().await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.map, settings_map(&[("blog-title", 2)]));

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_settings_watcher_waits_for_creation() {
        let (_hub, store, watch) = harness();

        let mut w = watch.settings("s#wordpress");
        // No document yet: no initial event
        assert_no_event(&mut w).await;

        store.put_settings("s#wordpress", settings_map(&[("a", 1)])).await;
        let first = w.next().await.unwrap();
        assert_eq!(first.version, 1);

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_settings_watcher_coalesces_to_latest() {
        let (_hub, store, watch) = harness();
        store.put_settings("s#wordpress", settings_map(&[("a", 1)])).await;

        let mut w = watch.settings("s#wordpress");
        w.next().await.unwrap();

        store.put_settings("s#wordpress", settings_map(&[("a", 2)])).await;
        store.put_settings("s#wordpress", settings_map(&[("a", 3)])).await;

        let latest = w.next().await.unwrap();
        assert_eq!(latest.version, 3);
        assert_no_event(&mut w).await;

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_settings_watcher_removal_is_fatal() {
        let (_hub, store, watch) = harness();
        store.put_settings("s#wordpress", settings_map(&[("a", 1)])).await;

        let mut w = watch.settings("s#wordpress");
        w.next().await.unwrap();

        store.remove_settings("s#wordpress").await;

        assert!(w.next().await.is_none());
        assert!(matches!(w.stop().await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_service_config_uses_settings_key() {
        let (_hub, store, watch) = harness();
        store
            .put_settings(&service_settings_key("wordpress"), settings_map(&[("a", 1)]))
            .await;

        let mut w = watch.service_config("wordpress");
        assert_eq!(w.next().await.unwrap().version, 1);

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_environ_config_suppresses_invalid_revisions() {
        let (_hub, store, watch) = harness();
        let valid = serde_json::json!({ "name": "staging", "type": "ec2" });
        let serde_json::Value::Object(valid_map) = valid else {
            unreachable!()
        };
        store.put_settings("e", valid_map.clone()).await;

        let mut w = watch.environ_config();
        let first = w.next().await.unwrap();
        assert_eq!(first.name, "staging");
        assert_eq!(first.provider, "ec2");

        // A revision that fails to parse is never delivered
        let broken = serde_json::json!({ "name": "staging" });
        let serde_json::Value::Object(broken_map) = broken else {
            unreachable!()
        };
        store.put_settings("e", broken_map).await;
        assert_no_event(&mut w).await;

        // The next valid revision comes through
        let fixed = serde_json::json!({ "name": "staging", "type": "openstack" });
        let serde_json::Value::Object(fixed_map) = fixed else {
            unreachable!()
        };
        store.put_settings("e", fixed_map).await;
        let next = w.next().await.unwrap();
        assert_eq!(next.provider, "openstack");

        w.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_environ_config_waits_for_settings() {
        let (_hub, store, watch) = harness();

        let mut w = watch.environ_config();
        assert_no_event(&mut w).await;

        let valid = serde_json::json!({ "name": "staging", "type": "ec2" });
        let serde_json::Value::Object(valid_map) = valid else {
            unreachable!()
        };
        store.put_settings("e", valid_map).await;

        assert_eq!(w.next().await.unwrap().name, "staging");

        w.stop().await.unwrap();
    }
}
