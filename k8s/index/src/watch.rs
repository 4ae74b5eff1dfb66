//! Bridges Kubernetes watch streams onto the single-writer op channel.
//!
//! The watch API delivers "applied" events without the previous object
//! state, but the event handler needs old/new pairs to suppress no-op
//! updates. Each forwarder keeps the last seen object per key and
//! synthesizes add/update/delete operations accordingly.

use crate::store::AnyObject;
use ahash::AHashMap as HashMap;
use futures::{Stream, StreamExt};
use pylon_k8s_api::{watcher::Event, ResourceExt};
use tokio::sync::mpsc;
use tracing::debug;

/// One mutation to apply to the object store.
#[derive(Clone, Debug)]
pub enum Op {
    Add(AnyObject),
    Update { old: AnyObject, new: AnyObject },
    Delete(AnyObject),
}

/// Forwards a single resource type's watch events as ops until the stream
/// ends or the receiver is dropped.
pub async fn forward<T>(
    events: impl Stream<Item = Event<T>>,
    tx: mpsc::UnboundedSender<Op>,
) where
    T: Clone + ResourceExt,
    AnyObject: From<T>,
{
    let mut known: HashMap<(String, String), T> = HashMap::new();
    tokio::pin!(events);

    while let Some(event) = events.next().await {
        let ops = match event {
            Event::Applied(obj) => vec![apply(&mut known, obj)],
            Event::Deleted(obj) => {
                known.remove(&key_of(&obj));
                vec![Op::Delete(obj.into())]
            }
            Event::Restarted(objs) => {
                // Relist: anything we knew about that is gone was deleted
                // while the watch was down.
                let current: Vec<(String, String)> = objs.iter().map(key_of).collect();
                let stale: Vec<(String, String)> = known
                    .keys()
                    .filter(|key| !current.contains(key))
                    .cloned()
                    .collect();

                let mut ops = Vec::with_capacity(stale.len() + objs.len());
                for key in stale {
                    if let Some(old) = known.remove(&key) {
                        ops.push(Op::Delete(old.into()));
                    }
                }
                for obj in objs {
                    ops.push(apply(&mut known, obj));
                }
                ops
            }
        };

        for op in ops {
            if tx.send(op).is_err() {
                debug!("op receiver dropped; stopping watch forwarder");
                return;
            }
        }
    }
}

fn apply<T>(known: &mut HashMap<(String, String), T>, obj: T) -> Op
where
    T: Clone + ResourceExt,
    AnyObject: From<T>,
{
    match known.insert(key_of(&obj), obj.clone()) {
        Some(old) => Op::Update {
            old: old.into(),
            new: obj.into(),
        },
        None => Op::Add(obj.into()),
    }
}

fn key_of<T: ResourceExt>(obj: &T) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_unchecked())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylon_k8s_api::{ObjectMeta, Secret};

    fn secret(name: &str, version: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        }
    }

    #[tokio::test]
    async fn applied_becomes_add_then_update() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = tokio_stream::iter(vec![
            Event::Applied(secret("tls", "1")),
            Event::Applied(secret("tls", "2")),
        ]);
        forward(events, tx).await;

        assert!(matches!(rx.recv().await, Some(Op::Add(_))));
        match rx.recv().await {
            Some(Op::Update { old, new }) => {
                assert_ne!(old, new);
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn relist_synthesizes_deletes_for_missing_objects() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = tokio_stream::iter(vec![
            Event::Applied(secret("a", "1")),
            Event::Applied(secret("b", "1")),
            Event::Restarted(vec![secret("b", "2")]),
        ]);
        forward(events, tx).await;

        assert!(matches!(rx.recv().await, Some(Op::Add(_))));
        assert!(matches!(rx.recv().await, Some(Op::Add(_))));
        match rx.recv().await {
            Some(Op::Delete(obj)) => assert_eq!(obj.meta().name, "a"),
            other => panic!("expected delete, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(Op::Update { .. })));
        assert!(rx.recv().await.is_none());
    }
}
