//! Versioned snapshot caches with one-shot change notification.

use parking_lot::Mutex;
use prost::Message;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use xds_api::pb::envoy::{
    config::{
        cluster::v3::Cluster, endpoint::v3::ClusterLoadAssignment, listener::v3::Listener,
        route::v3::RouteConfiguration,
    },
    extensions::transport_sockets::tls::v3::Secret,
};

pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// A rendezvous point for tasks waiting on cache versions.
///
/// Waiters register a channel with the version they have already seen; a
/// registration behind the current version fires immediately instead of
/// enqueueing. Notification is one-shot and never blocks the publisher:
/// waiter channels must have capacity for at least one value, and a full
/// or disconnected channel forfeits the notification.
#[derive(Debug, Default)]
pub struct Cond {
    state: Mutex<CondState>,
}

#[derive(Debug, Default)]
struct CondState {
    last: u64,
    waiters: Vec<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    tx: mpsc::Sender<u64>,
    hints: Vec<String>,
}

// === impl Cond ===

impl Cond {
    /// The number of times [`Cond::notify`] has been called.
    pub fn last(&self) -> u64 {
        self.state.lock().last
    }

    /// Registers `tx` to receive a value at the next notification whose
    /// hints overlap `hints` (no hints matches everything). If `since` is
    /// already behind, fires immediately.
    pub fn register(&self, tx: mpsc::Sender<u64>, since: u64, hints: Vec<String>) {
        let mut state = self.state.lock();
        if since < state.last {
            let _ = tx.try_send(state.last);
            return;
        }
        state.waiters.push(Waiter { tx, hints });
    }

    /// Bumps the version and wakes matching waiters, deregistering each
    /// one it delivers to. Waiters whose receiver has gone away are
    /// discarded.
    pub fn notify(&self, hints: &[String]) {
        let mut state = self.state.lock();
        state.last += 1;
        let last = state.last;

        state.waiters.retain(|waiter| {
            if waiter.tx.is_closed() {
                return false;
            }
            let fires = waiter.hints.is_empty()
                || waiter.hints.iter().any(|hint| hints.contains(hint));
            if fires {
                let _ = waiter.tx.try_send(last);
            }
            !fires
        });
    }
}

/// A wire resource that can live in a snapshot cache.
pub trait Resource: Message + Clone + Sized {
    const TYPE_URL: &'static str;

    /// The name clients filter on.
    fn resource_name(&self) -> &str;
}

impl Resource for Listener {
    const TYPE_URL: &'static str = LISTENER_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.name
    }
}

impl Resource for RouteConfiguration {
    const TYPE_URL: &'static str = ROUTE_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.name
    }
}

impl Resource for Cluster {
    const TYPE_URL: &'static str = CLUSTER_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.name
    }
}

impl Resource for ClusterLoadAssignment {
    const TYPE_URL: &'static str = ENDPOINT_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.cluster_name
    }
}

impl Resource for Secret {
    const TYPE_URL: &'static str = SECRET_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.name
    }
}

/// The latest snapshot of one wire resource class.
///
/// Contents are replaced atomically; every replacement bumps the version
/// and notifies waiters with the union of the old and new resource names.
#[derive(Debug, Default)]
pub struct SnapshotCache<T> {
    cond: Cond,
    contents: Mutex<BTreeMap<String, T>>,
}

// === impl SnapshotCache ===

impl<T: Resource> SnapshotCache<T> {
    /// Replaces the snapshot.
    pub fn update(&self, next: BTreeMap<String, T>) {
        let mut contents = self.contents.lock();
        let hints: Vec<String> = contents
            .keys()
            .chain(next.keys())
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        *contents = next;
        drop(contents);

        self.cond.notify(&hints);
    }

    pub fn version(&self) -> u64 {
        self.cond.last()
    }
}

/// Object-safe cache surface used by the discovery server.
pub trait ResourceCache: Send + Sync {
    fn type_url(&self) -> &'static str;

    fn version(&self) -> u64;

    /// Waits for a version newer than `since`, filtered to `hints`.
    fn register(&self, tx: mpsc::Sender<u64>, since: u64, hints: Vec<String>);

    /// The current snapshot, filtered to `names` if non-empty, encoded for
    /// the wire.
    fn query(&self, names: &[String]) -> Vec<prost_types::Any>;
}

impl<T: Resource + Send + Sync> ResourceCache for SnapshotCache<T> {
    fn type_url(&self) -> &'static str {
        T::TYPE_URL
    }

    fn version(&self) -> u64 {
        self.cond.last()
    }

    fn register(&self, tx: mpsc::Sender<u64>, since: u64, hints: Vec<String>) {
        self.cond.register(tx, since, hints);
    }

    fn query(&self, names: &[String]) -> Vec<prost_types::Any> {
        let contents = self.contents.lock();
        let encode = |resource: &T| prost_types::Any {
            type_url: T::TYPE_URL.to_string(),
            value: resource.encode_to_vec(),
        };

        if names.is_empty() {
            return contents.values().map(encode).collect();
        }

        let mut names: Vec<&String> = names.iter().collect();
        names.sort();
        names.dedup();
        names
            .into_iter()
            .filter_map(|name| contents.get(name))
            .map(encode)
            .collect()
    }
}
