//! Translates Endpoints churn directly into the endpoint cache.
//!
//! Pod address changes are far more frequent than routing changes, and a
//! load assignment is a pure function of its Endpoints object, so this
//! path skips the graph entirely: each mutation rewrites the affected
//! load assignments and bumps only the endpoint cache's version.

use crate::cache::SnapshotCache;
use crate::envoy::endpoint::cluster_load_assignment;
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use pylon_core::load_assignment_name;
use pylon_k8s_api::{Endpoints, ResourceExt};
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;
use xds_api::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;

pub type SharedEndpointsTranslator = Arc<RwLock<EndpointsTranslator>>;

#[derive(Debug)]
pub struct EndpointsTranslator {
    cache: Arc<SnapshotCache<ClusterLoadAssignment>>,

    /// Current contents, updated in place and snapshotted into the cache.
    entries: BTreeMap<String, ClusterLoadAssignment>,

    /// Which load-assignment names each Endpoints object produced, so a
    /// later mutation can retract the ones that disappear.
    by_object: HashMap<(String, String), Vec<String>>,
}

// === impl EndpointsTranslator ===

impl EndpointsTranslator {
    pub fn new(cache: Arc<SnapshotCache<ClusterLoadAssignment>>) -> Self {
        Self {
            cache,
            entries: BTreeMap::new(),
            by_object: HashMap::new(),
        }
    }

    pub fn shared(self) -> SharedEndpointsTranslator {
        Arc::new(RwLock::new(self))
    }

    fn replace(&mut self, key: (String, String), next: BTreeMap<String, ClusterLoadAssignment>) {
        let names: Vec<String> = next.keys().cloned().collect();
        if let Some(previous) = self.by_object.insert(key, names) {
            for name in previous {
                if !next.contains_key(&name) {
                    self.entries.remove(&name);
                }
            }
        }
        self.entries.extend(next);
        self.cache.update(self.entries.clone());
    }
}

impl kubert::index::IndexNamespacedResource<Endpoints> for EndpointsTranslator {
    fn apply(&mut self, endpoints: Endpoints) {
        let namespace = endpoints.namespace().unwrap_or_default();
        let name = endpoints.name_unchecked();
        let assignments = translate(&namespace, &name, &endpoints);
        debug!(ns = %namespace, %name, assignments = assignments.len(), "endpoints applied");
        self.replace((namespace, name), assignments);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let Some(names) = self.by_object.remove(&(namespace.clone(), name.clone())) else {
            return;
        };
        debug!(ns = %namespace, %name, "endpoints deleted");
        for stale in names {
            self.entries.remove(&stale);
        }
        self.cache.update(self.entries.clone());
    }
}

/// Builds the load assignments for one Endpoints object: one per port
/// name, addresses sorted for deterministic output.
fn translate(
    namespace: &str,
    name: &str,
    endpoints: &Endpoints,
) -> BTreeMap<String, ClusterLoadAssignment> {
    let mut grouped: BTreeMap<String, Vec<(String, u32)>> = BTreeMap::new();
    for subset in endpoints.subsets.iter().flatten() {
        for port in subset.ports.iter().flatten() {
            let key = load_assignment_name(namespace, name, port.name.as_deref().unwrap_or(""));
            let addresses = grouped.entry(key).or_default();
            for address in subset.addresses.iter().flatten() {
                addresses.push((address.ip.clone(), port.port as u32));
            }
        }
    }

    grouped
        .into_iter()
        .map(|(key, mut addresses)| {
            addresses.sort();
            addresses.dedup();
            let assignment = cluster_load_assignment(&key, &addresses);
            (key, assignment)
        })
        .collect()
}
