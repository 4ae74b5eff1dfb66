//! Walks a routing graph and replaces the wire cache snapshots.

use crate::{cache::SnapshotCache, envoy};
use pylon_core::Dag;
use std::sync::Arc;
use tracing::debug;
use xds_api::pb::envoy::{
    config::{
        cluster::v3::Cluster, endpoint::v3::ClusterLoadAssignment, listener::v3::Listener,
        route::v3::RouteConfiguration,
    },
    extensions::transport_sockets::tls::v3::Secret,
};

/// Bind addresses handed to the data plane's listeners.
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub http_address: String,
    pub http_port: u32,
    pub https_address: String,
    pub https_port: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            http_address: "0.0.0.0".to_string(),
            http_port: 8080,
            https_address: "0.0.0.0".to_string(),
            https_port: 8443,
        }
    }
}

/// Owns the five wire caches and refreshes the graph-derived ones on each
/// rebuild.
///
/// The endpoint cache is deliberately left alone here: endpoint churn is
/// translated on its own path (see [`crate::EndpointsTranslator`]) so pod
/// scale events never force a graph rebuild.
#[derive(Debug, Default)]
pub struct CacheHandler {
    pub listener: Arc<SnapshotCache<Listener>>,
    pub route: Arc<SnapshotCache<RouteConfiguration>>,
    pub cluster: Arc<SnapshotCache<Cluster>>,
    pub endpoint: Arc<SnapshotCache<ClusterLoadAssignment>>,
    pub secret: Arc<SnapshotCache<Secret>>,

    pub listener_config: ListenerConfig,
}

// === impl CacheHandler ===

impl CacheHandler {
    pub fn new(listener_config: ListenerConfig) -> Self {
        Self {
            listener_config,
            ..Self::default()
        }
    }

    /// Translates `dag` and atomically replaces each affected snapshot,
    /// bumping its version and waking its waiters.
    pub fn on_change(&self, dag: &Dag) {
        let listeners = envoy::listener::listeners(dag, &self.listener_config);
        let routes = envoy::route::route_configurations(dag);
        let clusters = envoy::cluster::clusters(dag);
        let secrets = envoy::secret::secrets(dag);

        debug!(
            listeners = listeners.len(),
            virtual_hosts = dag.virtual_hosts.len(),
            secure_virtual_hosts = dag.secure_virtual_hosts.len(),
            clusters = clusters.len(),
            secrets = secrets.len(),
            "translated graph"
        );

        self.listener.update(listeners);
        self.route.update(routes);
        self.cluster.update(clusters);
        self.secret.update(secrets);
    }
}
