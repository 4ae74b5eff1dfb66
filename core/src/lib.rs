//! Data model for the ingress routing graph.
//!
//! The graph relates virtual hosts to the routes they serve, the upstream
//! clusters those routes forward to, and the TLS material that protects
//! them. It is a value type: the builder produces a fresh graph on every
//! rebuild and the previous one is dropped, never mutated. Everything that
//! may be shared between vertices (clusters, services, secrets) is held
//! behind an `Arc` so the graph stays cheap to walk and to tear down.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster;
mod name;
mod route;
mod status;

pub use self::{
    cluster::{
        load_assignment_name, Cluster, HealthCheckPolicy, Secret, Service, UpstreamValidation,
    },
    name::hashname,
    route::{parse_duration, RetryPolicy, Route, RouteMatch, Timeout, TimeoutPolicy},
    status::{Meta, RootKind, RootRef, Status, StatusCode},
};

use std::{collections::BTreeMap, sync::Arc};

/// The routing graph computed from one snapshot of the object store.
///
/// Plaintext virtual hosts belong to the well-known `ingress_http`
/// listener; secure virtual hosts to `ingress_https`. Both sets are kept
/// sorted by host name so that translation output is deterministic.
#[derive(Debug, Default)]
pub struct Dag {
    pub virtual_hosts: Vec<VirtualHost>,
    pub secure_virtual_hosts: Vec<SecureVirtualHost>,

    /// Per-root condition computed while building this graph.
    pub statuses: BTreeMap<RootRef, Status>,
}

/// A set of routes selected by host name.
#[derive(Clone, Debug)]
pub struct VirtualHost {
    /// Fully qualified domain name, or `*` for the wildcard host.
    pub name: String,

    routes: Vec<Route>,
}

/// A virtual host protected by TLS.
#[derive(Clone, Debug)]
pub struct SecureVirtualHost {
    pub host: VirtualHost,

    /// Certificate and key for this host. Absent for TLS passthrough.
    pub secret: Option<Arc<Secret>>,

    /// Minimum TLS protocol version accepted by this host.
    pub min_tls_version: TlsVersion,

    /// Forward raw TLS streams instead of terminating HTTP.
    pub tcp_proxy: Option<TcpProxy>,
}

/// A weighted set of clusters receiving proxied TCP streams.
#[derive(Clone, Debug)]
pub struct TcpProxy {
    pub clusters: Vec<Arc<Cluster>>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TlsVersion {
    #[default]
    Auto,
    V1_2,
    V1_3,
}

// === impl Dag ===

impl Dag {
    /// All clusters reachable from this graph, deduplicated by generated
    /// name and sorted for deterministic output.
    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        let mut by_name = BTreeMap::new();
        let routes = self
            .virtual_hosts
            .iter()
            .flat_map(|vh| vh.routes())
            .chain(self.secure_virtual_hosts.iter().flat_map(|svh| svh.host.routes()));
        for route in routes {
            for cluster in &route.clusters {
                by_name.insert(cluster.name(), cluster.clone());
            }
        }
        for svh in &self.secure_virtual_hosts {
            if let Some(proxy) = &svh.tcp_proxy {
                for cluster in &proxy.clusters {
                    by_name.insert(cluster.name(), cluster.clone());
                }
            }
        }
        by_name.into_values().collect()
    }

    /// All TLS secrets reachable from this graph, deduplicated and sorted.
    pub fn secrets(&self) -> Vec<Arc<Secret>> {
        let mut by_name = BTreeMap::new();
        for svh in &self.secure_virtual_hosts {
            if let Some(secret) = &svh.secret {
                by_name.insert(secret.wire_name(), secret.clone());
            }
        }
        by_name.into_values().collect()
    }
}

// === impl VirtualHost ===

impl VirtualHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
        }
    }

    /// Adds a route, replacing any existing route with the same match
    /// expression while keeping its original position. Positions matter:
    /// insertion order breaks ordering ties at translation time.
    pub fn add_route(&mut self, route: Route) {
        match self.routes.iter_mut().find(|r| r.matcher == route.matcher) {
            Some(existing) => *existing = route,
            None => self.routes.push(route),
        }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// A virtual host is valid if it has at least one route.
    pub fn is_valid(&self) -> bool {
        !self.routes.is_empty()
    }
}

// === impl SecureVirtualHost ===

impl SecureVirtualHost {
    /// A secure virtual host is valid if it can terminate TLS and serve at
    /// least one route, or if it passes the TLS stream through untouched
    /// and lets the backend negotiate for itself.
    pub fn is_valid(&self) -> bool {
        (self.secret.is_some() && self.host.is_valid()) || self.tcp_proxy.is_some()
    }
}

// === impl TlsVersion ===

impl TlsVersion {
    pub fn parse(s: &str) -> Self {
        match s {
            "1.2" => TlsVersion::V1_2,
            "1.3" => TlsVersion::V1_3,
            _ => TlsVersion::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, port: i32) -> Arc<Service> {
        Arc::new(Service {
            name: name.to_string(),
            namespace: "default".to_string(),
            port,
            ..Service::default()
        })
    }

    fn route(prefix: &str, svc: Arc<Service>) -> Route {
        Route {
            clusters: vec![Arc::new(Cluster {
                upstream: svc,
                ..Cluster::default()
            })],
            ..Route::prefix(prefix)
        }
    }

    #[test]
    fn add_route_replaces_matching_expression_in_place() {
        let mut vh = VirtualHost::new("example.com");
        vh.add_route(route("/", service("alpha", 80)));
        vh.add_route(route("/app", service("beta", 80)));
        vh.add_route(route("/", service("gamma", 80)));

        assert_eq!(vh.routes().len(), 2);
        assert_eq!(vh.routes()[0].clusters[0].upstream.name, "gamma");
        assert_eq!(vh.routes()[1].clusters[0].upstream.name, "beta");
    }

    #[test]
    fn empty_virtual_host_is_invalid() {
        assert!(!VirtualHost::new("example.com").is_valid());
    }

    #[test]
    fn passthrough_host_is_valid_without_secret_or_routes() {
        let svh = SecureVirtualHost {
            host: VirtualHost::new("example.com"),
            secret: None,
            min_tls_version: TlsVersion::Auto,
            tcp_proxy: Some(TcpProxy {
                clusters: vec![Arc::new(Cluster {
                    upstream: service("tcp", 3306),
                    ..Cluster::default()
                })],
            }),
        };
        assert!(svh.is_valid());

        let svh = SecureVirtualHost {
            tcp_proxy: None,
            ..svh
        };
        assert!(!svh.is_valid());
    }

    #[test]
    fn clusters_deduplicate_across_hosts() {
        let shared = service("kuard", 80);
        let mut http = VirtualHost::new("a.example.com");
        http.add_route(route("/", shared.clone()));
        let mut other = VirtualHost::new("b.example.com");
        other.add_route(route("/", shared));

        let dag = Dag {
            virtual_hosts: vec![http, other],
            ..Dag::default()
        };
        assert_eq!(dag.clusters().len(), 1);
    }
}
