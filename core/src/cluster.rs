use crate::name::{hashname, hex};
use sha1::{Digest, Sha1};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

/// A single Kubernetes service port, the upstream a cluster forwards to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub namespace: String,

    /// The service port number.
    pub port: i32,

    /// The service port's name, if it has one. Named ports get their own
    /// load assignment so that endpoint subsets resolve correctly.
    pub port_name: String,

    /// Layer-7 protocol of the upstream: one of "", "h2", "h2c", or "tls".
    pub protocol: String,

    // Circuit-breaker limits. Zero means "not configured".
    pub max_connections: u32,
    pub max_pending_requests: u32,
    pub max_requests: u32,
    pub max_retries: u32,

    /// DNS name for `type: ExternalName` services.
    pub external_name: Option<String>,
}

/// TLS material held as a leaf of the graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Connection parameters for traffic routed to one upstream service.
#[derive(Clone, Debug, Default)]
pub struct Cluster {
    pub upstream: Arc<Service>,

    /// Relative weight of this cluster among its route's siblings.
    pub weight: u32,

    /// Requested load-balancing strategy, verbatim from the user. The
    /// translator maps unrecognized values to the default policy, but the
    /// raw string still participates in the cluster name hash so that two
    /// different spellings never collide.
    pub load_balancer_strategy: String,

    pub health_check: Option<HealthCheckPolicy>,
    pub upstream_validation: Option<UpstreamValidation>,
}

/// Active HTTP health checking of a cluster's endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheckPolicy {
    pub path: String,
    pub host: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

/// Verification of the certificate presented by an upstream service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamValidation {
    /// Secret carrying the CA bundle (a `ca.crt` key) to verify against.
    pub ca_secret: Arc<Secret>,

    /// Subject name the upstream's certificate must present.
    pub subject_name: String,
}

/// Maximum length of a cluster name accepted by the data plane.
const CLUSTER_NAME_LIMIT: usize = 60;

// === impl Service ===

impl Service {
    /// The name of the load assignment that feeds this service's cluster.
    pub fn load_assignment_name(&self) -> String {
        load_assignment_name(&self.namespace, &self.name, &self.port_name)
    }
}

/// Builds the `namespace/name[/port-name]` key shared by the cluster's EDS
/// reference and the endpoints translator.
pub fn load_assignment_name(namespace: &str, name: &str, port_name: &str) -> String {
    if port_name.is_empty() {
        return format!("{namespace}/{name}");
    }
    format!("{namespace}/{name}/{port_name}")
}

// === impl Secret ===

impl Secret {
    const TLS_CERT_KEY: &'static str = "tls.crt";
    const TLS_PRIVATE_KEY_KEY: &'static str = "tls.key";
    const CA_CERT_KEY: &'static str = "ca.crt";

    /// The name this secret is served under.
    pub fn wire_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn cert(&self) -> &[u8] {
        self.lookup(Self::TLS_CERT_KEY)
    }

    pub fn private_key(&self) -> &[u8] {
        self.lookup(Self::TLS_PRIVATE_KEY_KEY)
    }

    pub fn ca(&self) -> &[u8] {
        self.lookup(Self::CA_CERT_KEY)
    }

    fn lookup(&self, key: &str) -> &[u8] {
        self.data.get(key).map(Vec::as_slice).unwrap_or_default()
    }
}

// === impl Cluster ===

impl Cluster {
    /// The stable data-plane name for this cluster:
    /// `namespace/service/port/hash` where the hash covers the
    /// load-balancing, health-check, and validation configuration. Long
    /// components are shortened with a suffix derived from the full name so
    /// the result never exceeds the data plane's limit.
    pub fn name(&self) -> String {
        let mut buf = self.load_balancer_strategy.clone();
        if let Some(hc) = &self.health_check {
            if !hc.timeout.is_zero() {
                buf.push_str(&format!("{}s", hc.timeout.as_secs()));
            }
            if !hc.interval.is_zero() {
                buf.push_str(&format!("{}s", hc.interval.as_secs()));
            }
            if hc.unhealthy_threshold > 0 {
                buf.push_str(&hc.unhealthy_threshold.to_string());
            }
            if hc.healthy_threshold > 0 {
                buf.push_str(&hc.healthy_threshold.to_string());
            }
            buf.push_str(&hc.path);
        }
        if let Some(uv) = &self.upstream_validation {
            buf.push_str(&uv.ca_secret.name);
            buf.push_str(&uv.subject_name);
        }

        let hash = hex(&Sha1::digest(buf.as_bytes())[..5]);
        let port = self.upstream.port.to_string();
        hashname(
            CLUSTER_NAME_LIMIT,
            &[
                self.upstream.namespace.as_str(),
                self.upstream.name.as_str(),
                port.as_str(),
                hash.as_str(),
            ],
        )
    }
}
