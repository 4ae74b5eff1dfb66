//! Cluster construction.

use super::{any, config_source, duration, endpoint};
use pylon_core::Dag;
use std::{collections::BTreeMap, time::Duration};
use xds_api::pb::envoy::{
    config::{
        cluster::v3::{circuit_breakers, cluster, CircuitBreakers, Cluster},
        core::v3::{
            health_check, transport_socket, HealthCheck, Http2ProtocolOptions, TransportSocket,
        },
    },
    extensions::transport_sockets::tls::v3::{
        common_tls_context, CertificateValidationContext, CommonTlsContext, UpstreamTlsContext,
    },
    r#type::{
        matcher::v3::{string_matcher, StringMatcher},
        v3::Percent,
    },
};
use xds_api::pb::google::protobuf::UInt32Value;

const UPSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Builds the cluster set for a graph, deduplicated by generated name.
pub fn clusters(dag: &Dag) -> BTreeMap<String, Cluster> {
    dag.clusters()
        .iter()
        .map(|c| (c.name(), cluster(c)))
        .collect()
}

pub fn cluster(c: &pylon_core::Cluster) -> Cluster {
    let upstream = &c.upstream;
    let mut out = Cluster {
        name: c.name(),
        alt_stat_name: format!(
            "{}_{}_{}",
            upstream.namespace, upstream.name, upstream.port
        ),
        connect_timeout: Some(duration(CONNECT_TIMEOUT)),
        lb_policy: lb_policy(&c.load_balancer_strategy) as i32,
        common_lb_config: Some(common_lb_config()),
        ..Cluster::default()
    };

    match &upstream.external_name {
        // ExternalName services resolve through DNS rather than EDS.
        Some(dns_name) => {
            out.cluster_discovery_type = Some(cluster::ClusterDiscoveryType::Type(
                cluster::DiscoveryType::StrictDns as i32,
            ));
            out.load_assignment = Some(endpoint::cluster_load_assignment(
                &upstream.load_assignment_name(),
                &[(dns_name.clone(), upstream.port as u32)],
            ));
        }
        None => {
            out.cluster_discovery_type = Some(cluster::ClusterDiscoveryType::Type(
                cluster::DiscoveryType::Eds as i32,
            ));
            out.eds_cluster_config = Some(cluster::EdsClusterConfig {
                eds_config: Some(config_source()),
                service_name: upstream.load_assignment_name(),
            });
        }
    }

    out.circuit_breakers = circuit_breakers(c);
    if let Some(hc) = &c.health_check {
        out.health_checks = vec![health_check(hc)];
    }

    #[allow(deprecated)]
    match upstream.protocol.as_str() {
        "h2c" => out.http2_protocol_options = Some(Http2ProtocolOptions::default()),
        "h2" => out.transport_socket = Some(upstream_tls(c, true)),
        "tls" => out.transport_socket = Some(upstream_tls(c, false)),
        _ => {}
    }

    out
}

fn lb_policy(strategy: &str) -> cluster::LbPolicy {
    match strategy {
        "WeightedLeastRequest" => cluster::LbPolicy::LeastRequest,
        "Random" => cluster::LbPolicy::Random,
        // Session affinity is implemented as a ring hash over the route's
        // cookie hash policy.
        "Cookie" => cluster::LbPolicy::RingHash,
        // Everything else, including unrecognized strategies, gets the
        // default policy.
        _ => cluster::LbPolicy::RoundRobin,
    }
}

/// Disables panic-mode routing so the data plane never sends traffic to
/// hosts it believes are unhealthy.
fn common_lb_config() -> cluster::CommonLbConfig {
    cluster::CommonLbConfig {
        healthy_panic_threshold: Some(Percent { value: 0.0 }),
        ..cluster::CommonLbConfig::default()
    }
}

fn circuit_breakers(c: &pylon_core::Cluster) -> Option<CircuitBreakers> {
    let upstream = &c.upstream;
    let limit = |n: u32| (n > 0).then_some(n);
    let thresholds = circuit_breakers::Thresholds {
        max_connections: limit(upstream.max_connections),
        max_pending_requests: limit(upstream.max_pending_requests),
        max_requests: limit(upstream.max_requests),
        max_retries: limit(upstream.max_retries),
        ..circuit_breakers::Thresholds::default()
    };
    if thresholds == circuit_breakers::Thresholds::default() {
        return None;
    }
    Some(CircuitBreakers {
        thresholds: vec![thresholds],
        ..CircuitBreakers::default()
    })
}

fn health_check(policy: &pylon_core::HealthCheckPolicy) -> HealthCheck {
    HealthCheck {
        timeout: Some(duration(policy.timeout)),
        interval: Some(duration(policy.interval)),
        unhealthy_threshold: Some(policy.unhealthy_threshold),
        healthy_threshold: Some(policy.healthy_threshold),
        health_checker: Some(health_check::HealthChecker::HttpHealthCheck(
            health_check::HttpHealthCheck {
                host: policy.host.clone(),
                path: policy.path.clone(),
                ..health_check::HttpHealthCheck::default()
            },
        )),
        ..HealthCheck::default()
    }
}

fn upstream_tls(c: &pylon_core::Cluster, alpn_h2: bool) -> TransportSocket {
    let mut common = CommonTlsContext::default();
    if alpn_h2 {
        common.alpn_protocols = vec!["h2".to_string()];
    }
    if let Some(validation) = &c.upstream_validation {
        common.validation_context_type = Some(
            common_tls_context::ValidationContextType::ValidationContext(
                CertificateValidationContext {
                    trusted_ca: Some(super::secret::inline_bytes(
                        validation.ca_secret.ca(),
                    )),
                    match_subject_alt_names: vec![StringMatcher {
                        match_pattern: Some(string_matcher::MatchPattern::Exact(
                            validation.subject_name.clone(),
                        )),
                        ..StringMatcher::default()
                    }],
                    ..CertificateValidationContext::default()
                },
            ),
        );
    }

    let context = UpstreamTlsContext {
        common_tls_context: Some(common),
        ..UpstreamTlsContext::default()
    };
    TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(any(
            UPSTREAM_TLS_CONTEXT_TYPE_URL,
            &context,
        ))),
        ..TransportSocket::default()
    }
}
