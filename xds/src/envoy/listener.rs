//! Listener construction.

use super::{any, config_source, socket_address};
use crate::translator::ListenerConfig;
use pylon_core::{Dag, TcpProxy as DagTcpProxy, TlsVersion};
use std::collections::BTreeMap;
use xds_api::pb::envoy::{
    config::{
        core::v3::{transport_socket, TransportSocket},
        listener::v3::{filter, Filter, FilterChain, FilterChainMatch, Listener, ListenerFilter},
    },
    extensions::{
        filters::{
            http::router::v3::Router,
            network::{
                http_connection_manager::v3::{
                    http_connection_manager, http_filter, HttpConnectionManager, HttpFilter, Rds,
                },
                tcp_proxy::v3::{tcp_proxy, TcpProxy},
            },
        },
        transport_sockets::tls::v3::{
            CommonTlsContext, DownstreamTlsContext, SdsSecretConfig, TlsParameters,
        },
    },
};

pub use crate::envoy::route::{INGRESS_HTTP, INGRESS_HTTPS};

const HCM_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.network.\
                            http_connection_manager.v3.HttpConnectionManager";
const ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const DOWNSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";

// TLS protocol versions as the wire enum encodes them.
const TLS_PROTOCOL_AUTO: i32 = 0;
const TLS_PROTOCOL_V1_2: i32 = 3;
const TLS_PROTOCOL_V1_3: i32 = 4;

/// Builds the listener set for a graph. `ingress_http` is always
/// present; `ingress_https` appears once there is at least one secure
/// virtual host, with one filter chain per host selected by SNI.
pub fn listeners(dag: &Dag, config: &ListenerConfig) -> BTreeMap<String, Listener> {
    let mut out = BTreeMap::new();

    out.insert(
        INGRESS_HTTP.to_string(),
        Listener {
            name: INGRESS_HTTP.to_string(),
            address: Some(socket_address(&config.http_address, config.http_port)),
            filter_chains: vec![FilterChain {
                filters: vec![http_connection_manager(INGRESS_HTTP)],
                ..FilterChain::default()
            }],
            ..Listener::default()
        },
    );

    if !dag.secure_virtual_hosts.is_empty() {
        let mut chains = Vec::with_capacity(dag.secure_virtual_hosts.len());
        for svh in &dag.secure_virtual_hosts {
            let mut chain = FilterChain {
                filter_chain_match: Some(FilterChainMatch {
                    server_names: vec![svh.host.name.clone()],
                    ..FilterChainMatch::default()
                }),
                ..FilterChain::default()
            };
            if let Some(secret) = &svh.secret {
                chain.transport_socket =
                    Some(downstream_tls(&secret.wire_name(), svh.min_tls_version));
            }
            chain.filters = match &svh.tcp_proxy {
                Some(proxy) => vec![tcp_proxy_filter(INGRESS_HTTPS, proxy)],
                None => vec![http_connection_manager(INGRESS_HTTPS)],
            };
            chains.push(chain);
        }

        out.insert(
            INGRESS_HTTPS.to_string(),
            Listener {
                name: INGRESS_HTTPS.to_string(),
                address: Some(socket_address(&config.https_address, config.https_port)),
                listener_filters: vec![tls_inspector()],
                filter_chains: chains,
                ..Listener::default()
            },
        );
    }

    out
}

/// An HTTP connection manager whose routes come over RDS.
pub fn http_connection_manager(route_config_name: &str) -> Filter {
    let manager = HttpConnectionManager {
        stat_prefix: route_config_name.to_string(),
        route_specifier: Some(http_connection_manager::RouteSpecifier::Rds(Rds {
            config_source: Some(config_source()),
            route_config_name: route_config_name.to_string(),
            ..Rds::default()
        })),
        http_filters: vec![HttpFilter {
            name: "envoy.filters.http.router".to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(any(
                ROUTER_TYPE_URL,
                &Router::default(),
            ))),
            ..HttpFilter::default()
        }],
        use_remote_address: Some(true),
        ..HttpConnectionManager::default()
    };

    Filter {
        name: "envoy.filters.network.http_connection_manager".to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(any(HCM_TYPE_URL, &manager))),
        ..Filter::default()
    }
}

/// A TCP proxy filter forwarding raw streams to the proxy's clusters.
fn tcp_proxy_filter(stat_prefix: &str, proxy: &DagTcpProxy) -> Filter {
    let cluster_specifier = if proxy.clusters.len() == 1 {
        tcp_proxy::ClusterSpecifier::Cluster(proxy.clusters[0].name())
    } else {
        let total: u32 = proxy.clusters.iter().map(|c| c.weight).sum();
        let mut weights: Vec<tcp_proxy::weighted_cluster::ClusterWeight> = proxy
            .clusters
            .iter()
            .map(|c| tcp_proxy::weighted_cluster::ClusterWeight {
                name: c.name(),
                weight: if total == 0 { 1 } else { c.weight },
                ..tcp_proxy::weighted_cluster::ClusterWeight::default()
            })
            .collect();
        weights.sort_by(|a, b| a.name.cmp(&b.name).then(a.weight.cmp(&b.weight)));
        tcp_proxy::ClusterSpecifier::WeightedClusters(tcp_proxy::WeightedCluster {
            clusters: weights,
        })
    };

    let proxy = TcpProxy {
        stat_prefix: stat_prefix.to_string(),
        cluster_specifier: Some(cluster_specifier),
        ..TcpProxy::default()
    };
    Filter {
        name: "envoy.filters.network.tcp_proxy".to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(any(
            TCP_PROXY_TYPE_URL,
            &proxy,
        ))),
        ..Filter::default()
    }
}

/// Terminates TLS with a certificate delivered over SDS.
fn downstream_tls(secret_name: &str, min_version: TlsVersion) -> TransportSocket {
    let context = DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            tls_params: Some(TlsParameters {
                tls_minimum_protocol_version: tls_protocol(min_version),
                ..TlsParameters::default()
            }),
            tls_certificate_sds_secret_configs: vec![SdsSecretConfig {
                name: secret_name.to_string(),
                sds_config: Some(config_source()),
                ..SdsSecretConfig::default()
            }],
            alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
            ..CommonTlsContext::default()
        }),
        ..DownstreamTlsContext::default()
    };
    TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(any(
            DOWNSTREAM_TLS_CONTEXT_TYPE_URL,
            &context,
        ))),
        ..TransportSocket::default()
    }
}

fn tls_protocol(version: TlsVersion) -> i32 {
    match version {
        TlsVersion::Auto => TLS_PROTOCOL_AUTO,
        TlsVersion::V1_2 => TLS_PROTOCOL_V1_2,
        TlsVersion::V1_3 => TLS_PROTOCOL_V1_3,
    }
}

/// SNI inspection, required to match filter chains by server name.
fn tls_inspector() -> ListenerFilter {
    ListenerFilter {
        name: "envoy.filters.listener.tls_inspector".to_string(),
        ..ListenerFilter::default()
    }
}
