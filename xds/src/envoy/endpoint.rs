//! Load-assignment construction.

use super::socket_address;
use xds_api::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};

/// One load assignment mapping a cluster name to its `(address, port)`
/// pairs. Callers are responsible for passing addresses in sorted order
/// so output is deterministic.
pub fn cluster_load_assignment(name: &str, addresses: &[(String, u32)]) -> ClusterLoadAssignment {
    ClusterLoadAssignment {
        cluster_name: name.to_string(),
        endpoints: vec![LocalityLbEndpoints {
            lb_endpoints: addresses
                .iter()
                .map(|(address, port)| lb_endpoint(address, *port))
                .collect(),
            ..LocalityLbEndpoints::default()
        }],
        ..ClusterLoadAssignment::default()
    }
}

pub fn lb_endpoint(address: &str, port: u32) -> LbEndpoint {
    LbEndpoint {
        host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
            address: Some(socket_address(address, port)),
            ..Endpoint::default()
        })),
        ..LbEndpoint::default()
    }
}
