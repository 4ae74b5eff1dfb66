//! Constructors for Envoy configuration values.
//!
//! These are pure functions from graph vertices to wire messages; all of
//! the decisions about *what* exists were made by the builder, so nothing
//! in here can fail.

pub mod cluster;
pub mod endpoint;
pub mod listener;
pub mod route;
pub mod secret;

use prost::Message;
use xds_api::pb::envoy::config::core::v3::{
    address, api_config_source::ApiType, config_source::ConfigSourceSpecifier, grpc_service,
    socket_address, Address, ApiConfigSource, ApiVersion, ConfigSource, GrpcService,
    SocketAddress,
};

/// Name of the static bootstrap cluster the data plane reaches this
/// control plane through; EDS and SDS references point back at it.
pub const XDS_CLUSTER: &str = "pylon";

pub(crate) fn any<M: Message>(type_url: &str, message: &M) -> xds_api::pb::google::protobuf::Any {
    xds_api::pb::google::protobuf::Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

pub(crate) fn duration(d: std::time::Duration) -> xds_api::pb::google::protobuf::Duration {
    xds_api::pb::google::protobuf::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

/// A TCP socket address.
pub fn socket_address(address: &str, port: u32) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            protocol: socket_address::Protocol::Tcp as i32,
            address: address.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port)),
            ..SocketAddress::default()
        })),
    }
}

/// The gRPC config source pointing back at this control plane.
pub fn config_source() -> ConfigSource {
    ConfigSource {
        resource_api_version: ApiVersion::V3 as i32,
        config_source_specifier: Some(ConfigSourceSpecifier::ApiConfigSource(ApiConfigSource {
            api_type: ApiType::Grpc as i32,
            transport_api_version: ApiVersion::V3 as i32,
            grpc_services: vec![GrpcService {
                target_specifier: Some(grpc_service::TargetSpecifier::EnvoyGrpc(
                    grpc_service::EnvoyGrpc {
                        cluster_name: XDS_CLUSTER.to_string(),
                        ..grpc_service::EnvoyGrpc::default()
                    },
                )),
                ..GrpcService::default()
            }],
            ..ApiConfigSource::default()
        })),
        ..ConfigSource::default()
    }
}
