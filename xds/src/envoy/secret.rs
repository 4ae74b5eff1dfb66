//! TLS secret construction for SDS.

use pylon_core::Dag;
use std::collections::BTreeMap;
use xds_api::pb::envoy::{
    config::core::v3::{data_source, DataSource},
    extensions::transport_sockets::tls::v3::{secret, Secret, TlsCertificate},
};

/// Builds the secret set for a graph, keyed by `namespace/name`.
pub fn secrets(dag: &Dag) -> BTreeMap<String, Secret> {
    dag.secrets()
        .iter()
        .map(|s| (s.wire_name(), secret(s)))
        .collect()
}

pub fn secret(s: &pylon_core::Secret) -> Secret {
    Secret {
        name: s.wire_name(),
        r#type: Some(secret::Type::TlsCertificate(TlsCertificate {
            certificate_chain: Some(inline_bytes(s.cert())),
            private_key: Some(inline_bytes(s.private_key())),
            ..TlsCertificate::default()
        })),
    }
}

pub(crate) fn inline_bytes(bytes: &[u8]) -> DataSource {
    DataSource {
        specifier: Some(data_source::Specifier::InlineBytes(bytes.to_vec())),
        ..DataSource::default()
    }
}
