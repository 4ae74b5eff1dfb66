#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod delegation;
pub mod httpproxy;
pub mod ingressroute;

pub use self::{
    delegation::TLSCertificateDelegation, httpproxy::HTTPProxy, ingressroute::IngressRoute,
};
pub use k8s_openapi::api::{
    core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Secret, Service, ServicePort,
        ServiceSpec,
    },
    networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
    },
};
pub use k8s_openapi::ByteString;
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    runtime::watcher,
    Client, Error,
};

/// The secret type kubelet mints for service accounts; never ingress TLS
/// material.
pub const SECRET_TYPE_SERVICE_ACCOUNT_TOKEN: &str = "kubernetes.io/service-account-token";

/// The secret type that carries a TLS certificate and key.
pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";
