//! The wire side of the control plane: versioned snapshot caches, the
//! translation from the routing graph into Envoy resources, the xDS gRPC
//! services that serve them, and the event-handler loop that drives
//! rebuilds.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod endpoints;
pub mod envoy;
pub mod handler;
pub mod server;
pub mod translator;

#[cfg(test)]
mod tests;

pub use self::{
    cache::{Cond, ResourceCache, SnapshotCache},
    endpoints::EndpointsTranslator,
    handler::EventHandler,
    server::DiscoveryServer,
    translator::{CacheHandler, ListenerConfig},
};
