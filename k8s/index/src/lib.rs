//! Cluster-state indexing for the translation pipeline.
//!
//! This crate owns the pieces that sit between the Kubernetes watch
//! streams and the wire caches: the [`ObjectStore`] that filters and holds
//! the objects the graph is built from, the [`Builder`] that turns one
//! store snapshot into a routing graph, and the [`watch`] bridge that
//! converts watch events into the single-writer op stream consumed by the
//! event handler.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
mod builder;
mod store;
pub mod watch;


pub use self::{
    builder::Builder,
    store::{AnyObject, ObjectStore},
    watch::Op,
};

use std::sync::Arc;

/// Name used when no ingress class is configured.
pub const DEFAULT_INGRESS_CLASS: &str = "contour";

/// Process-wide configuration shared by the store and the builder.
#[derive(Clone, Debug, Default)]
pub struct ClusterConfig {
    /// The ingress class this control plane owns. Empty means
    /// [`DEFAULT_INGRESS_CLASS`].
    pub ingress_class: String,

    /// Namespaces that may hold root routing documents. Empty means all.
    pub root_namespaces: Vec<String>,

    /// Treat `permitInsecure` as unset everywhere.
    pub disable_permit_insecure: bool,
}

pub type SharedClusterConfig = Arc<ClusterConfig>;

// === impl ClusterConfig ===

impl ClusterConfig {
    pub fn ingress_class(&self) -> &str {
        if self.ingress_class.is_empty() {
            DEFAULT_INGRESS_CLASS
        } else {
            &self.ingress_class
        }
    }

    pub fn root_allowed(&self, namespace: &str) -> bool {
        self.root_namespaces.is_empty() || self.root_namespaces.iter().any(|ns| ns == namespace)
    }
}
