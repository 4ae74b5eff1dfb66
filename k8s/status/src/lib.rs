//! Writes computed root statuses back to the object API.
//!
//! The writer runs on its own task, fed by an unbounded channel from the
//! event handler. Status writes are best-effort: a failure is logged and
//! dropped, and configuration distribution is never held up waiting for
//! the API server.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use ahash::AHashMap as HashMap;
use pylon_core::{Meta, RootKind, Status};
use pylon_k8s_api::{Api, Client, Patch, PatchParams, HTTPProxy, IngressRoute};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error};

/// One status to record against a root candidate.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    pub kind: RootKind,
    pub meta: Meta,
    pub status: Status,
}

/// Drains status updates and patches the status subresource of the
/// corresponding object.
pub struct StatusWriter {
    client: Client,
    updates: UnboundedReceiver<StatusUpdate>,
}

// === impl StatusWriter ===

impl StatusWriter {
    pub fn new(client: Client, updates: UnboundedReceiver<StatusUpdate>) -> Self {
        Self { client, updates }
    }

    pub async fn run(mut self) {
        let params = PatchParams::apply("pylon");

        // Rebuilds re-report every root; skip writes whose outcome cannot
        // have changed since the last successful one.
        let mut written: HashMap<(RootKind, Meta), Status> = HashMap::new();

        while let Some(StatusUpdate { kind, meta, status }) = self.updates.recv().await {
            if written.get(&(kind, meta.clone())) == Some(&status) {
                continue;
            }

            let patch = serde_json::json!({
                "status": {
                    "currentStatus": status.code.as_str(),
                    "description": status.description,
                },
            });
            let patch = Patch::Merge(patch);

            let res = match kind {
                RootKind::IngressRoute => {
                    Api::<IngressRoute>::namespaced(self.client.clone(), &meta.namespace)
                        .patch_status(&meta.name, &params, &patch)
                        .await
                        .map(|_| ())
                }
                RootKind::HttpProxy => {
                    Api::<HTTPProxy>::namespaced(self.client.clone(), &meta.namespace)
                        .patch_status(&meta.name, &params, &patch)
                        .await
                        .map(|_| ())
                }
            };

            match res {
                Ok(()) => {
                    debug!(%kind, %meta, status = %status.code.as_str(), "wrote status");
                    written.insert((kind, meta), status);
                }
                Err(error) => {
                    error!(%kind, %meta, %error, "failed to write status");
                }
            }
        }
    }
}
