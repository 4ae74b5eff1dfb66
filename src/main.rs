#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use pylon_k8s_api::{self as k8s, watcher};
use pylon_k8s_index::{watch, Builder, ClusterConfig, ObjectStore};
use pylon_k8s_status::StatusWriter;
use pylon_xds::{
    CacheHandler, DiscoveryServer, EndpointsTranslator, EventHandler, ListenerConfig,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, time::Duration};
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[derive(Debug, Parser)]
#[clap(name = "pylon", about = "An Envoy ingress control plane for Kubernetes")]
struct Args {
    #[clap(long, default_value = "pylon=info,warn", env = "PYLON_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    /// The admin server doubles as the stats endpoint.
    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Address the xDS gRPC server binds to.
    #[clap(long, default_value = "0.0.0.0:8001")]
    xds_addr: SocketAddr,

    /// The ingress class this instance owns.
    #[clap(long, default_value = "contour")]
    ingress_class_name: String,

    /// Comma-separated namespaces that may define root routing documents.
    /// When unset, any namespace may.
    #[clap(long)]
    root_namespaces: Option<String>,

    /// Ignore `permitInsecure` on all routes.
    #[clap(long)]
    disable_permit_insecure: bool,

    /// How long to coalesce object events before rebuilding, in
    /// milliseconds.
    #[clap(long, default_value = "100")]
    holdoff_delay_ms: u64,

    /// Upper bound on rebuild delay while events keep arriving, in
    /// milliseconds.
    #[clap(long, default_value = "500")]
    holdoff_max_delay_ms: u64,

    #[clap(long, default_value = "0.0.0.0")]
    envoy_http_address: String,

    #[clap(long, default_value = "8080")]
    envoy_http_port: u32,

    #[clap(long, default_value = "0.0.0.0")]
    envoy_https_address: String,

    #[clap(long, default_value = "8443")]
    envoy_https_port: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        xds_addr,
        ingress_class_name,
        root_namespaces,
        disable_permit_insecure,
        holdoff_delay_ms,
        holdoff_max_delay_ms,
        envoy_http_address,
        envoy_http_port,
        envoy_https_address,
        envoy_https_port,
    } = Args::parse();

    let mut runtime = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin)
        .with_client(client)
        .build()
        .await?;

    let config = Arc::new(ClusterConfig {
        ingress_class: ingress_class_name,
        root_namespaces: root_namespaces
            .map(|namespaces| {
                namespaces
                    .split(',')
                    .map(|ns| ns.trim().to_string())
                    .filter(|ns| !ns.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        disable_permit_insecure,
    });

    let caches = CacheHandler::new(ListenerConfig {
        http_address: envoy_http_address,
        http_port: envoy_http_port,
        https_address: envoy_https_address,
        https_port: envoy_https_port,
    });

    // Serve the caches before anything writes to them; clients simply wait
    // for the first version.
    let discovery = DiscoveryServer::new(&caches, runtime.shutdown_handle());
    tokio::spawn(grpc(xds_addr, discovery, runtime.shutdown_handle()));

    // Forward every relevant resource type onto the single op channel
    // consumed by the event handler.
    let (ops_tx, ops_rx) = mpsc::unbounded_channel();

    let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
    tokio::spawn(watch::forward(services, ops_tx.clone()).instrument(info_span!("services")));

    let secrets = runtime.watch_all::<k8s::Secret>(watcher::Config::default());
    tokio::spawn(watch::forward(secrets, ops_tx.clone()).instrument(info_span!("secrets")));

    let ingresses = runtime.watch_all::<k8s::Ingress>(watcher::Config::default());
    tokio::spawn(watch::forward(ingresses, ops_tx.clone()).instrument(info_span!("ingresses")));

    let ingress_routes = runtime.watch_all::<k8s::IngressRoute>(watcher::Config::default());
    tokio::spawn(
        watch::forward(ingress_routes, ops_tx.clone()).instrument(info_span!("ingressroutes")),
    );

    let proxies = runtime.watch_all::<k8s::HTTPProxy>(watcher::Config::default());
    tokio::spawn(watch::forward(proxies, ops_tx.clone()).instrument(info_span!("httpproxies")));

    let delegations =
        runtime.watch_all::<k8s::TLSCertificateDelegation>(watcher::Config::default());
    tokio::spawn(
        watch::forward(delegations, ops_tx).instrument(info_span!("tlscertificatedelegations")),
    );

    // Endpoints bypass the graph entirely.
    let endpoints_translator = EndpointsTranslator::new(caches.endpoint.clone()).shared();
    let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(endpoints_translator, endpoints)
            .instrument(info_span!("endpoints")),
    );

    // Statuses are written off the rebuild path.
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let status_writer = StatusWriter::new(runtime.client(), status_rx);
    tokio::spawn(status_writer.run().instrument(info_span!("status")));

    let handler = EventHandler::new(
        Builder::new(ObjectStore::new(config)),
        caches,
        status_tx,
        Duration::from_millis(holdoff_delay_ms),
        Duration::from_millis(holdoff_max_delay_ms),
        None,
    );
    tokio::spawn(
        handler
            .run(ops_rx, runtime.shutdown_handle())
            .instrument(info_span!("event-handler")),
    );

    // Block on the shutdown signal; watch streams and servers drain before
    // the process exits.
    if runtime.run().await.is_err() {
        bail!("aborted");
    }

    Ok(())
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(addr: SocketAddr, discovery: DiscoveryServer, drain: drain::Watch) -> Result<()> {
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(discovery.listener_service())
            .add_service(discovery.route_service())
            .add_service(discovery.cluster_service())
            .add_service(discovery.endpoint_service())
            .add_service(discovery.secret_service())
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "xDS gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?;
        }
    }
    Ok(())
}
