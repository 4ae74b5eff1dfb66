//! The streaming discovery server.
//!
//! Five independent gRPC services (LDS, RDS, CDS, EDS, SDS) share one
//! generic stream driver: the first request selects the snapshot cache
//! for the service's type URL, subsequent requests refresh the resource
//! name filter, and every cache version past the last one sent produces a
//! full-state response. Delta discovery is not supported.

use crate::{cache, translator::CacheHandler, ResourceCache};
use futures::{Stream, StreamExt};
use std::{collections::HashMap, pin::Pin, sync::Arc};
use tokio::sync::mpsc;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, trace};
use xds_api::pb::envoy::service::{
    cluster::v3::cluster_discovery_service_server::{
        ClusterDiscoveryService, ClusterDiscoveryServiceServer,
    },
    discovery::v3::{
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    },
    endpoint::v3::endpoint_discovery_service_server::{
        EndpointDiscoveryService, EndpointDiscoveryServiceServer,
    },
    listener::v3::listener_discovery_service_server::{
        ListenerDiscoveryService, ListenerDiscoveryServiceServer,
    },
    route::v3::route_discovery_service_server::{
        RouteDiscoveryService, RouteDiscoveryServiceServer,
    },
    secret::v3::secret_discovery_service_server::{
        SecretDiscoveryService, SecretDiscoveryServiceServer,
    },
};

pub type DiscoveryStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;
pub type DeltaStream =
    Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

#[derive(Clone)]
pub struct DiscoveryServer {
    resources: Arc<HashMap<&'static str, Arc<dyn ResourceCache>>>,
    drain: drain::Watch,
}

// === impl DiscoveryServer ===

impl DiscoveryServer {
    pub fn new(caches: &CacheHandler, drain: drain::Watch) -> Self {
        let mut resources: HashMap<&'static str, Arc<dyn ResourceCache>> = HashMap::new();
        resources.insert(cache::LISTENER_TYPE_URL, caches.listener.clone());
        resources.insert(cache::ROUTE_TYPE_URL, caches.route.clone());
        resources.insert(cache::CLUSTER_TYPE_URL, caches.cluster.clone());
        resources.insert(cache::ENDPOINT_TYPE_URL, caches.endpoint.clone());
        resources.insert(cache::SECRET_TYPE_URL, caches.secret.clone());
        Self {
            resources: Arc::new(resources),
            drain,
        }
    }

    pub fn listener_service(&self) -> ListenerDiscoveryServiceServer<Self> {
        ListenerDiscoveryServiceServer::new(self.clone())
    }

    pub fn route_service(&self) -> RouteDiscoveryServiceServer<Self> {
        RouteDiscoveryServiceServer::new(self.clone())
    }

    pub fn cluster_service(&self) -> ClusterDiscoveryServiceServer<Self> {
        ClusterDiscoveryServiceServer::new(self.clone())
    }

    pub fn endpoint_service(&self) -> EndpointDiscoveryServiceServer<Self> {
        EndpointDiscoveryServiceServer::new(self.clone())
    }

    pub fn secret_service(&self) -> SecretDiscoveryServiceServer<Self> {
        SecretDiscoveryServiceServer::new(self.clone())
    }

    fn cache(&self, type_url: &str) -> Result<Arc<dyn ResourceCache>, Status> {
        self.resources
            .get(type_url)
            .cloned()
            .ok_or_else(|| Status::internal(format!("no resource cache for {type_url}")))
    }

    fn stream(
        &self,
        type_url: &'static str,
        requests: Streaming<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryStream>, Status> {
        let cache = self.cache(type_url)?;
        Ok(Response::new(discovery_stream(
            cache,
            type_url,
            requests,
            self.drain.clone(),
        )))
    }

    fn fetch(
        &self,
        type_url: &'static str,
        req: DiscoveryRequest,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        check_type_url(type_url, &req.type_url)?;
        let cache = self.cache(type_url)?;
        let version = cache.version();
        Ok(Response::new(DiscoveryResponse {
            version_info: version.to_string(),
            resources: cache.query(&req.resource_names),
            type_url: type_url.to_string(),
            nonce: version.to_string(),
            ..DiscoveryResponse::default()
        }))
    }
}

fn check_type_url(expected: &'static str, requested: &str) -> Result<(), Status> {
    if !requested.is_empty() && requested != expected {
        return Err(Status::invalid_argument(format!(
            "unknown type URL \"{requested}\""
        )));
    }
    Ok(())
}

/// Drives one client stream: wait for a cache version newer than the last
/// one sent, respond with the filtered snapshot, repeat. Inbound requests
/// only refresh the filter; cancellation or server drain ends the loop,
/// implicitly deregistering the waiter.
fn discovery_stream(
    cache: Arc<dyn ResourceCache>,
    type_url: &'static str,
    mut requests: Streaming<DiscoveryRequest>,
    drain: drain::Watch,
) -> DiscoveryStream {
    Box::pin(async_stream::try_stream! {
        let first = match requests.next().await {
            Some(Ok(req)) => req,
            Some(Err(error)) => {
                debug!(type_url, %error, "discovery stream failed");
                return;
            }
            None => return,
        };
        check_type_url(type_url, &first.type_url)?;

        let mut names = first.resource_names;
        let mut last: u64 = 0;

        tokio::pin! {
            let shutdown = drain.signaled();
        }

        loop {
            // One-shot rendezvous with the cache: fires immediately if
            // we're already behind.
            let (tx, mut rx) = mpsc::channel(1);
            cache.register(tx, last, names.clone());

            tokio::select! {
                version = rx.recv() => {
                    let Some(version) = version else { continue };
                    last = version;
                    let resources = cache.query(&names);
                    trace!(type_url, version, resources = resources.len(), "pushing snapshot");
                    yield DiscoveryResponse {
                        version_info: version.to_string(),
                        resources,
                        type_url: type_url.to_string(),
                        nonce: version.to_string(),
                        ..DiscoveryResponse::default()
                    };
                }

                request = requests.next() => match request {
                    Some(Ok(req)) => {
                        check_type_url(type_url, &req.type_url)?;
                        names = req.resource_names;
                    }
                    Some(Err(error)) => {
                        debug!(type_url, %error, "discovery stream failed");
                        return;
                    }
                    None => return,
                },

                _ = &mut shutdown => return,
            }
        }
    })
}

#[tonic::async_trait]
impl ListenerDiscoveryService for DiscoveryServer {
    type StreamListenersStream = DiscoveryStream;
    type DeltaListenersStream = DeltaStream;

    async fn stream_listeners(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamListenersStream>, Status> {
        self.stream(cache::LISTENER_TYPE_URL, req.into_inner())
    }

    async fn delta_listeners(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaListenersStream>, Status> {
        Err(Status::unimplemented("delta discovery is not supported"))
    }

    async fn fetch_listeners(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(cache::LISTENER_TYPE_URL, req.into_inner())
    }
}

#[tonic::async_trait]
impl RouteDiscoveryService for DiscoveryServer {
    type StreamRoutesStream = DiscoveryStream;
    type DeltaRoutesStream = DeltaStream;

    async fn stream_routes(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamRoutesStream>, Status> {
        self.stream(cache::ROUTE_TYPE_URL, req.into_inner())
    }

    async fn delta_routes(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaRoutesStream>, Status> {
        Err(Status::unimplemented("delta discovery is not supported"))
    }

    async fn fetch_routes(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(cache::ROUTE_TYPE_URL, req.into_inner())
    }
}

#[tonic::async_trait]
impl ClusterDiscoveryService for DiscoveryServer {
    type StreamClustersStream = DiscoveryStream;
    type DeltaClustersStream = DeltaStream;

    async fn stream_clusters(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamClustersStream>, Status> {
        self.stream(cache::CLUSTER_TYPE_URL, req.into_inner())
    }

    async fn delta_clusters(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaClustersStream>, Status> {
        Err(Status::unimplemented("delta discovery is not supported"))
    }

    async fn fetch_clusters(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(cache::CLUSTER_TYPE_URL, req.into_inner())
    }
}

#[tonic::async_trait]
impl EndpointDiscoveryService for DiscoveryServer {
    type StreamEndpointsStream = DiscoveryStream;
    type DeltaEndpointsStream = DeltaStream;

    async fn stream_endpoints(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamEndpointsStream>, Status> {
        self.stream(cache::ENDPOINT_TYPE_URL, req.into_inner())
    }

    async fn delta_endpoints(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaEndpointsStream>, Status> {
        Err(Status::unimplemented("delta discovery is not supported"))
    }

    async fn fetch_endpoints(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(cache::ENDPOINT_TYPE_URL, req.into_inner())
    }
}

#[tonic::async_trait]
impl SecretDiscoveryService for DiscoveryServer {
    type StreamSecretsStream = DiscoveryStream;
    type DeltaSecretsStream = DeltaStream;

    async fn stream_secrets(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSecretsStream>, Status> {
        self.stream(cache::SECRET_TYPE_URL, req.into_inner())
    }

    async fn delta_secrets(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaSecretsStream>, Status> {
        Err(Status::unimplemented("delta discovery is not supported"))
    }

    async fn fetch_secrets(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(cache::SECRET_TYPE_URL, req.into_inner())
    }
}
