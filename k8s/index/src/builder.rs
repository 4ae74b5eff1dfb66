use crate::{annotations, ClusterConfig, ObjectStore};
use ahash::AHashMap as HashMap;
use pylon_core::{
    parse_duration, Cluster, Dag, HealthCheckPolicy, Meta, RetryPolicy, RootKind, RootRef, Route,
    RouteMatch, SecureVirtualHost, Status, TcpProxy, Timeout, TimeoutPolicy, TlsVersion,
    UpstreamValidation, VirtualHost,
};
use pylon_k8s_api::{self as k8s, ResourceExt};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};
use tracing::debug;

/// Characters that force an Ingress path to be treated as a regular
/// expression rather than a prefix.
const REGEX_CHARS: &str = "^+*[]%";

// Health-check defaults applied when the policy leaves a field unset.
const HC_INTERVAL: Duration = Duration::from_secs(10);
const HC_TIMEOUT: Duration = Duration::from_secs(2);
const HC_UNHEALTHY_THRESHOLD: u32 = 3;
const HC_HEALTHY_THRESHOLD: u32 = 2;
const HC_HOST: &str = "contour-envoy-healthcheck";

/// Condition retried when a routing document declares a retry policy.
const DEFAULT_RETRY_ON: &str = "5xx";

/// Builds a fresh routing graph from the current contents of an
/// [`ObjectStore`].
///
/// Building never fails: every inconsistency in the input shrinks the
/// graph and records a status against the offending root, and the graph
/// that comes out is internally consistent by construction.
#[derive(Debug)]
pub struct Builder {
    pub source: ObjectStore,
}

// === impl Builder ===

impl Builder {
    pub fn new(source: ObjectStore) -> Self {
        Self { source }
    }

    pub fn build(&self) -> Dag {
        BuildContext::new(&self.source).build()
    }
}

/// Scratch state for a single build pass.
struct BuildContext<'a> {
    source: &'a ObjectStore,
    config: &'a ClusterConfig,

    // Per-build memos so shared references resolve to shared vertices.
    services: HashMap<(Meta, i32), Arc<pylon_core::Service>>,
    secrets: HashMap<Meta, Arc<pylon_core::Secret>>,

    vhosts: BTreeMap<String, VirtualHost>,
    svhosts: BTreeMap<String, SecureVirtualHost>,
    statuses: BTreeMap<RootRef, Status>,

    /// Documents reached through a delegation walk; everything else
    /// without a virtual host is orphaned.
    reached: BTreeSet<RootRef>,
}

impl<'a> BuildContext<'a> {
    fn new(source: &'a ObjectStore) -> Self {
        Self {
            source,
            config: source.config().as_ref(),
            services: HashMap::new(),
            secrets: HashMap::new(),
            vhosts: BTreeMap::new(),
            svhosts: BTreeMap::new(),
            statuses: BTreeMap::new(),
            reached: BTreeSet::new(),
        }
    }

    fn build(mut self) -> Dag {
        self.compute_ingresses();

        let conflicted = self.mark_conflicting_roots();
        self.compute_ingress_routes(&conflicted);
        self.compute_httpproxies(&conflicted);
        self.mark_orphans();

        Dag {
            virtual_hosts: self
                .vhosts
                .into_values()
                .filter(VirtualHost::is_valid)
                .collect(),
            secure_virtual_hosts: self
                .svhosts
                .into_values()
                .filter(SecureVirtualHost::is_valid)
                .collect(),
            statuses: self.statuses,
        }
    }

    // --- Ingress ---

    fn compute_ingresses(&mut self) {
        let source = self.source;
        for (meta, ingress) in source.ingresses() {
            let Some(spec) = &ingress.spec else { continue };
            let anns = ingress.annotations();

            // Hosts listed in the TLS section get a secure virtual host.
            let min_tls_version = annotations::min_tls_version(anns);
            let mut tls_hosts = BTreeSet::new();
            for tls in spec.tls.iter().flatten() {
                let Some(secret_name) = &tls.secret_name else {
                    continue;
                };
                let Some(secret) = self.lookup_tls_secret(&Meta::new(&meta.namespace, secret_name))
                else {
                    debug!(%meta, secret = %secret_name, "ingress TLS secret not usable");
                    continue;
                };
                for host in tls.hosts.iter().flatten() {
                    let svhost = self.svhost(host);
                    svhost.secret = Some(secret.clone());
                    svhost.min_tls_version = min_tls_version;
                    tls_hosts.insert(host.clone());
                }
            }

            let http_allowed = annotations::http_allowed(ingress);
            let force_tls = annotations::tls_required(ingress);
            let timeout_policy = annotations::request_timeout(anns);
            let retry_policy = annotations::retry_policy(anns);
            let websocket_paths = annotations::websocket_routes(anns);

            let add = |ctx: &mut Self, host: &str, route: Route| {
                if http_allowed {
                    ctx.vhost(host).add_route(route.clone());
                }
                if tls_hosts.contains(host) {
                    ctx.svhost(host).host.add_route(route);
                }
            };

            if let Some(backend) = &spec.default_backend {
                if let Some(route) = self.ingress_route(
                    meta,
                    backend,
                    "/",
                    force_tls,
                    &timeout_policy,
                    &retry_policy,
                    &websocket_paths,
                ) {
                    add(self, "*", route);
                }
            }

            for rule in spec.rules.iter().flatten() {
                let host = match rule.host.as_deref() {
                    Some(host) if !host.is_empty() => host.to_string(),
                    _ => "*".to_string(),
                };
                for path in rule.http.iter().flat_map(|http| &http.paths) {
                    let prefix = path.path.as_deref().unwrap_or("/");
                    let Some(route) = self.ingress_route(
                        meta,
                        &path.backend,
                        prefix,
                        force_tls,
                        &timeout_policy,
                        &retry_policy,
                        &websocket_paths,
                    ) else {
                        continue;
                    };
                    add(self, &host, route);
                }
            }
        }
    }

    /// Builds one route for an Ingress path. Ingresses carry no status, so
    /// a dangling backend reference just drops the route.
    #[allow(clippy::too_many_arguments)]
    fn ingress_route(
        &mut self,
        meta: &Meta,
        backend: &k8s::IngressBackend,
        path: &str,
        force_tls: bool,
        timeout_policy: &Option<TimeoutPolicy>,
        retry_policy: &Option<RetryPolicy>,
        websocket_paths: &[String],
    ) -> Option<Route> {
        let service = backend.service.as_ref()?;
        let Some(upstream) = self.lookup_service_backend(&meta.namespace, service) else {
            debug!(%meta, service = %service.name, "ingress backend service not found");
            return None;
        };

        let matcher = if path.chars().any(|c| REGEX_CHARS.contains(c)) {
            RouteMatch::Regex(path.to_string())
        } else {
            RouteMatch::Prefix(path.to_string())
        };

        Some(Route {
            clusters: vec![Arc::new(Cluster {
                upstream,
                ..Cluster::default()
            })],
            https_upgrade: force_tls,
            websocket: websocket_paths.iter().any(|p| p == path),
            timeout_policy: timeout_policy.clone(),
            retry_policy: retry_policy.clone(),
            ..match matcher {
                RouteMatch::Prefix(p) => Route::prefix(p),
                RouteMatch::Regex(r) => Route::regex(r),
            }
        })
    }

    // --- Root ownership ---

    /// Detects FQDNs claimed by more than one root document. Every
    /// claimant is marked invalid and the FQDN is withheld from the graph.
    fn mark_conflicting_roots(&mut self) -> BTreeSet<String> {
        let source = self.source;
        let mut by_fqdn: BTreeMap<&str, Vec<RootRef>> = BTreeMap::new();

        let ingress_roots = source
            .ingress_routes()
            .filter_map(|(meta, ir)| {
                let vh = ir.spec.virtualhost.as_ref()?;
                Some((meta, &vh.fqdn, RootKind::IngressRoute))
            })
            .chain(source.httpproxies().filter_map(|(meta, proxy)| {
                let vh = proxy.spec.virtualhost.as_ref()?;
                Some((meta, &vh.fqdn, RootKind::HttpProxy))
            }));
        for (meta, fqdn, kind) in ingress_roots {
            if fqdn.is_empty() || !self.config.root_allowed(&meta.namespace) {
                continue;
            }
            by_fqdn
                .entry(fqdn)
                .or_default()
                .push(RootRef::new(kind, meta.clone()));
        }

        let mut conflicted = BTreeSet::new();
        for (fqdn, roots) in by_fqdn {
            if roots.len() < 2 {
                continue;
            }
            for root in roots {
                self.statuses.insert(
                    root,
                    Status::invalid(format!(
                        "conflicting root: fqdn \"{fqdn}\" is owned by multiple roots"
                    )),
                );
            }
            conflicted.insert(fqdn.to_string());
        }
        conflicted
    }

    // --- IngressRoute ---

    fn compute_ingress_routes(&mut self, conflicted: &BTreeSet<String>) {
        let source = self.source;
        for (meta, ir) in source.ingress_routes() {
            let Some(vh) = &ir.spec.virtualhost else {
                continue;
            };
            let root = RootRef::new(RootKind::IngressRoute, meta.clone());

            if vh.fqdn.is_empty() {
                self.set_status(
                    root,
                    Status::invalid("Spec.VirtualHost.Fqdn must be specified"),
                );
                continue;
            }
            if !self.config.root_allowed(&meta.namespace) {
                self.set_status(
                    root,
                    Status::invalid("root IngressRoute cannot be defined in this namespace"),
                );
                continue;
            }
            if conflicted.contains(&vh.fqdn) {
                continue;
            }
            let fqdn = &vh.fqdn;

            let mut enforce_tls = false;
            let mut passthrough = false;
            if let Some(tls) = &vh.tls {
                if tls.passthrough {
                    passthrough = true;
                } else if !tls.secret_name.is_empty() {
                    match self.lookup_delegated_secret(&meta.namespace, &tls.secret_name) {
                        Some(secret) => {
                            let min = TlsVersion::parse(&tls.minimum_protocol_version);
                            let svhost = self.svhost(fqdn);
                            svhost.secret = Some(secret);
                            svhost.min_tls_version = min;
                            enforce_tls = true;
                        }
                        None => self.set_status(
                            root.clone(),
                            Status::invalid(format!(
                                "TLS Secret [{}] not found or is malformed",
                                tls.secret_name
                            )),
                        ),
                    }
                }
            }

            let mut visited = vec![meta.clone()];
            self.ingress_route_tree(
                &root,
                fqdn,
                enforce_tls,
                ir,
                &meta.namespace,
                "",
                &mut visited,
            );

            if let Some(tcpproxy) = &ir.spec.tcpproxy {
                if passthrough {
                    if let Some(clusters) =
                        self.route_clusters(&root, &meta.namespace, &tcpproxy.services)
                    {
                        self.svhost(fqdn).tcp_proxy = Some(TcpProxy { clusters });
                    }
                } else {
                    self.set_status(
                        root.clone(),
                        Status::invalid("tcpproxy requires virtualhost.tls.passthrough"),
                    );
                }
            }

            self.set_status(root, Status::valid("valid IngressRoute"));
        }
    }

    /// Walks one document of an IngressRoute delegation tree.
    #[allow(clippy::too_many_arguments)]
    fn ingress_route_tree(
        &mut self,
        root: &RootRef,
        fqdn: &str,
        enforce_tls: bool,
        doc: &k8s::IngressRoute,
        doc_ns: &str,
        parent_prefix: &str,
        visited: &mut Vec<Meta>,
    ) {
        let source = self.source;
        for route in &doc.spec.routes {
            let prefix = &route.match_prefix;
            if !prefix.starts_with(parent_prefix) {
                self.set_status(
                    root.clone(),
                    Status::invalid(format!(
                        "the path prefix \"{prefix}\" does not match the parent's path prefix \
                         \"{parent_prefix}\""
                    )),
                );
                continue;
            }

            if let Some(delegate) = &route.delegate {
                let target = Meta::new(
                    delegate.namespace.as_deref().unwrap_or(doc_ns),
                    &delegate.name,
                );
                if visited.contains(&target) {
                    self.set_status(
                        root.clone(),
                        Status::invalid(format!(
                            "route \"{prefix}\" creates a delegation cycle"
                        )),
                    );
                    continue;
                }
                let Some(next) = source.ingress_route(&target) else {
                    self.set_status(
                        root.clone(),
                        Status::invalid(format!("delegate IngressRoute [{target}] not found")),
                    );
                    continue;
                };
                let target_ref = RootRef::new(RootKind::IngressRoute, target.clone());
                if next.spec.virtualhost.is_some() {
                    self.set_status(
                        root.clone(),
                        Status::invalid(
                            "root IngressRoute cannot delegate to another root IngressRoute",
                        ),
                    );
                    continue;
                }
                self.reached.insert(target_ref.clone());
                self.set_status(target_ref, Status::valid("valid IngressRoute"));

                let target_ns = target.namespace.clone();
                visited.push(target);
                self.ingress_route_tree(
                    root, fqdn, enforce_tls, next, &target_ns, prefix, visited,
                );
                visited.pop();
                continue;
            }

            if route.services.is_empty() {
                self.set_status(
                    root.clone(),
                    Status::invalid(format!(
                        "route \"{prefix}\" must have at least one service or delegate"
                    )),
                );
                continue;
            }
            let Some(clusters) = self.route_clusters(root, doc_ns, &route.services) else {
                continue;
            };

            let permit_insecure = route.permit_insecure && !self.config.disable_permit_insecure;
            let r = Route {
                clusters,
                https_upgrade: enforce_tls && !permit_insecure,
                websocket: route.enable_websockets,
                prefix_rewrite: route.prefix_rewrite.clone(),
                timeout_policy: route.timeout_policy.as_ref().map(|tp| TimeoutPolicy {
                    request: Timeout::parse(&tp.request),
                }),
                retry_policy: route.retry_policy.as_ref().map(retry_policy),
                permit_insecure,
                ..Route::prefix(prefix.clone())
            };

            self.vhost(fqdn).add_route(r.clone());
            if enforce_tls {
                self.svhost(fqdn).host.add_route(r);
            }
        }
    }

    // --- HTTPProxy ---

    fn compute_httpproxies(&mut self, conflicted: &BTreeSet<String>) {
        let source = self.source;
        for (meta, proxy) in source.httpproxies() {
            let Some(vh) = &proxy.spec.virtualhost else {
                continue;
            };
            let root = RootRef::new(RootKind::HttpProxy, meta.clone());

            if vh.fqdn.is_empty() {
                self.set_status(
                    root,
                    Status::invalid("Spec.VirtualHost.Fqdn must be specified"),
                );
                continue;
            }
            if !self.config.root_allowed(&meta.namespace) {
                self.set_status(
                    root,
                    Status::invalid("root HTTPProxy cannot be defined in this namespace"),
                );
                continue;
            }
            if conflicted.contains(&vh.fqdn) {
                continue;
            }
            let fqdn = &vh.fqdn;

            let mut enforce_tls = false;
            let mut passthrough = false;
            if let Some(tls) = &vh.tls {
                if tls.passthrough {
                    passthrough = true;
                } else if !tls.secret_name.is_empty() {
                    match self.lookup_delegated_secret(&meta.namespace, &tls.secret_name) {
                        Some(secret) => {
                            let min = TlsVersion::parse(&tls.minimum_protocol_version);
                            let svhost = self.svhost(fqdn);
                            svhost.secret = Some(secret);
                            svhost.min_tls_version = min;
                            enforce_tls = true;
                        }
                        None => self.set_status(
                            root.clone(),
                            Status::invalid(format!(
                                "TLS Secret [{}] not found or is malformed",
                                tls.secret_name
                            )),
                        ),
                    }
                }
            }

            let mut visited = vec![meta.clone()];
            self.httpproxy_tree(
                &root,
                fqdn,
                enforce_tls,
                proxy,
                &meta.namespace,
                "",
                &mut visited,
            );

            if let Some(tcpproxy) = &proxy.spec.tcpproxy {
                if passthrough {
                    if let Some(clusters) =
                        self.route_clusters(&root, &meta.namespace, &tcpproxy.services)
                    {
                        self.svhost(fqdn).tcp_proxy = Some(TcpProxy { clusters });
                    }
                } else {
                    self.set_status(
                        root.clone(),
                        Status::invalid("tcpproxy requires virtualhost.tls.passthrough"),
                    );
                }
            }

            self.set_status(root, Status::valid("valid HTTPProxy"));
        }
    }

    /// Walks one document of an HTTPProxy include tree.
    #[allow(clippy::too_many_arguments)]
    fn httpproxy_tree(
        &mut self,
        root: &RootRef,
        fqdn: &str,
        enforce_tls: bool,
        doc: &k8s::HTTPProxy,
        doc_ns: &str,
        parent_prefix: &str,
        visited: &mut Vec<Meta>,
    ) {
        let source = self.source;

        for include in &doc.spec.includes {
            let target = Meta::new(
                include.namespace.as_deref().unwrap_or(doc_ns),
                &include.name,
            );
            if visited.contains(&target) {
                self.set_status(
                    root.clone(),
                    Status::invalid(format!(
                        "include of HTTPProxy [{target}] creates a delegation cycle"
                    )),
                );
                continue;
            }
            let Some(next) = source.httpproxy(&target) else {
                self.set_status(
                    root.clone(),
                    Status::invalid(format!("include of HTTPProxy [{target}] not found")),
                );
                continue;
            };
            let target_ref = RootRef::new(RootKind::HttpProxy, target.clone());
            if next.spec.virtualhost.is_some() {
                self.set_status(
                    root.clone(),
                    Status::invalid("root HTTPProxy cannot include another root HTTPProxy"),
                );
                continue;
            }
            self.reached.insert(target_ref.clone());
            self.set_status(target_ref, Status::valid("valid HTTPProxy"));

            let prefix = join_prefix(parent_prefix, &conditions_prefix(&include.conditions));
            let target_ns = target.namespace.clone();
            visited.push(target);
            self.httpproxy_tree(root, fqdn, enforce_tls, next, &target_ns, &prefix, visited);
            visited.pop();
        }

        for route in &doc.spec.routes {
            let prefix = join_prefix(parent_prefix, &conditions_prefix(&route.conditions));

            if route.services.is_empty() {
                self.set_status(
                    root.clone(),
                    Status::invalid(format!(
                        "route \"{prefix}\" must have at least one service"
                    )),
                );
                continue;
            }
            let Some(clusters) = self.route_clusters(root, doc_ns, &route.services) else {
                continue;
            };

            let permit_insecure = route.permit_insecure && !self.config.disable_permit_insecure;
            let r = Route {
                clusters,
                https_upgrade: enforce_tls && !permit_insecure,
                websocket: route.enable_websockets,
                prefix_rewrite: route.prefix_rewrite.clone(),
                timeout_policy: route.timeout_policy.as_ref().map(|tp| TimeoutPolicy {
                    request: Timeout::parse(&tp.request),
                }),
                retry_policy: route.retry_policy.as_ref().map(retry_policy),
                permit_insecure,
                ..Route::prefix(prefix)
            };

            self.vhost(fqdn).add_route(r.clone());
            if enforce_tls {
                self.svhost(fqdn).host.add_route(r);
            }
        }
    }

    // --- Shared resolution ---

    /// Resolves every service reference of a route into clusters. A single
    /// dangling reference voids the whole route and invalidates the root.
    fn route_clusters(
        &mut self,
        root: &RootRef,
        ns: &str,
        services: &[k8s::ingressroute::Service],
    ) -> Option<Vec<Arc<Cluster>>> {
        let mut clusters = Vec::with_capacity(services.len());
        for service in services {
            let meta = Meta::new(ns, &service.name);
            let Some(upstream) = self.lookup_service(&meta, service.port) else {
                self.set_status(
                    root.clone(),
                    Status::invalid(format!(
                        "Service [{}] port [{}] not found",
                        service.name, service.port
                    )),
                );
                return None;
            };

            let upstream_validation = match &service.validation {
                None => None,
                Some(validation) => {
                    let ca_meta = Meta::new(ns, &validation.ca_secret);
                    let Some(ca_secret) = self.lookup_ca_secret(&ca_meta) else {
                        self.set_status(
                            root.clone(),
                            Status::invalid(format!(
                                "upstream validation CA Secret [{}] not found or missing ca.crt",
                                validation.ca_secret
                            )),
                        );
                        return None;
                    };
                    Some(UpstreamValidation {
                        ca_secret,
                        subject_name: validation.subject_name.clone(),
                    })
                }
            };

            clusters.push(Arc::new(Cluster {
                upstream,
                weight: service.weight.unwrap_or(0),
                load_balancer_strategy: service.strategy.clone().unwrap_or_default(),
                health_check: service.health_check.as_ref().map(health_check_policy),
                upstream_validation,
            }));
        }
        Some(clusters)
    }

    fn lookup_service(&mut self, meta: &Meta, port: i32) -> Option<Arc<pylon_core::Service>> {
        let key = (meta.clone(), port);
        if let Some(service) = self.services.get(&key) {
            return Some(service.clone());
        }

        let svc = self.source.service(meta)?;
        let spec = svc.spec.as_ref()?;
        let matched = spec.ports.iter().flatten().find(|p| p.port == port)?;

        let anns = svc.annotations();
        let protocols = annotations::upstream_protocols(anns);
        let port_name = matched.name.clone().unwrap_or_default();
        let protocol = protocols
            .get(&port_name)
            .or_else(|| protocols.get(&port.to_string()))
            .cloned()
            .unwrap_or_default();

        let external_name = (spec.type_.as_deref() == Some("ExternalName"))
            .then(|| spec.external_name.clone())
            .flatten();

        let service = Arc::new(pylon_core::Service {
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
            port,
            port_name,
            protocol,
            max_connections: annotations::parse_u32(
                anns.get(annotations::ANNOTATION_MAX_CONNECTIONS),
            ),
            max_pending_requests: annotations::parse_u32(
                anns.get(annotations::ANNOTATION_MAX_PENDING_REQUESTS),
            ),
            max_requests: annotations::parse_u32(anns.get(annotations::ANNOTATION_MAX_REQUESTS)),
            max_retries: annotations::parse_u32(anns.get(annotations::ANNOTATION_MAX_RETRIES)),
            external_name,
        });
        self.services.insert(key, service.clone());
        Some(service)
    }

    /// Resolves an Ingress backend, which may reference its port by name.
    fn lookup_service_backend(
        &mut self,
        ns: &str,
        backend: &k8s::IngressServiceBackend,
    ) -> Option<Arc<pylon_core::Service>> {
        let meta = Meta::new(ns, &backend.name);
        let port = backend.port.as_ref()?;
        if let Some(number) = port.number {
            return self.lookup_service(&meta, number);
        }

        let port_name = port.name.as_deref()?;
        let number = self
            .source
            .service(&meta)?
            .spec
            .as_ref()?
            .ports
            .iter()
            .flatten()
            .find(|p| p.name.as_deref() == Some(port_name))?
            .port;
        self.lookup_service(&meta, number)
    }

    /// Looks up a secret usable for TLS termination: it must exist and
    /// carry non-empty certificate and key material.
    fn lookup_tls_secret(&mut self, meta: &Meta) -> Option<Arc<pylon_core::Secret>> {
        let secret = self.lookup_secret(meta)?;
        if secret.cert().is_empty() || secret.private_key().is_empty() {
            return None;
        }
        Some(secret)
    }

    /// Looks up a secret usable as a CA bundle for upstream validation.
    fn lookup_ca_secret(&mut self, meta: &Meta) -> Option<Arc<pylon_core::Secret>> {
        let secret = self.lookup_secret(meta)?;
        if secret.ca().is_empty() {
            return None;
        }
        Some(secret)
    }

    fn lookup_secret(&mut self, meta: &Meta) -> Option<Arc<pylon_core::Secret>> {
        if let Some(secret) = self.secrets.get(meta) {
            return Some(secret.clone());
        }
        let secret = self.source.secret(meta)?;
        let data = secret
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.0.clone()))
            .collect();
        let secret = Arc::new(pylon_core::Secret {
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            data,
        });
        self.secrets.insert(meta.clone(), secret.clone());
        Some(secret)
    }

    /// Resolves a `name` or `namespace/name` TLS secret reference made by
    /// a root in `root_ns`. Cross-namespace references require a
    /// TLSCertificateDelegation in the secret's namespace whose targets
    /// include `root_ns` (or the wildcard).
    fn lookup_delegated_secret(
        &mut self,
        root_ns: &str,
        secret_ref: &str,
    ) -> Option<Arc<pylon_core::Secret>> {
        let meta = Meta::from_ref(root_ns, secret_ref);
        if meta.namespace != root_ns && !self.delegation_permits(&meta, root_ns) {
            debug!(secret = %meta, ns = %root_ns, "cross-namespace secret not delegated");
            return None;
        }
        self.lookup_tls_secret(&meta)
    }

    fn delegation_permits(&self, secret: &Meta, to_ns: &str) -> bool {
        self.source.delegations().any(|(del_meta, delegation)| {
            del_meta.namespace == secret.namespace
                && delegation.spec.delegations.iter().any(|cd| {
                    cd.secret_name == secret.name
                        && cd
                            .target_namespaces
                            .iter()
                            .any(|target| target == "*" || target == to_ns)
                })
        })
    }

    // --- Bookkeeping ---

    fn vhost(&mut self, name: &str) -> &mut VirtualHost {
        self.vhosts
            .entry(name.to_string())
            .or_insert_with(|| VirtualHost::new(name))
    }

    fn svhost(&mut self, name: &str) -> &mut SecureVirtualHost {
        self.svhosts
            .entry(name.to_string())
            .or_insert_with(|| SecureVirtualHost {
                host: VirtualHost::new(name),
                secret: None,
                min_tls_version: TlsVersion::default(),
                tcp_proxy: None,
            })
    }

    /// Records a status for a root. The first status recorded wins, so an
    /// error observed mid-walk is not papered over by the final valid
    /// marker.
    fn set_status(&mut self, root: RootRef, status: Status) {
        self.statuses.entry(root).or_insert(status);
    }

    fn mark_orphans(&mut self) {
        let source = self.source;
        let orphans: Vec<(RootRef, &'static str)> = source
            .ingress_routes()
            .filter(|(_, ir)| ir.spec.virtualhost.is_none())
            .map(|(meta, _)| {
                (
                    RootRef::new(RootKind::IngressRoute, meta.clone()),
                    "this IngressRoute is not part of a delegation chain from a root IngressRoute",
                )
            })
            .chain(
                source
                    .httpproxies()
                    .filter(|(_, proxy)| proxy.spec.virtualhost.is_none())
                    .map(|(meta, _)| {
                        (
                            RootRef::new(RootKind::HttpProxy, meta.clone()),
                            "this HTTPProxy is not part of an include chain from a root HTTPProxy",
                        )
                    }),
            )
            .collect();

        for (orphan, description) in orphans {
            if !self.reached.contains(&orphan) {
                self.set_status(orphan, Status::orphaned(description));
            }
        }
    }
}

fn retry_policy(rp: &k8s::ingressroute::RetryPolicy) -> RetryPolicy {
    RetryPolicy {
        retry_on: DEFAULT_RETRY_ON.to_string(),
        num_retries: rp.count.max(1),
        per_try_timeout: rp.per_try_timeout.as_deref().and_then(parse_duration),
    }
}

fn health_check_policy(hc: &k8s::ingressroute::HealthCheck) -> HealthCheckPolicy {
    HealthCheckPolicy {
        path: hc.path.clone(),
        host: hc
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| HC_HOST.to_string()),
        interval: hc
            .interval_seconds
            .map(|s| Duration::from_secs(s.max(0) as u64))
            .unwrap_or(HC_INTERVAL),
        timeout: hc
            .timeout_seconds
            .map(|s| Duration::from_secs(s.max(0) as u64))
            .unwrap_or(HC_TIMEOUT),
        unhealthy_threshold: match hc.unhealthy_threshold_count {
            Some(n) if n > 0 => n,
            _ => HC_UNHEALTHY_THRESHOLD,
        },
        healthy_threshold: match hc.healthy_threshold_count {
            Some(n) if n > 0 => n,
            _ => HC_HEALTHY_THRESHOLD,
        },
    }
}

/// Joins an inherited path prefix with a child condition prefix.
fn join_prefix(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if child.is_empty() {
        return if parent.is_empty() {
            "/".to_string()
        } else {
            parent.to_string()
        };
    }
    if child.starts_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Concatenates the prefix conditions of a condition list, in order.
fn conditions_prefix(conditions: &[k8s::httpproxy::Condition]) -> String {
    conditions
        .iter()
        .filter_map(|c| c.prefix.as_deref())
        .filter(|p| !p.is_empty())
        .fold(String::new(), |acc, p| join_prefix(&acc, p))
}

#[cfg(test)]
mod tests {
    use super::{conditions_prefix, join_prefix};
    use pylon_k8s_api::httpproxy::Condition;

    #[test]
    fn prefix_joining() {
        assert_eq!(join_prefix("", ""), "/");
        assert_eq!(join_prefix("", "/app"), "/app");
        assert_eq!(join_prefix("/app", ""), "/app");
        assert_eq!(join_prefix("/app/", "/v1"), "/app/v1");
        assert_eq!(join_prefix("/app", "v1"), "/app/v1");
    }

    #[test]
    fn condition_prefixes_concatenate_in_order() {
        let conditions = vec![
            Condition {
                prefix: Some("/api".to_string()),
            },
            Condition { prefix: None },
            Condition {
                prefix: Some("/v2".to_string()),
            },
        ];
        assert_eq!(conditions_prefix(&conditions), "/api/v2");
    }
}
