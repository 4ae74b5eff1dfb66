use crate::{annotations, SharedClusterConfig};
use pylon_core::Meta;
use pylon_k8s_api::{
    Ingress, IngressRoute, ResourceExt, Secret, Service, TLSCertificateDelegation, HTTPProxy,
    SECRET_TYPE_SERVICE_ACCOUNT_TOKEN, SECRET_TYPE_TLS,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Any object the store may be asked to hold.
#[derive(Clone, Debug, PartialEq)]
pub enum AnyObject {
    Service(Service),
    Secret(Secret),
    Ingress(Ingress),
    IngressRoute(IngressRoute),
    HttpProxy(HTTPProxy),
    Delegation(TLSCertificateDelegation),

    /// A deletion whose final object state was missed; wraps the last
    /// known value.
    Tombstone(Box<AnyObject>),
}

/// Holds the cluster objects the routing graph is built from.
///
/// Irrelevant objects are rejected at insertion so the builder never has
/// to filter, and so that a mutation can report whether it is capable of
/// changing the graph at all. The store has a single writer (the event
/// handler task) and its only reader is the builder, which runs on that
/// same task; it therefore needs no lock.
#[derive(Debug, Default)]
pub struct ObjectStore {
    config: SharedClusterConfig,

    ingresses: BTreeMap<Meta, Ingress>,
    ingress_routes: BTreeMap<Meta, IngressRoute>,
    httpproxies: BTreeMap<Meta, HTTPProxy>,
    secrets: BTreeMap<Meta, Secret>,
    delegations: BTreeMap<Meta, TLSCertificateDelegation>,
    services: BTreeMap<Meta, Service>,
}

// === impl AnyObject ===

impl AnyObject {
    pub fn meta(&self) -> Meta {
        match self {
            AnyObject::Service(o) => meta_of(o),
            AnyObject::Secret(o) => meta_of(o),
            AnyObject::Ingress(o) => meta_of(o),
            AnyObject::IngressRoute(o) => meta_of(o),
            AnyObject::HttpProxy(o) => meta_of(o),
            AnyObject::Delegation(o) => meta_of(o),
            AnyObject::Tombstone(inner) => inner.meta(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AnyObject::Service(_) => "Service",
            AnyObject::Secret(_) => "Secret",
            AnyObject::Ingress(_) => "Ingress",
            AnyObject::IngressRoute(_) => "IngressRoute",
            AnyObject::HttpProxy(_) => "HTTPProxy",
            AnyObject::Delegation(_) => "TLSCertificateDelegation",
            AnyObject::Tombstone(inner) => inner.kind(),
        }
    }

    /// Compares two objects while masking the fields a rebuild can never
    /// depend on: resource-version metadata and status subresources. An
    /// update that is equal under this comparison must not trigger a
    /// rebuild.
    pub fn same_ignoring_status(&self, other: &AnyObject) -> bool {
        self.clone().masked() == other.clone().masked()
    }

    fn masked(mut self) -> AnyObject {
        match &mut self {
            AnyObject::Service(o) => o.metadata.resource_version = None,
            AnyObject::Secret(o) => o.metadata.resource_version = None,
            AnyObject::Ingress(o) => o.metadata.resource_version = None,
            AnyObject::IngressRoute(o) => {
                o.metadata.resource_version = None;
                o.status = None;
            }
            AnyObject::HttpProxy(o) => {
                o.metadata.resource_version = None;
                o.status = None;
            }
            AnyObject::Delegation(o) => o.metadata.resource_version = None,
            AnyObject::Tombstone(inner) => {
                let unwrapped = std::mem::replace(inner.as_mut(), placeholder());
                return unwrapped.masked();
            }
        }
        self
    }
}

fn placeholder() -> AnyObject {
    AnyObject::Service(Service::default())
}

impl From<Service> for AnyObject {
    fn from(obj: Service) -> Self {
        AnyObject::Service(obj)
    }
}

impl From<Secret> for AnyObject {
    fn from(obj: Secret) -> Self {
        AnyObject::Secret(obj)
    }
}

impl From<Ingress> for AnyObject {
    fn from(obj: Ingress) -> Self {
        AnyObject::Ingress(obj)
    }
}

impl From<IngressRoute> for AnyObject {
    fn from(obj: IngressRoute) -> Self {
        AnyObject::IngressRoute(obj)
    }
}

impl From<HTTPProxy> for AnyObject {
    fn from(obj: HTTPProxy) -> Self {
        AnyObject::HttpProxy(obj)
    }
}

impl From<TLSCertificateDelegation> for AnyObject {
    fn from(obj: TLSCertificateDelegation) -> Self {
        AnyObject::Delegation(obj)
    }
}

fn meta_of(obj: &impl ResourceExt) -> Meta {
    Meta::new(obj.namespace().unwrap_or_default(), obj.name_unchecked())
}

// === impl ObjectStore ===

impl ObjectStore {
    pub fn new(config: SharedClusterConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &SharedClusterConfig {
        &self.config
    }

    /// Inserts `obj`, overwriting any previous object with the same kind,
    /// namespace, and name. Returns true if the mutation may change the
    /// routing graph; false if the object is of no interest to it.
    pub fn insert(&mut self, obj: AnyObject) -> bool {
        match obj {
            AnyObject::Secret(secret) => {
                if secret.type_.as_deref() == Some(SECRET_TYPE_SERVICE_ACCOUNT_TOKEN) {
                    return false;
                }
                let has_ca = secret
                    .data
                    .as_ref()
                    .is_some_and(|data| data.contains_key("ca.crt"));
                if secret.type_.as_deref() != Some(SECRET_TYPE_TLS) && !has_ca {
                    return false;
                }
                let triggers = self.secret_triggers_rebuild(&secret);
                self.secrets.insert(meta_of(&secret), secret);
                triggers
            }
            AnyObject::Service(service) => {
                let triggers = self.service_triggers_rebuild(&service);
                self.services.insert(meta_of(&service), service);
                triggers
            }
            AnyObject::Ingress(ingress) => {
                if !self.class_matches(&ingress) {
                    return false;
                }
                self.ingresses.insert(meta_of(&ingress), ingress);
                true
            }
            AnyObject::IngressRoute(route) => {
                if !self.class_matches(&route) {
                    return false;
                }
                self.ingress_routes.insert(meta_of(&route), route);
                true
            }
            AnyObject::HttpProxy(proxy) => {
                if !self.class_matches(&proxy) {
                    return false;
                }
                self.httpproxies.insert(meta_of(&proxy), proxy);
                true
            }
            AnyObject::Delegation(delegation) => {
                self.delegations.insert(meta_of(&delegation), delegation);
                true
            }
            AnyObject::Tombstone(_) => {
                debug!(kind = %obj.kind(), "refusing to insert tombstone");
                false
            }
        }
    }

    /// Removes `obj` by kind, namespace, and name. Returns true if the
    /// store held it.
    pub fn remove(&mut self, obj: &AnyObject) -> bool {
        let meta = obj.meta();
        match obj {
            AnyObject::Service(_) => self.services.remove(&meta).is_some(),
            AnyObject::Secret(_) => self.secrets.remove(&meta).is_some(),
            AnyObject::Ingress(_) => self.ingresses.remove(&meta).is_some(),
            AnyObject::IngressRoute(_) => self.ingress_routes.remove(&meta).is_some(),
            AnyObject::HttpProxy(_) => self.httpproxies.remove(&meta).is_some(),
            AnyObject::Delegation(_) => self.delegations.remove(&meta).is_some(),
            AnyObject::Tombstone(inner) => self.remove(inner),
        }
    }

    fn class_matches(&self, obj: &impl ResourceExt) -> bool {
        match annotations::ingress_class(obj.annotations()) {
            Some(class) => class == self.config.ingress_class(),
            None => true,
        }
    }

    /// True if any routing document in the service's namespace names it as
    /// a backend.
    fn service_triggers_rebuild(&self, service: &Service) -> bool {
        let meta = meta_of(service);

        for (ing_meta, ingress) in &self.ingresses {
            if ing_meta.namespace != meta.namespace {
                continue;
            }
            let Some(spec) = &ingress.spec else { continue };
            if let Some(backend) = &spec.default_backend {
                if backend_names_service(backend, &meta.name) {
                    return true;
                }
            }
            for rule in spec.rules.iter().flatten() {
                for path in rule.http.iter().flat_map(|http| &http.paths) {
                    if backend_names_service(&path.backend, &meta.name) {
                        return true;
                    }
                }
            }
        }

        for (ir_meta, route) in &self.ingress_routes {
            if ir_meta.namespace != meta.namespace {
                continue;
            }
            let routed = route
                .spec
                .routes
                .iter()
                .flat_map(|r| &r.services)
                .chain(route.spec.tcpproxy.iter().flat_map(|t| &t.services));
            if routed.into_iter().any(|s| s.name == meta.name) {
                return true;
            }
        }

        for (proxy_meta, proxy) in &self.httpproxies {
            if proxy_meta.namespace != meta.namespace {
                continue;
            }
            let routed = proxy
                .spec
                .routes
                .iter()
                .flat_map(|r| &r.services)
                .chain(proxy.spec.tcpproxy.iter().flat_map(|t| &t.services));
            if routed.into_iter().any(|s| s.name == meta.name) {
                return true;
            }
        }

        false
    }

    /// True if any TLS spec in the store references this secret, directly
    /// or through a delegation. A CA-carrying secret always triggers: the
    /// precise answer would require walking every root's upstream
    /// validation references, which the builder already does per rebuild.
    fn secret_triggers_rebuild(&self, secret: &Secret) -> bool {
        if secret
            .data
            .as_ref()
            .is_some_and(|data| data.contains_key("ca.crt"))
        {
            return true;
        }

        let meta = meta_of(secret);
        let qualified = format!("{meta}");

        // (target namespace, secret name) pairs permitted by delegations.
        let mut delegated = BTreeSet::new();
        for delegation in self.delegations.values() {
            for cd in &delegation.spec.delegations {
                for target in &cd.target_namespaces {
                    delegated.insert((target.clone(), cd.secret_name.clone()));
                }
            }
        }
        let permits = |referrer_ns: &str| {
            delegated.contains(&(referrer_ns.to_string(), meta.name.clone()))
                || delegated.contains(&("*".to_string(), meta.name.clone()))
        };

        for (ing_meta, ingress) in &self.ingresses {
            let tls = ingress.spec.iter().flat_map(|spec| spec.tls.iter().flatten());
            for t in tls {
                let Some(secret_name) = &t.secret_name else {
                    continue;
                };
                if ing_meta.namespace == meta.namespace && *secret_name == meta.name {
                    return true;
                }
                if *secret_name == qualified && permits(&ing_meta.namespace) {
                    return true;
                }
            }
        }

        let crd_tls = self
            .ingress_routes
            .iter()
            .filter_map(|(m, ir)| Some((m, ir.spec.virtualhost.as_ref()?.tls.as_ref()?)))
            .chain(
                self.httpproxies
                    .iter()
                    .filter_map(|(m, hp)| Some((m, hp.spec.virtualhost.as_ref()?.tls.as_ref()?))),
            );
        for (doc_meta, tls) in crd_tls {
            if doc_meta.namespace == meta.namespace && tls.secret_name == meta.name {
                return true;
            }
            if tls.secret_name == qualified && permits(&doc_meta.namespace) {
                return true;
            }
        }

        false
    }

    // Read accessors used by the builder. All iteration is in (namespace,
    // name) order so rebuild output is deterministic.

    pub fn ingresses(&self) -> impl Iterator<Item = (&Meta, &Ingress)> {
        self.ingresses.iter()
    }

    pub fn ingress_routes(&self) -> impl Iterator<Item = (&Meta, &IngressRoute)> {
        self.ingress_routes.iter()
    }

    pub fn httpproxies(&self) -> impl Iterator<Item = (&Meta, &HTTPProxy)> {
        self.httpproxies.iter()
    }

    pub fn delegations(&self) -> impl Iterator<Item = (&Meta, &TLSCertificateDelegation)> {
        self.delegations.iter()
    }

    pub fn ingress_route(&self, meta: &Meta) -> Option<&IngressRoute> {
        self.ingress_routes.get(meta)
    }

    pub fn httpproxy(&self, meta: &Meta) -> Option<&HTTPProxy> {
        self.httpproxies.get(meta)
    }

    pub fn service(&self, meta: &Meta) -> Option<&Service> {
        self.services.get(meta)
    }

    pub fn secret(&self, meta: &Meta) -> Option<&Secret> {
        self.secrets.get(meta)
    }
}

fn backend_names_service(backend: &pylon_k8s_api::IngressBackend, name: &str) -> bool {
    backend
        .service
        .as_ref()
        .is_some_and(|service| service.name == name)
}
