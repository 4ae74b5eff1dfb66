use crate::{
    envoy, CacheHandler, EventHandler, ListenerConfig, ResourceCache as _, SnapshotCache,
};
use prost::Message;
use pylon_core::{
    Cluster as DagCluster, Dag, Route, Service as DagService, Timeout, TimeoutPolicy, VirtualHost,
};
use pylon_k8s_api::{
    ByteString, HTTPIngressRuleValue, Ingress, IngressBackend, IngressServiceBackend, IngressSpec,
    IngressTLS, ObjectMeta, Secret, Service, ServiceBackendPort, ServicePort, ServiceSpec,
};
use pylon_k8s_index::{AnyObject, Builder, ClusterConfig, ObjectStore, Op};
use pylon_k8s_status::StatusUpdate;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time};
use xds_api::pb::envoy::config::{
    cluster::v3::{cluster, Cluster},
    listener::v3::Listener,
    route::v3::{route, route_action, RouteConfiguration},
};

fn decode<T: Message + Default>(any: &prost_types::Any) -> T {
    T::decode(any.value.as_slice()).expect("resource must decode")
}

fn meta(ns: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(ns.to_string()),
        name: Some(name.to_string()),
        ..ObjectMeta::default()
    }
}

fn k8s_service(ns: &str, name: &str, port: i32) -> Service {
    Service {
        metadata: meta(ns, name),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port,
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

fn default_backend_ingress(ns: &str, name: &str, svc: &str, port: i32) -> Ingress {
    Ingress {
        metadata: meta(ns, name),
        spec: Some(IngressSpec {
            default_backend: Some(IngressBackend {
                service: Some(IngressServiceBackend {
                    name: svc.to_string(),
                    port: Some(ServiceBackendPort {
                        number: Some(port),
                        ..ServiceBackendPort::default()
                    }),
                }),
                ..IngressBackend::default()
            }),
            ..IngressSpec::default()
        }),
        ..Ingress::default()
    }
}

fn tls_secret(ns: &str, name: &str) -> Secret {
    let data: BTreeMap<String, ByteString> = [
        ("tls.crt", b"certificate".to_vec()),
        ("tls.key", b"key".to_vec()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), ByteString(v)))
    .collect();
    Secret {
        metadata: meta(ns, name),
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Secret::default()
    }
}

fn dag_cluster(ns: &str, name: &str, port: i32, weight: u32, strategy: &str) -> Arc<DagCluster> {
    Arc::new(DagCluster {
        upstream: Arc::new(DagService {
            name: name.to_string(),
            namespace: ns.to_string(),
            port,
            ..DagService::default()
        }),
        weight,
        load_balancer_strategy: strategy.to_string(),
        ..DagCluster::default()
    })
}

fn forwarded_cluster(config: &RouteConfiguration, vhost: usize, route: usize) -> String {
    let action = config.virtual_hosts[vhost].routes[route]
        .action
        .clone()
        .expect("route must have an action");
    match action {
        route::Action::Route(action) => match action.cluster_specifier {
            Some(route_action::ClusterSpecifier::Cluster(name)) => name,
            other => panic!("expected a single cluster, got {other:?}"),
        },
        other => panic!("expected a forwarding action, got {other:?}"),
    }
}

mod translation {
    use super::*;

    #[test]
    fn default_backend_ingress_programs_the_wildcard_host() {
        let mut store = ObjectStore::new(Arc::new(ClusterConfig::default()));
        store.insert(AnyObject::Service(k8s_service("default", "kuard", 80)));
        store.insert(AnyObject::Ingress(default_backend_ingress(
            "default", "kuard", "kuard", 80,
        )));

        let caches = CacheHandler::new(ListenerConfig::default());
        caches.on_change(&Builder::new(store).build());

        let routes = caches.route.query(&[]);
        assert_eq!(routes.len(), 2);
        let http: RouteConfiguration = decode(&routes[0]);
        let https: RouteConfiguration = decode(&routes[1]);
        assert_eq!(http.name, "ingress_http");
        assert_eq!(https.name, "ingress_https");

        assert_eq!(http.virtual_hosts.len(), 1);
        assert_eq!(http.virtual_hosts[0].domains, vec!["*".to_string()]);
        assert_eq!(
            forwarded_cluster(&http, 0, 0),
            "default/kuard/80/da39a3ee5e"
        );
        assert!(https.virtual_hosts.is_empty());

        // No secure hosts: only the plaintext listener exists.
        let listeners = caches.listener.query(&[]);
        assert_eq!(listeners.len(), 1);
        let listener: Listener = decode(&listeners[0]);
        assert_eq!(listener.name, "ingress_http");

        let clusters = caches.cluster.query(&[]);
        assert_eq!(clusters.len(), 1);
        let cluster: Cluster = decode(&clusters[0]);
        assert_eq!(cluster.name, "default/kuard/80/da39a3ee5e");
        assert_eq!(cluster.alt_stat_name, "default_kuard_80");
        assert_eq!(cluster.lb_policy, cluster::LbPolicy::RoundRobin as i32);
    }

    #[test]
    fn force_ssl_redirect_swaps_the_plaintext_action() {
        let mut store = ObjectStore::new(Arc::new(ClusterConfig::default()));
        store.insert(AnyObject::Service(k8s_service("default", "app", 80)));
        store.insert(AnyObject::Secret(tls_secret("default", "hello-kitty")));
        let ingress = Ingress {
            metadata: ObjectMeta {
                annotations: Some(
                    [(
                        "ingress.kubernetes.io/force-ssl-redirect".to_string(),
                        "true".to_string(),
                    )]
                    .into_iter()
                    .collect(),
                ),
                ..meta("default", "app")
            },
            spec: Some(IngressSpec {
                tls: Some(vec![IngressTLS {
                    hosts: Some(vec!["hello.example.com".to_string()]),
                    secret_name: Some("hello-kitty".to_string()),
                }]),
                rules: Some(vec![pylon_k8s_api::IngressRule {
                    host: Some("hello.example.com".to_string()),
                    http: Some(k8s_openapi_rule_value("/", "app", 80)),
                }]),
                ..IngressSpec::default()
            }),
            ..Ingress::default()
        };
        store.insert(AnyObject::Ingress(ingress));

        let caches = CacheHandler::new(ListenerConfig::default());
        caches.on_change(&Builder::new(store).build());

        let routes = caches.route.query(&["ingress_http".to_string()]);
        let http: RouteConfiguration = decode(&routes[0]);
        assert_eq!(
            http.virtual_hosts[0].domains,
            vec![
                "hello.example.com".to_string(),
                "hello.example.com:*".to_string()
            ]
        );
        assert!(matches!(
            http.virtual_hosts[0].routes[0].action,
            Some(route::Action::Redirect(_))
        ));

        let routes = caches.route.query(&["ingress_https".to_string()]);
        let https: RouteConfiguration = decode(&routes[0]);
        assert_eq!(https.virtual_hosts.len(), 1);
        assert!(matches!(
            https.virtual_hosts[0].routes[0].action,
            Some(route::Action::Route(_))
        ));

        // The secure listener and the SDS secret are programmed too.
        assert_eq!(caches.listener.query(&[]).len(), 2);
        assert_eq!(
            caches.secret.query(&[]).len(),
            1,
            "one secret entry expected"
        );
    }

    fn k8s_openapi_rule_value(path: &str, svc: &str, port: i32) -> HTTPIngressRuleValue {
        HTTPIngressRuleValue {
            paths: vec![pylon_k8s_api::HTTPIngressPath {
                path: Some(path.to_string()),
                path_type: "Prefix".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: svc.to_string(),
                        port: Some(ServiceBackendPort {
                            number: Some(port),
                            ..ServiceBackendPort::default()
                        }),
                    }),
                    ..IngressBackend::default()
                },
            }],
        }
    }

    #[test]
    fn routes_order_regex_first_then_longest_prefix() {
        let mut vh = VirtualHost::new("ordering.example.com");
        for route in [
            Route {
                clusters: vec![dag_cluster("default", "app", 80, 0, "")],
                ..Route::prefix("/")
            },
            Route {
                clusters: vec![dag_cluster("default", "app", 80, 0, "")],
                ..Route::prefix("/longer/path")
            },
            Route {
                clusters: vec![dag_cluster("default", "app", 80, 0, "")],
                ..Route::regex("/api/v?")
            },
            Route {
                clusters: vec![dag_cluster("default", "app", 80, 0, "")],
                ..Route::prefix("/longer")
            },
        ] {
            vh.add_route(route);
        }
        let dag = Dag {
            virtual_hosts: vec![vh],
            ..Dag::default()
        };

        let configs = envoy::route::route_configurations(&dag);
        let http = &configs["ingress_http"];
        let matchers: Vec<_> = http.virtual_hosts[0]
            .routes
            .iter()
            .map(|r| r.r#match.clone().unwrap().path_specifier.unwrap())
            .collect();

        use xds_api::pb::envoy::config::route::v3::route_match::PathSpecifier;
        match &matchers[0] {
            PathSpecifier::SafeRegex(regex) => assert_eq!(regex.regex, "/api/v?"),
            other => panic!("expected the regex first, got {other:?}"),
        }
        assert_eq!(
            matchers[1],
            PathSpecifier::Prefix("/longer/path".to_string())
        );
        assert_eq!(matchers[2], PathSpecifier::Prefix("/longer".to_string()));
        assert_eq!(matchers[3], PathSpecifier::Prefix("/".to_string()));
    }

    #[test]
    fn zero_weights_normalize_to_uniform_distribution() {
        let mut vh = VirtualHost::new("weights.example.com");
        vh.add_route(Route {
            clusters: vec![
                dag_cluster("default", "beta", 80, 0, ""),
                dag_cluster("default", "alpha", 80, 0, ""),
            ],
            ..Route::prefix("/")
        });
        let dag = Dag {
            virtual_hosts: vec![vh],
            ..Dag::default()
        };

        let configs = envoy::route::route_configurations(&dag);
        let action = configs["ingress_http"].virtual_hosts[0].routes[0]
            .action
            .clone()
            .unwrap();
        let route::Action::Route(action) = action else {
            panic!("expected a forwarding action");
        };
        let Some(route_action::ClusterSpecifier::WeightedClusters(weighted)) =
            action.cluster_specifier
        else {
            panic!("expected weighted clusters");
        };

        assert_eq!(weighted.total_weight, Some(2));
        assert!(weighted.clusters.iter().all(|c| c.weight == Some(1)));
        // Ascending by name: alpha before beta.
        assert!(weighted.clusters[0].name.contains("alpha"));
        assert!(weighted.clusters[1].name.contains("beta"));
    }

    #[test]
    fn cookie_strategy_emits_session_affinity() {
        let mut vh = VirtualHost::new("cookie.example.com");
        vh.add_route(Route {
            clusters: vec![dag_cluster("default", "app", 80, 0, "Cookie")],
            ..Route::prefix("/")
        });
        let dag = Dag {
            virtual_hosts: vec![vh],
            ..Dag::default()
        };

        let configs = envoy::route::route_configurations(&dag);
        let action = configs["ingress_http"].virtual_hosts[0].routes[0]
            .action
            .clone()
            .unwrap();
        let route::Action::Route(action) = action else {
            panic!("expected a forwarding action");
        };
        assert_eq!(action.hash_policy.len(), 1);

        let cluster = envoy::cluster::cluster(&dag_cluster("default", "app", 80, 0, "Cookie"));
        assert_eq!(cluster.lb_policy, cluster::LbPolicy::RingHash as i32);
    }

    #[test]
    fn unknown_strategy_falls_back_to_round_robin_with_its_own_name() {
        let lulz = envoy::cluster::cluster(&dag_cluster("default", "kuard", 80, 0, "lulz"));
        assert_eq!(lulz.lb_policy, cluster::LbPolicy::RoundRobin as i32);
        assert!(lulz.name.starts_with("default/kuard/80/"));
        assert_ne!(lulz.name, "default/kuard/80/da39a3ee5e");
    }

    #[test]
    fn timeouts_encode_with_the_documented_inversion() {
        let with_timeout = |timeout| {
            let mut vh = VirtualHost::new("timeouts.example.com");
            vh.add_route(Route {
                clusters: vec![dag_cluster("default", "app", 80, 0, "")],
                timeout_policy: Some(TimeoutPolicy { request: timeout }),
                ..Route::prefix("/")
            });
            let dag = Dag {
                virtual_hosts: vec![vh],
                ..Dag::default()
            };
            let configs = envoy::route::route_configurations(&dag);
            let action = configs["ingress_http"].virtual_hosts[0].routes[0]
                .action
                .clone()
                .unwrap();
            match action {
                route::Action::Route(action) => action.timeout,
                other => panic!("expected a forwarding action, got {other:?}"),
            }
        };

        assert_eq!(with_timeout(Timeout::Default), None);
        assert_eq!(
            with_timeout(Timeout::Finite(Duration::from_secs(90))),
            Some(prost_types::Duration {
                seconds: 90,
                nanos: 0
            })
        );
        // Infinity is the literal zero duration on the wire.
        assert_eq!(
            with_timeout(Timeout::Infinite),
            Some(prost_types::Duration {
                seconds: 0,
                nanos: 0
            })
        );
    }

    #[test]
    fn external_name_services_use_dns_discovery() {
        let cluster = envoy::cluster::cluster(&Arc::new(DagCluster {
            upstream: Arc::new(DagService {
                name: "saas".to_string(),
                namespace: "default".to_string(),
                port: 443,
                external_name: Some("app.example.net".to_string()),
                ..DagService::default()
            }),
            ..DagCluster::default()
        }));

        assert_eq!(
            cluster.cluster_discovery_type,
            Some(cluster::ClusterDiscoveryType::Type(
                cluster::DiscoveryType::StrictDns as i32
            ))
        );
        assert!(cluster.eds_cluster_config.is_none());
        assert!(cluster.load_assignment.is_some());
    }

    #[test]
    fn identical_stores_translate_to_identical_snapshots() {
        let mk = || {
            let mut store = ObjectStore::new(Arc::new(ClusterConfig::default()));
            store.insert(AnyObject::Service(k8s_service("default", "kuard", 80)));
            store.insert(AnyObject::Secret(tls_secret("default", "tls-cert")));
            store.insert(AnyObject::Ingress(default_backend_ingress(
                "default", "kuard", "kuard", 80,
            )));
            let caches = CacheHandler::new(ListenerConfig::default());
            caches.on_change(&Builder::new(store).build());
            caches
        };

        let (a, b) = (mk(), mk());
        assert_eq!(a.listener.query(&[]), b.listener.query(&[]));
        assert_eq!(a.route.query(&[]), b.route.query(&[]));
        assert_eq!(a.cluster.query(&[]), b.cluster.query(&[]));
        assert_eq!(a.secret.query(&[]), b.secret.query(&[]));
    }
}

mod holdoff {
    use super::*;

    const HOLDOFF: Duration = Duration::from_millis(100);
    const HOLDOFF_MAX: Duration = Duration::from_millis(500);

    struct Harness {
        ops: mpsc::UnboundedSender<Op>,
        seq: mpsc::Receiver<u64>,
        route_version: Arc<SnapshotCache<RouteConfiguration>>,
        _status: mpsc::UnboundedReceiver<StatusUpdate>,
        _drain_tx: drain::Signal,
    }

    fn spawn_handler() -> Harness {
        let caches = CacheHandler::new(ListenerConfig::default());
        let route_version = caches.route.clone();
        let (status_tx, _status) = mpsc::unbounded_channel();
        let (seq_tx, seq) = mpsc::channel(32);
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let (_drain_tx, drain_rx) = drain::channel();

        let builder = Builder::new(ObjectStore::new(Arc::new(ClusterConfig::default())));
        let handler = EventHandler::new(
            builder,
            caches,
            status_tx,
            HOLDOFF,
            HOLDOFF_MAX,
            Some(seq_tx),
        );
        tokio::spawn(handler.run(ops_rx, drain_rx));

        Harness {
            ops,
            seq,
            route_version,
            _status,
            _drain_tx,
        }
    }

    fn ingress(name: &str) -> Op {
        Op::Add(AnyObject::Ingress(default_backend_ingress(
            "default", name, "kuard", 80,
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn a_burst_coalesces_into_one_rebuild() {
        let mut h = spawn_handler();

        h.ops.send(ingress("a")).unwrap();
        h.ops.send(ingress("b")).unwrap();
        h.ops.send(ingress("c")).unwrap();

        // The holdoff timer fires once for the whole burst.
        assert_eq!(h.seq.recv().await, Some(1));
        assert_eq!(h.route_version.version(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_stale_pipeline_rebuilds_immediately() {
        let mut h = spawn_handler();

        h.ops.send(ingress("a")).unwrap();
        assert_eq!(h.seq.recv().await, Some(1));

        // Let far more than the ceiling pass, then deliver another event:
        // the rebuild happens without waiting out a holdoff.
        time::advance(HOLDOFF_MAX + Duration::from_millis(1)).await;
        h.ops.send(ingress("b")).unwrap();
        assert_eq!(h.seq.recv().await, Some(2));
        assert_eq!(h.route_version.version(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn irrelevant_events_do_not_rebuild() {
        let mut h = spawn_handler();

        let mut foreign = default_backend_ingress("default", "other", "kuard", 80);
        foreign.metadata.annotations = Some(
            [(
                "kubernetes.io/ingress.class".to_string(),
                "nginx".to_string(),
            )]
            .into_iter()
            .collect(),
        );
        h.ops.send(Op::Add(AnyObject::Ingress(foreign))).unwrap();

        // Observers hear about the event, but nothing was rebuilt.
        assert_eq!(h.seq.recv().await, Some(1));
        assert_eq!(h.route_version.version(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn status_only_updates_are_suppressed() {
        let mut h = spawn_handler();

        h.ops.send(ingress("a")).unwrap();
        assert_eq!(h.seq.recv().await, Some(1));
        assert_eq!(h.route_version.version(), 1);

        let mut old = default_backend_ingress("default", "a", "kuard", 80);
        old.metadata.resource_version = Some("1".to_string());
        let mut new = old.clone();
        new.metadata.resource_version = Some("2".to_string());

        h.ops
            .send(Op::Update {
                old: AnyObject::Ingress(old),
                new: AnyObject::Ingress(new),
            })
            .unwrap();
        assert_eq!(h.seq.recv().await, Some(2));
        assert_eq!(h.route_version.version(), 1, "no rebuild expected");
    }
}
