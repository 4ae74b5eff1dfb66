//! Route configuration construction.

use super::duration;
use pylon_core::{hashname, Dag, RouteMatch, Timeout};
use std::{cmp::Ordering, collections::BTreeMap};
use xds_api::pb::envoy::{
    config::{
        core::v3::{HeaderValue, HeaderValueOption},
        route::v3::{
            redirect_action, route, route_action, route_match, weighted_cluster, RedirectAction,
            Route, RouteAction, RouteConfiguration, RouteMatch as EnvoyRouteMatch, RetryPolicy,
            VirtualHost, WeightedCluster,
        },
    },
    r#type::matcher::v3::{regex_matcher, RegexMatcher},
};
use xds_api::pb::google::protobuf::{BoolValue, UInt32Value};

/// Name of the plaintext route configuration (and its listener).
pub const INGRESS_HTTP: &str = "ingress_http";

/// Name of the TLS route configuration (and its listener).
pub const INGRESS_HTTPS: &str = "ingress_https";

/// Cookie used for session-affinity hashing.
const SESSION_AFFINITY_COOKIE: &str = "X-Contour-Session-Affinity";

/// Builds the two route configurations served over RDS. Both exist on
/// every rebuild, possibly with no virtual hosts.
pub fn route_configurations(dag: &Dag) -> BTreeMap<String, RouteConfiguration> {
    let mut http_hosts = Vec::with_capacity(dag.virtual_hosts.len());
    for vh in &dag.virtual_hosts {
        let routes = ordered(vh.routes())
            .into_iter()
            .map(|r| {
                // The plaintext side is where an HTTPS upgrade bites:
                // the forwarding action is swapped for a redirect.
                let action = if r.https_upgrade {
                    upgrade_https()
                } else {
                    route_route(r)
                };
                envoy_route(route_match(&r.matcher), action)
            })
            .collect();
        http_hosts.push(virtual_host(&vh.name, routes));
    }

    let mut https_hosts = Vec::new();
    for svh in &dag.secure_virtual_hosts {
        if svh.host.routes().is_empty() {
            // TLS-passthrough hosts have no HTTP routes to serve.
            continue;
        }
        let routes = ordered(svh.host.routes())
            .into_iter()
            .map(|r| envoy_route(route_match(&r.matcher), route_route(r)))
            .collect();
        https_hosts.push(virtual_host(&svh.host.name, routes));
    }

    [
        (
            INGRESS_HTTP.to_string(),
            RouteConfiguration {
                name: INGRESS_HTTP.to_string(),
                virtual_hosts: http_hosts,
                ..RouteConfiguration::default()
            },
        ),
        (
            INGRESS_HTTPS.to_string(),
            RouteConfiguration {
                name: INGRESS_HTTPS.to_string(),
                virtual_hosts: https_hosts,
                ..RouteConfiguration::default()
            },
        ),
    ]
    .into_iter()
    .collect()
}

/// Orders routes for matching: regex before prefix, longer prefixes
/// first. The sort is stable, so equally-ranked routes keep their
/// insertion order.
fn ordered(routes: &[pylon_core::Route]) -> Vec<&pylon_core::Route> {
    let mut routes: Vec<&pylon_core::Route> = routes.iter().collect();
    routes.sort_by(|a, b| match (&a.matcher, &b.matcher) {
        (RouteMatch::Regex(_), RouteMatch::Prefix(_)) => Ordering::Less,
        (RouteMatch::Prefix(_), RouteMatch::Regex(_)) => Ordering::Greater,
        (RouteMatch::Prefix(a), RouteMatch::Prefix(b)) => b.len().cmp(&a.len()),
        (RouteMatch::Regex(_), RouteMatch::Regex(_)) => Ordering::Equal,
    });
    routes
}

pub fn virtual_host(fqdn: &str, routes: Vec<Route>) -> VirtualHost {
    let mut domains = vec![fqdn.to_string()];
    if fqdn != "*" {
        domains.push(format!("{fqdn}:*"));
    }
    VirtualHost {
        name: hashname(60, &[fqdn]),
        domains,
        routes,
        ..VirtualHost::default()
    }
}

fn envoy_route(matcher: EnvoyRouteMatch, action: route::Action) -> Route {
    Route {
        r#match: Some(matcher),
        action: Some(action),
        request_headers_to_add: route_headers(),
        ..Route::default()
    }
}

pub fn route_match(matcher: &RouteMatch) -> EnvoyRouteMatch {
    let path_specifier = match matcher {
        RouteMatch::Prefix(prefix) => route_match::PathSpecifier::Prefix(prefix.clone()),
        RouteMatch::Regex(regex) => route_match::PathSpecifier::SafeRegex(RegexMatcher {
            engine_type: Some(regex_matcher::EngineType::GoogleRe2(
                regex_matcher::GoogleRe2::default(),
            )),
            regex: regex.clone(),
            ..RegexMatcher::default()
        }),
    };
    EnvoyRouteMatch {
        path_specifier: Some(path_specifier),
        ..EnvoyRouteMatch::default()
    }
}

/// The forwarding action for a route.
pub fn route_route(r: &pylon_core::Route) -> route::Action {
    let mut action = RouteAction {
        retry_policy: retry_policy(r),
        timeout: timeout(r),
        prefix_rewrite: r.prefix_rewrite.clone().unwrap_or_default(),
        hash_policy: hash_policy(r),
        ..RouteAction::default()
    };

    if r.websocket {
        action
            .upgrade_configs
            .push(route_action::UpgradeConfig {
                upgrade_type: "websocket".to_string(),
                ..route_action::UpgradeConfig::default()
            });
    }

    action.cluster_specifier = Some(if r.clusters.len() == 1 {
        route_action::ClusterSpecifier::Cluster(r.clusters[0].name())
    } else {
        route_action::ClusterSpecifier::WeightedClusters(weighted_clusters(&r.clusters))
    });

    route::Action::Route(action)
}

/// The 301-to-HTTPS action applied to upgraded plaintext routes.
pub fn upgrade_https() -> route::Action {
    route::Action::Redirect(RedirectAction {
        scheme_rewrite_specifier: Some(redirect_action::SchemeRewriteSpecifier::HttpsRedirect(
            true,
        )),
        ..RedirectAction::default()
    })
}

/// A cookie hash policy, emitted iff at least one of the route's clusters
/// asked for the `Cookie` strategy. TTL zero makes it a session cookie.
fn hash_policy(r: &pylon_core::Route) -> Vec<route_action::HashPolicy> {
    let wants_cookie = r
        .clusters
        .iter()
        .any(|c| c.load_balancer_strategy == "Cookie");
    if !wants_cookie {
        return Vec::new();
    }
    vec![route_action::HashPolicy {
        policy_specifier: Some(route_action::hash_policy::PolicySpecifier::Cookie(
            route_action::hash_policy::Cookie {
                name: SESSION_AFFINITY_COOKIE.to_string(),
                ttl: Some(duration(std::time::Duration::ZERO)),
                path: "/".to_string(),
                ..route_action::hash_policy::Cookie::default()
            },
        )),
        ..route_action::HashPolicy::default()
    }]
}

/// Encodes the route timeout. An unset policy or `Default` leaves the
/// field absent (data-plane default); `Infinite` encodes as a literal
/// zero duration, which the data plane reads as "no timeout".
fn timeout(r: &pylon_core::Route) -> Option<xds_api::pb::google::protobuf::Duration> {
    match r.timeout_policy.as_ref()?.request {
        Timeout::Default => None,
        Timeout::Finite(d) => Some(duration(d)),
        Timeout::Infinite => Some(duration(std::time::Duration::ZERO)),
    }
}

fn retry_policy(r: &pylon_core::Route) -> Option<RetryPolicy> {
    let policy = r.retry_policy.as_ref()?;
    if policy.retry_on.is_empty() {
        return None;
    }
    Some(RetryPolicy {
        retry_on: policy.retry_on.clone(),
        num_retries: (policy.num_retries > 0)
            .then_some(UInt32Value { value: policy.num_retries }),
        per_try_timeout: policy.per_try_timeout.map(duration),
        ..RetryPolicy::default()
    })
}

/// Emits weighted clusters sorted by (name, weight) for deterministic
/// output. All-zero declared weights become weight 1 each, making the
/// distribution uniform.
#[allow(deprecated)]
fn weighted_clusters(clusters: &[std::sync::Arc<pylon_core::Cluster>]) -> WeightedCluster {
    let mut total = 0;
    let mut weights: Vec<weighted_cluster::ClusterWeight> = clusters
        .iter()
        .map(|c| {
            total += c.weight;
            weighted_cluster::ClusterWeight {
                name: c.name(),
                weight: Some(UInt32Value { value: c.weight }),
                ..weighted_cluster::ClusterWeight::default()
            }
        })
        .collect();
    if total == 0 {
        for weight in &mut weights {
            weight.weight = Some(UInt32Value { value: 1 });
        }
        total = clusters.len() as u32;
    }
    weights.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then(a.weight.as_ref().map(|w| w.value).cmp(&b.weight.as_ref().map(|w| w.value)))
    });

    WeightedCluster {
        clusters: weights,
        total_weight: Some(UInt32Value { value: total }),
        ..WeightedCluster::default()
    }
}

#[allow(deprecated)]
fn route_headers() -> Vec<HeaderValueOption> {
    vec![HeaderValueOption {
        header: Some(HeaderValue {
            key: "x-request-start".to_string(),
            value: "t=%START_TIME(%s.%3f)%".to_string(),
            ..HeaderValue::default()
        }),
        append: Some(BoolValue { value: true }),
        ..HeaderValueOption::default()
    }]
}
