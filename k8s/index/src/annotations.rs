//! Annotation parsing shared by the store and the builder.
//!
//! Annotation handling is deliberately forgiving: a malformed value reads
//! as "not configured" rather than invalidating the carrying object.

use ahash::AHashMap as HashMap;
use pylon_core::{RetryPolicy, Timeout, TimeoutPolicy, TlsVersion};
use pylon_k8s_api::Ingress;
use std::collections::BTreeMap;

const ANNOTATION_REQUEST_TIMEOUT: &str = "contour.heptio.com/request-timeout";
const ANNOTATION_WEBSOCKET_ROUTES: &str = "contour.heptio.com/websocket-routes";
const ANNOTATION_UPSTREAM_PROTOCOL: &str = "contour.heptio.com/upstream-protocol";
const ANNOTATION_RETRY_ON: &str = "contour.heptio.com/retry-on";
const ANNOTATION_NUM_RETRIES: &str = "contour.heptio.com/num-retries";
const ANNOTATION_PER_TRY_TIMEOUT: &str = "contour.heptio.com/per-try-timeout";
const ANNOTATION_TLS_MIN_VERSION: &str = "contour.heptio.com/tls-minimum-protocol-version";

pub const ANNOTATION_MAX_CONNECTIONS: &str = "contour.heptio.com/max-connections";
pub const ANNOTATION_MAX_PENDING_REQUESTS: &str = "contour.heptio.com/max-pending-requests";
pub const ANNOTATION_MAX_REQUESTS: &str = "contour.heptio.com/max-requests";
pub const ANNOTATION_MAX_RETRIES: &str = "contour.heptio.com/max-retries";

type Annotations = BTreeMap<String, String>;

/// Returns the first configured ingress class, checking keys in order of
/// specificity.
pub fn ingress_class(annotations: &Annotations) -> Option<&str> {
    [
        "projectcontour.io/ingress.class",
        "contour.heptio.com/ingress.class",
        "kubernetes.io/ingress.class",
    ]
    .iter()
    .find_map(|key| annotations.get(*key).map(String::as_str))
}

/// Parses the supplied string as a `u32`, reading absent, malformed, or
/// out-of-range values as zero.
pub fn parse_u32(s: Option<&String>) -> u32 {
    s.and_then(|s| s.parse().ok()).unwrap_or_default()
}

/// Maps service port names/numbers to their declared layer-7 protocol,
/// from `contour.heptio.com/upstream-protocol.{h2,h2c,tls}` annotations.
pub fn upstream_protocols(annotations: &Annotations) -> HashMap<String, String> {
    let mut up = HashMap::new();
    for protocol in ["h2", "h2c", "tls"] {
        let key = format!("{ANNOTATION_UPSTREAM_PROTOCOL}.{protocol}");
        let Some(ports) = annotations.get(&key) else {
            continue;
        };
        for port in ports.split(',') {
            let port = port.trim();
            if !port.is_empty() {
                up.insert(port.to_string(), protocol.to_string());
            }
        }
    }
    up
}

/// Paths listed in the websocket-routes annotation.
pub fn websocket_routes(annotations: &Annotations) -> Vec<String> {
    annotations
        .get(ANNOTATION_WEBSOCKET_ROUTES)
        .map(|routes| {
            routes
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// True unless `kubernetes.io/ingress.allow-http` is explicitly `false`.
pub fn http_allowed(ingress: &Ingress) -> bool {
    annotation(ingress, "kubernetes.io/ingress.allow-http") != Some("false")
}

/// True if `ingress.kubernetes.io/force-ssl-redirect` is `true`.
pub fn tls_required(ingress: &Ingress) -> bool {
    annotation(ingress, "ingress.kubernetes.io/force-ssl-redirect") == Some("true")
}

pub fn request_timeout(annotations: &Annotations) -> Option<TimeoutPolicy> {
    annotations
        .get(ANNOTATION_REQUEST_TIMEOUT)
        .map(|request| TimeoutPolicy {
            request: Timeout::parse(request),
        })
}

pub fn retry_policy(annotations: &Annotations) -> Option<RetryPolicy> {
    let retry_on = annotations.get(ANNOTATION_RETRY_ON)?;
    if retry_on.is_empty() {
        return None;
    }
    Some(RetryPolicy {
        retry_on: retry_on.clone(),
        num_retries: parse_u32(annotations.get(ANNOTATION_NUM_RETRIES)).max(1),
        per_try_timeout: annotations
            .get(ANNOTATION_PER_TRY_TIMEOUT)
            .and_then(|s| pylon_core::parse_duration(s)),
    })
}

pub fn min_tls_version(annotations: &Annotations) -> TlsVersion {
    annotations
        .get(ANNOTATION_TLS_MIN_VERSION)
        .map(|v| TlsVersion::parse(v))
        .unwrap_or_default()
}

fn annotation<'a>(ingress: &'a Ingress, key: &str) -> Option<&'a str> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}
