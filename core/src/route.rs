use crate::Cluster;
use std::{sync::Arc, time::Duration};

/// The match expression that selects a route within a virtual host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteMatch {
    /// Matches a path prefix.
    Prefix(String),
    /// Matches a regular expression over the whole path.
    Regex(String),
}

/// A single route: a match expression and what to do with matching requests.
#[derive(Clone, Debug)]
pub struct Route {
    pub matcher: RouteMatch,

    /// Upstream clusters, in declaration order. More than one cluster makes
    /// this a weighted route.
    pub clusters: Vec<Arc<Cluster>>,

    /// Replace the forwarding action with a 301 redirect to HTTPS.
    pub https_upgrade: bool,

    /// Upgrade matching connections to websockets.
    pub websocket: bool,

    /// Swap the matched prefix with this value while forwarding.
    pub prefix_rewrite: Option<String>,

    pub timeout_policy: Option<TimeoutPolicy>,
    pub retry_policy: Option<RetryPolicy>,

    /// Keep the forwarding action on the plaintext listener even when the
    /// virtual host is configured for TLS.
    pub permit_insecure: bool,
}

/// Request timeout behavior for a route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub request: Timeout,
}

/// A timeout that distinguishes "unset" from "disabled".
///
/// `Default` defers to the data plane's built-in timeout and encodes as an
/// absent field; `Infinite` disables the timeout entirely and encodes as a
/// literal zero duration. Keeping the three states distinct here means the
/// wire encoding is the only place that knows about that inversion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Timeout {
    Default,
    Finite(Duration),
    Infinite,
}

/// Retry behavior for a route. Meaningless unless `retry_on` is non-empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Conditions under which a request is retried, e.g. `5xx`.
    pub retry_on: String,

    pub num_retries: u32,
    pub per_try_timeout: Option<Duration>,
}

// === impl Route ===

impl Route {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::new(RouteMatch::Prefix(prefix.into()))
    }

    pub fn regex(regex: impl Into<String>) -> Self {
        Self::new(RouteMatch::Regex(regex.into()))
    }

    fn new(matcher: RouteMatch) -> Self {
        Self {
            matcher,
            clusters: Vec::new(),
            https_upgrade: false,
            websocket: false,
            prefix_rewrite: None,
            timeout_policy: None,
            retry_policy: None,
            permit_insecure: false,
        }
    }
}

// === impl Timeout ===

impl Timeout {
    /// Parses a user-supplied timeout value.
    ///
    /// An empty value defers to the data plane's default. `infinity`, or
    /// anything that does not parse as a duration, disables the timeout:
    /// the user asked for *some* override and the least surprising reading
    /// of a malformed one is "don't time out".
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "" => Timeout::Default,
            "infinity" => Timeout::Infinite,
            s => parse_duration(s).map_or(Timeout::Infinite, Timeout::Finite),
        }
    }
}

/// Parses a single-unit duration like `120s`, `5m`, or `750ms`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let offset = s.rfind(|c: char| c.is_ascii_digit())?;
    let (magnitude, unit) = s.split_at(offset + 1);
    let magnitude = magnitude.parse::<u64>().ok()?;

    let ms = match unit {
        "" if magnitude == 0 => 0,
        "ms" => 1,
        "s" => 1000,
        "m" => 1000 * 60,
        "h" => 1000 * 60 * 60,
        "d" => 1000 * 60 * 60 * 24,
        _ => return None,
    };

    magnitude.checked_mul(ms).map(Duration::from_millis)
}
