use std::fmt;

/// Namespace and name of a cluster object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Meta {
    pub namespace: String,
    pub name: String,
}

/// The API kind of a root candidate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RootKind {
    IngressRoute,
    HttpProxy,
}

/// Identifies one root candidate across the two routing CRDs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RootRef {
    pub kind: RootKind,
    pub meta: Meta,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Valid,
    Invalid,
    Orphaned,
}

/// The condition computed for a root candidate during a build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub description: String,
}

// === impl Meta ===

impl Meta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Resolves a `name` or `namespace/name` reference, defaulting the
    /// namespace of the referring object.
    pub fn from_ref(default_namespace: &str, s: &str) -> Self {
        match s.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::new(default_namespace, s),
        }
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl RootKind ===

impl fmt::Display for RootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootKind::IngressRoute => "IngressRoute".fmt(f),
            RootKind::HttpProxy => "HTTPProxy".fmt(f),
        }
    }
}

// === impl RootRef ===

impl RootRef {
    pub fn new(kind: RootKind, meta: Meta) -> Self {
        Self { kind, meta }
    }
}

// === impl StatusCode ===

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Valid => "valid",
            StatusCode::Invalid => "invalid",
            StatusCode::Orphaned => "orphaned",
        }
    }
}

// === impl Status ===

impl Status {
    pub fn valid(description: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Valid,
            description: description.into(),
        }
    }

    pub fn invalid(description: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Invalid,
            description: description.into(),
        }
    }

    pub fn orphaned(description: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Orphaned,
            description: description.into(),
        }
    }
}
