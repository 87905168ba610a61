#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod conditions;
pub mod dag;
pub mod policy;

pub use self::conditions::{ObjectRef, StatusUpdate};
pub use self::dag::{
    AuthorizationServer, Cluster, Dag, DirectResponse, ExtensionCluster, HeaderMatch,
    HeaderMatchKind, PathMatch, PeerValidationContext, Protocol, QueryParamMatch,
    QueryParamMatchKind, Redirect, Route, Secret, SecureVirtualHost, Service, TcpProxy,
    TlsVersion, VirtualHost, WeightedService,
};
pub use self::policy::{
    parse_duration, GlobalRateLimitPolicy, HeadersPolicy, LoadBalancerStrategy,
    LocalRateLimitPolicy, RateLimitDescriptor, RateLimitDescriptorEntry, RateLimitPolicy,
    RetryPolicy, Timeout, TimeoutPolicy,
};

pub const CONTROLLER_NAME: &str = "trellis.dev/ingress-controller";

/// A `namespace/name` pair identifying a namespaced resource.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

// === impl NamespacedName ===

impl NamespacedName {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Resolves a secret-style reference that may omit the namespace,
    /// falling back to the namespace of the referencing object.
    pub fn from_reference(reference: &str, default_namespace: &str) -> Self {
        match reference.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::new(default_namespace, reference),
        }
    }
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for NamespacedName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => anyhow::bail!("expected a namespace/name reference, got {s:?}"),
        }
    }
}
