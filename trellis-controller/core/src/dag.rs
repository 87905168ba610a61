use crate::policy::{
    HeadersPolicy, LoadBalancerStrategy, RateLimitPolicy, RetryPolicy, Timeout, TimeoutPolicy,
};
use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// The frozen configuration graph produced by one build pass.
///
/// A `Dag` is immutable once built: renderers and the transport layer only
/// read it, and the next reconciliation replaces it wholesale.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dag {
    /// Insecure virtual hosts, sorted by hostname.
    pub virtual_hosts: Vec<VirtualHost>,
    /// TLS virtual hosts, sorted by hostname.
    pub secure_virtual_hosts: Vec<SecureVirtualHost>,
    /// Backend clusters referenced by any route, deduplicated by name.
    pub clusters: Vec<Cluster>,
    /// Clusters compiled from ExtensionService objects.
    pub extension_clusters: Vec<ExtensionCluster>,
    /// TLS certificates referenced by any secure virtual host.
    pub secrets: Vec<Secret>,
    /// The certificate served to TLS clients whose SNI matches no virtual
    /// host, when any virtual host opted into fallback.
    pub fallback_certificate: Option<Secret>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VirtualHost {
    pub name: String,
    pub routes: Vec<Route>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
}

// === impl VirtualHost ===

impl VirtualHost {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Orders routes most-specific-match-first. The proxy matches top-down,
    /// so renderers must preserve this ordering.
    pub fn sort_routes(&mut self) {
        self.routes.sort_by(compare_route_specificity);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SecureVirtualHost {
    pub virtual_host: VirtualHost,
    /// The server certificate; `None` only for TLS pass-through TCP proxies.
    pub secret: Option<Secret>,
    pub min_tls_version: TlsVersion,
    pub cipher_suites: Vec<String>,
    pub peer_validation: Option<PeerValidationContext>,
    pub fallback_certificate: bool,
    pub authorization: Option<AuthorizationServer>,
    pub tcp_proxy: Option<TcpProxy>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TlsVersion {
    #[default]
    V1_2,
    V1_3,
}

// === impl TlsVersion ===

impl TlsVersion {
    pub fn parse(s: Option<&str>) -> Result<Self> {
        match s.unwrap_or_default() {
            "" | "1.2" => Ok(Self::V1_2),
            "1.3" => Ok(Self::V1_3),
            s => bail!("invalid minimum TLS version {s:?}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub path: PathMatch,
    pub header_matches: Vec<HeaderMatch>,
    pub query_matches: Vec<QueryParamMatch>,
    pub clusters: Vec<Cluster>,
    pub retry_policy: Option<RetryPolicy>,
    pub timeout_policy: TimeoutPolicy,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
    pub prefix_rewrite: Option<String>,
    pub websocket: bool,
    pub redirect: Option<Redirect>,
    pub direct_response: Option<DirectResponse>,
}

// === impl Route ===

impl Route {
    pub fn new(path: PathMatch) -> Self {
        Self {
            path,
            header_matches: Vec::new(),
            query_matches: Vec::new(),
            clusters: Vec::new(),
            retry_policy: None,
            timeout_policy: TimeoutPolicy::default(),
            request_headers_policy: None,
            response_headers_policy: None,
            rate_limit_policy: None,
            prefix_rewrite: None,
            websocket: false,
            redirect: None,
            direct_response: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathMatch {
    Prefix(String),
    Exact(String),
    Regex(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderMatch {
    pub name: String,
    pub kind: HeaderMatchKind,
    pub invert: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderMatchKind {
    Present,
    Contains(String),
    Exact(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryParamMatch {
    pub name: String,
    pub kind: QueryParamMatchKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryParamMatchKind {
    Exact(String),
    Present,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redirect {
    pub hostname: Option<String>,
    pub scheme: Option<String>,
    pub port: Option<u32>,
    pub status_code: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectResponse {
    pub status_code: u32,
    pub body: Option<String>,
}

/// A resolved backend reference.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Service {
    pub namespace: String,
    pub name: String,
    pub port: u16,
}

/// A backend with a user-assigned weight. `weight: None` means the user
/// assigned no weight at all, which is distinct from an explicit zero: an
/// explicit zero excludes the backend from traffic when any sibling carries
/// an explicit weight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedService {
    pub service: Service,
    pub weight: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    pub upstream: WeightedService,
    pub protocol: Option<Protocol>,
    pub load_balancer_strategy: LoadBalancerStrategy,
    pub upstream_validation: Option<PeerValidationContext>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
}

// === impl Cluster ===

impl Cluster {
    pub fn new(upstream: WeightedService) -> Self {
        Self {
            upstream,
            protocol: None,
            load_balancer_strategy: LoadBalancerStrategy::default(),
            upstream_validation: None,
            request_headers_policy: None,
            response_headers_policy: None,
        }
    }

    /// Derives the wire-config cluster name. The name is a pure function of
    /// the cluster definition so that repeated builds of the same input
    /// produce byte-identical output.
    pub fn name(&self) -> String {
        let service = &self.upstream.service;
        let port = service.port.to_string();
        let mut parts = vec![
            service.namespace.as_str(),
            service.name.as_str(),
            port.as_str(),
        ];
        if let Some(protocol) = self.protocol {
            parts.push(protocol.as_str());
        }
        let fingerprint = self.fingerprint();
        if let Some(fp) = &fingerprint {
            parts.push(fp);
        }
        hashname(60, &parts)
    }

    /// A short digest of the non-default cluster attributes that do not
    /// appear literally in the name, so that two clusters for the same
    /// service differing only in configuration get distinct names.
    fn fingerprint(&self) -> Option<String> {
        let mut canonical = String::new();
        if self.load_balancer_strategy != LoadBalancerStrategy::Default {
            canonical.push_str(&format!("lb={:?};", self.load_balancer_strategy));
        }
        if let Some(v) = &self.upstream_validation {
            canonical.push_str(&format!(
                "ca={};subject={};",
                hex_digest(&v.ca),
                v.subject_name.as_deref().unwrap_or_default()
            ));
        }
        for (label, policy) in [
            ("req", &self.request_headers_policy),
            ("rsp", &self.response_headers_policy),
        ] {
            if let Some(p) = policy {
                for (k, v) in &p.set {
                    canonical.push_str(&format!("{label}+{k}={v};"));
                }
                for k in &p.remove {
                    canonical.push_str(&format!("{label}-{k};"));
                }
            }
        }
        if canonical.is_empty() {
            return None;
        }
        Some(hex_digest(canonical.as_bytes())[..8].to_string())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    H2,
    H2C,
    Tls,
}

// === impl Protocol ===

impl Protocol {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "h2" => Ok(Self::H2),
            "h2c" => Ok(Self::H2C),
            "tls" => Ok(Self::Tls),
            s => bail!("unsupported protocol {s:?}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H2 => "h2",
            Self::H2C => "h2c",
            Self::Tls => "tls",
        }
    }
}

/// A validated TLS server certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

// === impl Secret ===

impl Secret {
    /// Derives the wire-config secret name.
    pub fn name(&self) -> String {
        hashname(60, &[&self.namespace, &self.name])
    }
}

/// Certificate verification settings for a TLS peer, client or upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerValidationContext {
    pub ca: Vec<u8>,
    pub subject_name: Option<String>,
    pub skip_client_cert_validation: bool,
}

/// A cluster compiled from an ExtensionService, used as the target of
/// external authorization.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtensionCluster {
    pub name: String,
    pub services: Vec<WeightedService>,
    pub protocol: Protocol,
    pub upstream_validation: Option<PeerValidationContext>,
    pub load_balancer_strategy: LoadBalancerStrategy,
    pub response_timeout: Timeout,
}

// === impl ExtensionCluster ===

impl ExtensionCluster {
    pub fn name_for(namespace: &str, name: &str) -> String {
        hashname(60, &["extension", namespace, name])
    }
}

/// External authorization attached to a secure virtual host.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthorizationServer {
    pub cluster_name: String,
    pub fail_open: bool,
    pub response_timeout: Timeout,
}

/// Raw TCP forwarding, used for TLS termination or pass-through without
/// HTTP processing.
#[derive(Clone, Debug, PartialEq)]
pub struct TcpProxy {
    pub clusters: Vec<Cluster>,
}

/// Joins name parts with `/`, truncating over-long results with a short
/// content digest so the outcome stays deterministic and unique.
pub fn hashname(max: usize, parts: &[&str]) -> String {
    let name = parts.join("/");
    if name.len() <= max {
        return name;
    }
    let digest = hex_digest(name.as_bytes());
    format!("{}/{}", &name[..max - 9], &digest[..8])
}

fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A total order over route matches, most specific first: exact paths before
/// regex paths before prefixes, longer paths before shorter, then more
/// header/query conditions before fewer. The order depends only on the match
/// itself, never on the source object.
pub fn compare_route_specificity(a: &Route, b: &Route) -> Ordering {
    fn kind_rank(p: &PathMatch) -> u8 {
        match p {
            PathMatch::Exact(_) => 0,
            PathMatch::Regex(_) => 1,
            PathMatch::Prefix(_) => 2,
        }
    }
    fn path(p: &PathMatch) -> &str {
        match p {
            PathMatch::Exact(s) | PathMatch::Regex(s) | PathMatch::Prefix(s) => s,
        }
    }

    kind_rank(&a.path)
        .cmp(&kind_rank(&b.path))
        .then_with(|| path(&b.path).len().cmp(&path(&a.path).len()))
        .then_with(|| path(&a.path).cmp(path(&b.path)))
        .then_with(|| b.header_matches.len().cmp(&a.header_matches.len()))
        .then_with(|| b.query_matches.len().cmp(&a.query_matches.len()))
        .then_with(|| {
            format!("{:?}{:?}", a.header_matches, a.query_matches)
                .cmp(&format!("{:?}{:?}", b.header_matches, b.query_matches))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NamespacedName;
    use pretty_assertions::assert_eq;

    fn service(namespace: &str, name: &str, port: u16) -> WeightedService {
        WeightedService {
            service: Service {
                namespace: namespace.to_string(),
                name: name.to_string(),
                port,
            },
            weight: None,
        }
    }

    #[test]
    fn cluster_names_are_stable() {
        let cluster = Cluster::new(service("default", "kuard", 8080));
        assert_eq!(cluster.name(), "default/kuard/8080");
        assert_eq!(cluster.name(), cluster.name());

        let h2c = Cluster {
            protocol: Some(Protocol::H2C),
            ..Cluster::new(service("default", "kuard", 8080))
        };
        assert_eq!(h2c.name(), "default/kuard/8080/h2c");
    }

    #[test]
    fn cluster_names_distinguish_configuration() {
        let plain = Cluster::new(service("default", "kuard", 8080));
        let random = Cluster {
            load_balancer_strategy: LoadBalancerStrategy::Random,
            ..plain.clone()
        };
        assert_ne!(plain.name(), random.name());
        // The digest suffix stays stable across builds.
        assert_eq!(random.name(), random.name());
    }

    #[test]
    fn long_names_are_truncated_with_a_digest() {
        let long = "a".repeat(120);
        let cluster = Cluster::new(service(&long, "kuard", 8080));
        let name = cluster.name();
        assert_eq!(name.len(), 60);
        assert_eq!(cluster.name(), name);

        let other = Cluster::new(service(&long, "kuard", 8081));
        assert_ne!(other.name(), name);
    }

    #[test]
    fn secret_names_derive_from_the_reference() {
        let secret = Secret {
            namespace: "default".to_string(),
            name: "tls-cert".to_string(),
            cert: b"cert".to_vec(),
            key: b"key".to_vec(),
        };
        assert_eq!(secret.name(), "default/tls-cert");
    }

    #[test]
    fn routes_order_most_specific_first() {
        let mut vhost = VirtualHost::new("example.com");
        vhost.routes = vec![
            Route::new(PathMatch::Prefix("/".to_string())),
            Route::new(PathMatch::Prefix("/api/v1".to_string())),
            Route::new(PathMatch::Exact("/api".to_string())),
            Route::new(PathMatch::Prefix("/api".to_string())),
            Route::new(PathMatch::Regex("/api/.*".to_string())),
        ];
        vhost.sort_routes();

        let order: Vec<_> = vhost.routes.iter().map(|r| r.path.clone()).collect();
        assert_eq!(
            order,
            vec![
                PathMatch::Exact("/api".to_string()),
                PathMatch::Regex("/api/.*".to_string()),
                PathMatch::Prefix("/api/v1".to_string()),
                PathMatch::Prefix("/api".to_string()),
                PathMatch::Prefix("/".to_string()),
            ]
        );
    }

    #[test]
    fn header_conditions_break_path_ties() {
        let mut with_header = Route::new(PathMatch::Prefix("/api".to_string()));
        with_header.header_matches.push(HeaderMatch {
            name: "X-Header".to_string(),
            kind: HeaderMatchKind::Present,
            invert: false,
        });
        let bare = Route::new(PathMatch::Prefix("/api".to_string()));

        let mut vhost = VirtualHost::new("example.com");
        vhost.routes = vec![bare.clone(), with_header.clone()];
        vhost.sort_routes();
        assert_eq!(vhost.routes, vec![with_header.clone(), bare.clone()]);

        // Insertion order does not affect the result.
        let mut swapped = VirtualHost::new("example.com");
        swapped.routes = vec![with_header.clone(), bare.clone()];
        swapped.sort_routes();
        assert_eq!(swapped.routes, vec![with_header, bare]);
    }

    #[test]
    fn namespaced_name_references() {
        assert_eq!(
            NamespacedName::from_reference("other/cert", "default"),
            NamespacedName::new("other", "cert")
        );
        assert_eq!(
            NamespacedName::from_reference("cert", "default"),
            NamespacedName::new("default", "cert")
        );
        assert!("no-slash".parse::<NamespacedName>().is_err());
        assert!("a/b".parse::<NamespacedName>().is_ok());
    }
}
