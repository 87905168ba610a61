//! Renders the intermediate route graph into Envoy v3 configuration
//! resources and publishes them as immutable, versioned snapshots.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod listener;
pub mod ratelimit;
pub mod route;
pub mod secret;
pub mod snapshot;
pub mod tls;
pub mod wire;

pub use self::snapshot::{run_build_loop, Snapshot, SnapshotPublisher, WatchPublisher};

/// Name of the listener serving cleartext HTTP.
pub const HTTP_LISTENER_NAME: &str = "ingress_http";

/// Name of the listener serving TLS-terminated HTTPS.
pub const HTTPS_LISTENER_NAME: &str = "ingress_https";

/// Name of the route configuration consumed by the HTTP listener.
pub const HTTP_ROUTE_CONFIG_NAME: &str = "ingress_http";

/// Prefix for the per-vhost route configurations consumed by the HTTPS
/// listener. The full name is `https/<fqdn>`.
pub const HTTPS_ROUTE_CONFIG_PREFIX: &str = "https/";

/// Name of the route configuration served behind the fallback
/// certificate filter chain.
pub const FALLBACK_ROUTE_CONFIG_NAME: &str = "ingress_fallbackcert";

/// Cluster through which the proxy reaches this management server for
/// RDS and SDS subscriptions.
pub const MANAGEMENT_CLUSTER_NAME: &str = "trellis";

/// Default access log target for both listeners.
pub const DEFAULT_ACCESS_LOG_PATH: &str = "/dev/stdout";

/// Listener parameters that come from deployment configuration rather
/// than from indexed Kubernetes resources.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenerConfig {
    pub http_address: String,
    pub http_port: u32,
    pub https_address: String,
    pub https_port: u32,
    pub access_log_path: String,
    pub use_proxy_protocol: bool,
    pub minimum_tls_version: String,
    pub cipher_suites: Vec<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            http_address: "0.0.0.0".to_string(),
            http_port: 8080,
            https_address: "0.0.0.0".to_string(),
            https_port: 8443,
            access_log_path: DEFAULT_ACCESS_LOG_PATH.to_string(),
            use_proxy_protocol: false,
            minimum_tls_version: "1.2".to_string(),
            cipher_suites: vec![],
        }
    }
}
