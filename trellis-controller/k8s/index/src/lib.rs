//! Watches routing resources and compiles them into a frozen traffic graph.
//!
//! The [`Index`] caches the relevant parts of every watched resource and
//! bumps a revision counter whenever one of them materially changes. The
//! [`builder`] turns a point-in-time [`ResourceSnapshot`] of those caches
//! into a [`Dag`] plus a status report for every processed object, without
//! holding the index lock.
//!
//! [`Dag`]: trellis_controller_core::Dag

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod builder;
mod index;
pub mod metrics;
pub mod policy;
pub mod secrets;

#[cfg(test)]
mod tests;

pub use self::index::{Index, ResourceSnapshot, SharedIndex};

/// Cluster-wide configuration that shapes how resources compile.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The ingress class served by this controller. `Ingress` resources that
    /// name another class are ignored entirely.
    pub ingress_class_name: String,

    /// The cluster's DNS domain, used to derive service FQDNs for dynamic
    /// request header values.
    pub cluster_domain: String,

    /// The certificate served to TLS clients whose SNI matches no secure
    /// virtual host, for virtual hosts that opted in.
    pub fallback_certificate: Option<trellis_controller_core::NamespacedName>,
}

// === impl ClusterInfo ===

impl ClusterInfo {
    pub(crate) fn service_fqdn(&self, namespace: &str, name: &str, port: u16) -> String {
        format!("{name}.{namespace}.svc.{}:{port}", self.cluster_domain)
    }
}

impl Default for ClusterInfo {
    fn default() -> Self {
        Self {
            ingress_class_name: "trellis".to_string(),
            cluster_domain: "cluster.local".to_string(),
            fallback_certificate: None,
        }
    }
}
