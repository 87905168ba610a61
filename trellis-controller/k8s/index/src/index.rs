//! Caches watched resources and signals rebuilds.
//!
//! Each apply keeps only the parts of the resource the build reads, compares
//! them against the cached entry, and bumps the revision counter only when
//! they differ. Watch resyncs and status-only writes therefore do not
//! trigger rebuilds.

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{
    collections::{hash_map::Entry, BTreeMap},
    sync::Arc,
};
use tokio::sync::watch;
use trellis_controller_core::NamespacedName;
use trellis_controller_k8s_api::{self as k8s, ResourceExt};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Caches the watched resources behind a revision counter.
#[derive(Debug)]
pub struct Index {
    secrets: HashMap<NamespacedName, SecretEntry>,
    services: HashMap<NamespacedName, Vec<ServicePortEntry>>,
    extension_services: HashMap<NamespacedName, k8s::v1alpha1::ExtensionServiceSpec>,
    ingresses: HashMap<NamespacedName, IngressEntry>,
    proxies: HashMap<NamespacedName, ProxyEntry>,
    changes: watch::Sender<u64>,
}

/// A point-in-time clone of the index caches, built on without holding the
/// index lock.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceSnapshot {
    pub(crate) secrets: HashMap<NamespacedName, SecretEntry>,
    pub(crate) services: HashMap<NamespacedName, Vec<ServicePortEntry>>,
    pub(crate) extension_services: HashMap<NamespacedName, k8s::v1alpha1::ExtensionServiceSpec>,
    pub(crate) ingresses: HashMap<NamespacedName, IngressEntry>,
    pub(crate) proxies: HashMap<NamespacedName, ProxyEntry>,
}

/// The parts of a `Secret` the build reads. Only the TLS-relevant data keys
/// are retained.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SecretEntry {
    pub(crate) secret_type: Option<String>,
    pub(crate) data: BTreeMap<String, Vec<u8>>,
}

/// One port exposed by a `Service`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ServicePortEntry {
    pub(crate) name: Option<String>,
    pub(crate) port: i32,
}

/// The parts of an `Ingress` the build reads.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct IngressEntry {
    pub(crate) created: DateTime<Utc>,
    pub(crate) spec: k8s::IngressSpec,
}

/// The parts of an `HTTPProxy` the build reads.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ProxyEntry {
    pub(crate) created: DateTime<Utc>,
    pub(crate) spec: k8s::v1::HTTPProxySpec,
}

// === impl Index ===

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            secrets: HashMap::new(),
            services: HashMap::new(),
            extension_services: HashMap::new(),
            ingresses: HashMap::new(),
            proxies: HashMap::new(),
            changes,
        }
    }

    /// Subscribes to revision bumps. The receiver observes the latest
    /// revision only, so bursts of changes coalesce into one rebuild.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// The current revision.
    pub fn revision(&self) -> u64 {
        *self.changes.borrow()
    }

    /// Clones a point-in-time view of the cached resources.
    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            secrets: self.secrets.clone(),
            services: self.services.clone(),
            extension_services: self.extension_services.clone(),
            ingresses: self.ingresses.clone(),
            proxies: self.proxies.clone(),
        }
    }

    fn touch(&mut self) {
        self.changes.send_modify(|revision| *revision += 1);
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Secret> for Index {
    fn apply(&mut self, resource: k8s::Secret) {
        let namespace = resource.namespace().expect("secret must have a namespace");
        let name = resource.name_unchecked();
        let entry = SecretEntry {
            secret_type: resource.type_,
            data: resource
                .data
                .unwrap_or_default()
                .into_iter()
                .filter(|(key, _)| {
                    key == k8s::SECRET_KEY_CERT
                        || key == k8s::SECRET_KEY_PRIVATE_KEY
                        || key == k8s::SECRET_KEY_CA
                })
                .map(|(key, value)| (key, value.0))
                .collect(),
        };
        if apply_entry(&mut self.secrets, NamespacedName::new(&namespace, &name), entry) {
            tracing::debug!(%namespace, %name, "secret updated");
            self.touch();
        } else {
            tracing::debug!(%namespace, %name, "no changes");
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if remove_entry(&mut self.secrets, &namespace, &name) {
            tracing::debug!(%namespace, %name, "secret deleted");
            self.touch();
        }
    }

    // Since apply keeps only one entry per secret, the default reset
    // handling (apply each, delete the removed) needs no specialization.
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, resource: k8s::Service) {
        let namespace = resource.namespace().expect("service must have a namespace");
        let name = resource.name_unchecked();
        let ports = resource
            .spec
            .and_then(|spec| spec.ports)
            .unwrap_or_default()
            .into_iter()
            .map(|port| ServicePortEntry {
                name: port.name,
                port: port.port,
            })
            .collect();
        if apply_entry(&mut self.services, NamespacedName::new(&namespace, &name), ports) {
            tracing::debug!(%namespace, %name, "service updated");
            self.touch();
        } else {
            tracing::debug!(%namespace, %name, "no changes");
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if remove_entry(&mut self.services, &namespace, &name) {
            tracing::debug!(%namespace, %name, "service deleted");
            self.touch();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::v1alpha1::ExtensionService> for Index {
    fn apply(&mut self, resource: k8s::v1alpha1::ExtensionService) {
        let namespace = resource
            .namespace()
            .expect("extensionservice must have a namespace");
        let name = resource.name_unchecked();
        if apply_entry(
            &mut self.extension_services,
            NamespacedName::new(&namespace, &name),
            resource.spec,
        ) {
            tracing::debug!(%namespace, %name, "extensionservice updated");
            self.touch();
        } else {
            tracing::debug!(%namespace, %name, "no changes");
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if remove_entry(&mut self.extension_services, &namespace, &name) {
            tracing::debug!(%namespace, %name, "extensionservice deleted");
            self.touch();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Ingress> for Index {
    fn apply(&mut self, resource: k8s::Ingress) {
        let namespace = resource.namespace().expect("ingress must have a namespace");
        let name = resource.name_unchecked();
        let entry = IngressEntry {
            created: created(&resource.metadata),
            spec: resource.spec.unwrap_or_default(),
        };
        if apply_entry(&mut self.ingresses, NamespacedName::new(&namespace, &name), entry) {
            tracing::debug!(%namespace, %name, "ingress updated");
            self.touch();
        } else {
            tracing::debug!(%namespace, %name, "no changes");
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if remove_entry(&mut self.ingresses, &namespace, &name) {
            tracing::debug!(%namespace, %name, "ingress deleted");
            self.touch();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::v1::HTTPProxy> for Index {
    fn apply(&mut self, resource: k8s::v1::HTTPProxy) {
        let namespace = resource.namespace().expect("httpproxy must have a namespace");
        let name = resource.name_unchecked();
        let entry = ProxyEntry {
            created: created(&resource.metadata),
            spec: resource.spec,
        };
        if apply_entry(&mut self.proxies, NamespacedName::new(&namespace, &name), entry) {
            tracing::debug!(%namespace, %name, "httpproxy updated");
            self.touch();
        } else {
            tracing::debug!(%namespace, %name, "no changes");
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if remove_entry(&mut self.proxies, &namespace, &name) {
            tracing::debug!(%namespace, %name, "httpproxy deleted");
            self.touch();
        }
    }
}

impl crate::metrics::SizedIndex<k8s::Secret> for Index {
    fn size(&self, namespace: &str) -> usize {
        size_of(&self.secrets, namespace)
    }
}

impl crate::metrics::SizedIndex<k8s::Service> for Index {
    fn size(&self, namespace: &str) -> usize {
        size_of(&self.services, namespace)
    }
}

impl crate::metrics::SizedIndex<k8s::v1alpha1::ExtensionService> for Index {
    fn size(&self, namespace: &str) -> usize {
        size_of(&self.extension_services, namespace)
    }
}

impl crate::metrics::SizedIndex<k8s::Ingress> for Index {
    fn size(&self, namespace: &str) -> usize {
        size_of(&self.ingresses, namespace)
    }
}

impl crate::metrics::SizedIndex<k8s::v1::HTTPProxy> for Index {
    fn size(&self, namespace: &str) -> usize {
        size_of(&self.proxies, namespace)
    }
}

// === helpers ===

fn size_of<T>(cache: &HashMap<NamespacedName, T>, namespace: &str) -> usize {
    cache.keys().filter(|key| key.namespace == namespace).count()
}

fn apply_entry<T: PartialEq>(
    cache: &mut HashMap<NamespacedName, T>,
    key: NamespacedName,
    entry: T,
) -> bool {
    match cache.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(entry);
            true
        }
        Entry::Occupied(mut slot) => {
            if *slot.get() == entry {
                false
            } else {
                slot.insert(entry);
                true
            }
        }
    }
}

fn remove_entry<T>(cache: &mut HashMap<NamespacedName, T>, namespace: &str, name: &str) -> bool {
    cache.remove(&NamespacedName::new(namespace, name)).is_some()
}

fn created(meta: &k8s::ObjectMeta) -> DateTime<Utc> {
    meta.creation_timestamp
        .as_ref()
        .map(|k8s::Time(created)| *created)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
