//! Prometheus instrumentation for the resource caches and the build loop.

use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;
use trellis_controller_core::{conditions::StatusUpdate, Dag};
use trellis_controller_k8s_api::ResourceExt;

/// Wraps an index so applies, deletes and resets are counted per resource
/// kind, with a per-namespace size gauge.
pub struct IndexMetrics<T> {
    inner: T,

    index_size: Family<ResourceLabels, Gauge>,
    index_applies: Family<ResourceLabels, Counter>,
    index_deletes: Family<ResourceLabels, Counter>,
    index_resets: Family<KindLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResourceLabels {
    namespace: String,
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

/// Reports how many resources of a kind a namespace currently holds.
pub trait SizedIndex<R> {
    fn size(&self, namespace: &str) -> usize;
}

/// Observes each rebuild of the traffic graph.
#[derive(Clone, Debug)]
pub struct BuildMetrics {
    builds: Counter,
    virtual_hosts: Gauge,
    secure_virtual_hosts: Gauge,
    clusters: Gauge,
    extension_clusters: Gauge,
    objects: Family<ValidityLabels, Gauge>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ValidityLabels {
    validity: String,
}

// === impl IndexMetrics ===

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Registry) -> Self {
        let index_size = Family::default();
        prom.register(
            "index_size",
            "Gauge of the number of resources in the index",
            index_size.clone(),
        );

        let index_applies = Family::default();
        prom.register(
            "index_applies",
            "Count of applies to the index",
            index_applies.clone(),
        );

        let index_deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of deletes to the index",
            index_deletes.clone(),
        );

        let index_resets = Family::default();
        prom.register(
            "index_resets",
            "Count of resets to the index",
            index_resets.clone(),
        );

        Self {
            inner,
            index_size,
            index_applies,
            index_deletes,
            index_resets,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }
}

impl<T, R> SizedIndex<R> for Arc<RwLock<T>>
where
    T: SizedIndex<R>,
{
    fn size(&self, namespace: &str) -> usize {
        self.read().size(namespace)
    }
}

impl<R, T> kubert::index::IndexNamespacedResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R>,
    T: kubert::index::IndexNamespacedResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        let kind = R::kind(&());
        let namespace = resource.namespace().unwrap_or_default();
        self.index_applies
            .get_or_create(&ResourceLabels {
                namespace: namespace.clone(),
                kind: kind.to_string(),
            })
            .inc();
        self.inner.write().apply(resource);
        let size = self.inner.size(&namespace);
        self.index_size
            .get_or_create(&ResourceLabels {
                namespace,
                kind: kind.to_string(),
            })
            .set(size as i64);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let kind = R::kind(&());
        self.index_deletes
            .get_or_create(&ResourceLabels {
                namespace: namespace.clone(),
                kind: kind.to_string(),
            })
            .inc();
        self.inner.write().delete(namespace.clone(), name);
        let size = self.inner.size(&namespace);
        self.index_size
            .get_or_create(&ResourceLabels {
                namespace,
                kind: kind.to_string(),
            })
            .set(size as i64);
    }

    fn reset(&mut self, resources: Vec<R>, removed: kubert::index::NamespacedRemoved) {
        let kind = R::kind(&());
        let namespaces = resources
            .iter()
            .flat_map(|resource| resource.namespace())
            .chain(removed.keys().cloned())
            .collect::<Vec<_>>();
        self.index_resets
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
        self.inner.write().reset(resources, removed);
        for namespace in namespaces {
            let size = self.inner.size(&namespace);
            self.index_size
                .get_or_create(&ResourceLabels {
                    namespace,
                    kind: kind.to_string(),
                })
                .set(size as i64);
        }
    }
}

// === impl BuildMetrics ===

impl BuildMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let builds = Counter::default();
        prom.register("builds", "Count of traffic graph rebuilds", builds.clone());

        let virtual_hosts = Gauge::default();
        prom.register(
            "virtual_hosts",
            "Gauge of virtual hosts in the current graph",
            virtual_hosts.clone(),
        );

        let secure_virtual_hosts = Gauge::default();
        prom.register(
            "secure_virtual_hosts",
            "Gauge of TLS virtual hosts in the current graph",
            secure_virtual_hosts.clone(),
        );

        let clusters = Gauge::default();
        prom.register(
            "clusters",
            "Gauge of service clusters in the current graph",
            clusters.clone(),
        );

        let extension_clusters = Gauge::default();
        prom.register(
            "extension_clusters",
            "Gauge of extension clusters in the current graph",
            extension_clusters.clone(),
        );

        let objects = Family::default();
        prom.register(
            "objects",
            "Gauge of processed objects by validity",
            objects.clone(),
        );

        Self {
            builds,
            virtual_hosts,
            secure_virtual_hosts,
            clusters,
            extension_clusters,
            objects,
        }
    }

    pub fn record(&self, dag: &Dag, statuses: &[StatusUpdate]) {
        self.builds.inc();
        self.virtual_hosts.set(dag.virtual_hosts.len() as i64);
        self.secure_virtual_hosts
            .set(dag.secure_virtual_hosts.len() as i64);
        self.clusters.set(dag.clusters.len() as i64);
        self.extension_clusters
            .set(dag.extension_clusters.len() as i64);

        let valid = statuses.iter().filter(|status| status.valid).count();
        self.objects
            .get_or_create(&ValidityLabels {
                validity: "valid".to_string(),
            })
            .set(valid as i64);
        self.objects
            .get_or_create(&ValidityLabels {
                validity: "invalid".to_string(),
            })
            .set((statuses.len() - valid) as i64);
    }
}
