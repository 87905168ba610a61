//! Versioned configuration snapshots and the rebuild loop that produces
//! them.
//!
//! A snapshot is an immutable bundle of every resource collection the
//! proxy consumes. The rebuild loop folds index revisions into snapshots:
//! at most one build runs at a time, and revisions that arrive mid-build
//! coalesce into a single follow-up build.

use crate::{cluster, listener, route, secret, wire, ListenerConfig};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};
use trellis_controller_core::{dag::Dag, StatusUpdate};

/// One complete, internally consistent view of the proxy configuration.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct Snapshot {
    /// Monotonic version, stamped by the rebuild loop.
    pub version: u64,
    pub listeners: Vec<wire::Listener>,
    pub route_configurations: Vec<wire::RouteConfiguration>,
    pub clusters: Vec<wire::Cluster>,
    pub secrets: Vec<wire::Secret>,
}

// === impl Snapshot ===

impl Snapshot {
    /// Renders every resource collection from a frozen graph. The output
    /// depends only on the graph and the listener configuration, so equal
    /// inputs render byte-identical snapshots.
    pub fn build(dag: &Dag, config: &ListenerConfig) -> Result<Self, listener::BuildError> {
        let mut listeners = vec![listener::http_listener(config)?];
        if let Some(https) = listener::https_listener(dag, config)? {
            listeners.push(https);
        }

        Ok(Self {
            version: 0,
            listeners,
            route_configurations: route::route_configurations(dag),
            clusters: cluster::clusters(dag),
            secrets: secret::secrets(dag),
        })
    }
}

/// Hands finished snapshots to whatever serves them to proxies.
#[async_trait::async_trait]
pub trait SnapshotPublisher {
    async fn publish(&mut self, snapshot: Snapshot) -> Result<()>;
}

/// Publishes snapshots over a watch channel. Receivers always observe the
/// newest snapshot; intermediate versions may be skipped.
pub struct WatchPublisher {
    tx: watch::Sender<Arc<Snapshot>>,
}

// === impl WatchPublisher ===

impl WatchPublisher {
    pub fn new() -> (Self, watch::Receiver<Arc<Snapshot>>) {
        let (tx, rx) = watch::channel(Arc::new(Snapshot::default()));
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl SnapshotPublisher for WatchPublisher {
    async fn publish(&mut self, snapshot: Snapshot) -> Result<()> {
        self.tx
            .send(Arc::new(snapshot))
            .map_err(|_| anyhow!("all snapshot receivers dropped"))
    }
}

/// Drives builds: runs one immediately, then one per observed revision
/// change until the revision channel closes.
///
/// `build` captures the shared index; it returns the frozen graph along
/// with the validity verdict for every processed object. Verdicts are
/// surfaced through logs here and returned state is never written back
/// into the index.
pub async fn run_build_loop<B, P>(
    mut revisions: watch::Receiver<u64>,
    config: ListenerConfig,
    mut build: B,
    mut publisher: P,
) -> Result<()>
where
    B: FnMut() -> (Dag, Vec<StatusUpdate>) + Send,
    P: SnapshotPublisher + Send,
{
    let mut version: u64 = 0;
    loop {
        // Mark the current revision seen before reading the index, so a
        // write that lands mid-build triggers exactly one more pass.
        let revision = *revisions.borrow_and_update();

        let (dag, statuses) = build();
        for status in &statuses {
            if status.valid {
                debug!(object = %status.object, "valid");
            } else {
                info!(
                    object = %status.object,
                    reason = %status.reason,
                    message = %status.message,
                    "rejected",
                );
            }
        }

        match Snapshot::build(&dag, &config) {
            Ok(mut snapshot) => {
                version += 1;
                snapshot.version = version;
                info!(
                    version,
                    revision,
                    listeners = snapshot.listeners.len(),
                    routes = snapshot.route_configurations.len(),
                    clusters = snapshot.clusters.len(),
                    secrets = snapshot.secrets.len(),
                    "publishing snapshot",
                );
                publisher.publish(snapshot).await?;
            }
            // A render failure is a bug, but serving the previous snapshot
            // beats crashing the control plane.
            Err(error) => error!(%error, revision, "dropping unrenderable build"),
        }

        if revisions.changed().await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn empty_graphs_render_the_insecure_listener_only() {
        let snapshot = Snapshot::build(&Dag::default(), &ListenerConfig::default()).unwrap();
        let names: Vec<_> = snapshot.listeners.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["ingress_http"]);
        assert_eq!(snapshot.route_configurations.len(), 1);
        assert_eq!(snapshot.route_configurations[0].name, "ingress_http");
        assert!(snapshot.clusters.is_empty());
        assert!(snapshot.secrets.is_empty());
    }

    #[test]
    fn tls_hosts_add_the_secure_listener() {
        let dag = Dag {
            secure_virtual_hosts: vec![trellis_controller_core::SecureVirtualHost {
                virtual_host: trellis_controller_core::VirtualHost::new("example.com"),
                secret: Some(trellis_controller_core::Secret {
                    namespace: "default".to_string(),
                    name: "tls-cert".to_string(),
                    cert: b"cert".to_vec(),
                    key: b"key".to_vec(),
                }),
                min_tls_version: Default::default(),
                cipher_suites: vec![],
                peer_validation: None,
                fallback_certificate: false,
                authorization: None,
                tcp_proxy: None,
            }],
            secrets: vec![trellis_controller_core::Secret {
                namespace: "default".to_string(),
                name: "tls-cert".to_string(),
                cert: b"cert".to_vec(),
                key: b"key".to_vec(),
            }],
            ..Dag::default()
        };

        let snapshot = Snapshot::build(&dag, &ListenerConfig::default()).unwrap();
        let names: Vec<_> = snapshot.listeners.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["ingress_http", "ingress_https"]);
        let configs: Vec<_> = snapshot
            .route_configurations
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(configs, vec!["ingress_http", "https/example.com"]);
        assert_eq!(snapshot.secrets[0].name, "default/tls-cert");
    }

    #[test]
    fn identical_graphs_render_identical_snapshots() {
        let config = ListenerConfig::default();
        let a = Snapshot::build(&Dag::default(), &config).unwrap();
        let b = Snapshot::build(&Dag::default(), &config).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[tokio::test]
    async fn the_loop_builds_once_per_revision() {
        let builds = Arc::new(AtomicUsize::new(0));
        let (revisions_tx, revisions_rx) = watch::channel(0u64);
        let (publisher, mut snapshots) = WatchPublisher::new();

        let counter = builds.clone();
        let handle = tokio::spawn(run_build_loop(
            revisions_rx,
            ListenerConfig::default(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                (Dag::default(), vec![])
            },
            publisher,
        ));

        // The first build runs without any revision change.
        snapshots.changed().await.unwrap();
        assert_eq!(snapshots.borrow_and_update().version, 1);

        revisions_tx.send(1).unwrap();
        snapshots.changed().await.unwrap();
        assert_eq!(snapshots.borrow_and_update().version, 2);

        drop(revisions_tx);
        handle.await.unwrap().unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn verdicts_do_not_block_publication() {
        let (revisions_tx, revisions_rx) = watch::channel(0u64);
        let (publisher, mut snapshots) = WatchPublisher::new();

        let handle = tokio::spawn(run_build_loop(
            revisions_rx,
            ListenerConfig::default(),
            move || {
                let object = trellis_controller_core::ObjectRef::new(
                    "HTTPProxy",
                    "default",
                    "broken",
                );
                let status = StatusUpdate::invalid(
                    object,
                    trellis_controller_core::conditions::reason::ROUTE_ERROR,
                    "route references a missing service",
                    chrono::DateTime::<chrono::Utc>::MIN_UTC,
                );
                (Dag::default(), vec![status])
            },
            publisher,
        ));

        snapshots.changed().await.unwrap();
        assert_eq!(snapshots.borrow_and_update().version, 1);

        drop(revisions_tx);
        handle.await.unwrap().unwrap();
    }
}
