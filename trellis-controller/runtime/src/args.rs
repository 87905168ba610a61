use crate::{
    core::NamespacedName,
    envoy::{run_build_loop, ListenerConfig, WatchPublisher},
    index::{
        builder,
        metrics::{BuildMetrics, IndexMetrics},
        ClusterInfo, Index,
    },
    k8s,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "trellis", about = "An ingress controller for Envoy")]
pub struct Args {
    #[clap(
        long,
        default_value = "trellis=info,warn",
        env = "TRELLIS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Ingress class this controller claims; objects annotated with any
    /// other class are ignored.
    #[clap(long, default_value = "trellis")]
    ingress_class_name: String,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    /// `namespace/name` of a TLS secret served for virtual hosts that opt
    /// into the fallback certificate.
    #[clap(long)]
    fallback_certificate: Option<NamespacedName>,

    /// Address the plaintext listener binds.
    #[clap(long, default_value = "0.0.0.0:8080")]
    envoy_listen_http: SocketAddr,

    /// Address the TLS listener binds.
    #[clap(long, default_value = "0.0.0.0:8443")]
    envoy_listen_https: SocketAddr,

    #[clap(long, default_value = "/dev/stdout")]
    access_log_path: String,

    /// Expect a PROXY protocol header on every downstream connection.
    #[clap(long)]
    use_proxy_protocol: bool,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            ingress_class_name,
            cluster_domain,
            fallback_certificate,
            envoy_listen_http,
            envoy_listen_https,
            access_log_path,
            use_proxy_protocol,
        } = self;

        let info = ClusterInfo {
            ingress_class_name,
            cluster_domain,
            fallback_certificate,
        };
        let listeners = ListenerConfig {
            http_address: envoy_listen_http.ip().to_string(),
            http_port: envoy_listen_http.port().into(),
            https_address: envoy_listen_https.ip().to_string(),
            https_port: envoy_listen_https.port().into(),
            access_log_path,
            use_proxy_protocol,
            ..ListenerConfig::default()
        };

        let index = Index::shared();

        let mut prom = <Registry>::default();
        let index_metrics =
            IndexMetrics::register(index.clone(), prom.sub_registry_with_prefix("resource"))
                .shared();
        let build_metrics = BuildMetrics::register(prom.sub_registry_with_prefix("dag"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Spawn resource watches.

        let secrets = runtime.watch_all::<k8s::Secret>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics.clone(), secrets)
                .instrument(info_span!("secrets")),
        );

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics.clone(), services)
                .instrument(info_span!("services")),
        );

        let extensions =
            runtime.watch_all::<k8s::v1alpha1::ExtensionService>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics.clone(), extensions)
                .instrument(info_span!("extensionservices")),
        );

        let ingresses = runtime.watch_all::<k8s::Ingress>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics.clone(), ingresses)
                .instrument(info_span!("ingresses")),
        );

        let proxies = runtime.watch_all::<k8s::v1::HTTPProxy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics.clone(), proxies)
                .instrument(info_span!("httpproxies")),
        );

        // The build loop wakes on index revisions and publishes onto the
        // snapshot channel; publishing fails once every receiver is gone,
        // so the handle is held until shutdown.
        let revisions = index.read().changes();
        let (publisher, _snapshots) = WatchPublisher::new();
        let build = move || {
            let resources = index.read().snapshot();
            let (dag, statuses) = builder::build(&resources, &info);
            build_metrics.record(&dag, &statuses);
            (dag, statuses)
        };
        tokio::spawn(
            run_build_loop(revisions, listeners, build, publisher)
                .instrument(info_span!("build")),
        );

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
