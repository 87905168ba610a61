//! Renders cluster resources. Every cluster uses endpoint discovery; the
//! endpoint service keys off the `namespace/service/port` triple.

use crate::wire::{Cluster, ConfigSource, EdsClusterConfig, Empty, ProtoDuration, TransportSocket};
use crate::MANAGEMENT_CLUSTER_NAME;
use std::time::Duration;
use trellis_controller_core::{dag, LoadBalancerStrategy, Protocol};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

pub fn clusters(dag: &dag::Dag) -> Vec<Cluster> {
    dag.clusters
        .iter()
        .map(cluster)
        .chain(dag.extension_clusters.iter().map(extension_cluster))
        .collect()
}

pub fn cluster(c: &dag::Cluster) -> Cluster {
    let service = &c.upstream.service;
    let eds_service_name = format!("{}/{}/{}", service.namespace, service.name, service.port);

    let transport_socket = match c.protocol {
        Some(Protocol::Tls) => Some(upstream_transport(c, &[])),
        Some(Protocol::H2) => Some(upstream_transport(c, &["h2"])),
        _ => None,
    };

    Cluster {
        name: c.name(),
        discovery_type: "EDS",
        eds_cluster_config: Some(eds_config(eds_service_name)),
        connect_timeout: ProtoDuration(CONNECT_TIMEOUT),
        lb_policy: lb_policy(c.load_balancer_strategy),
        http2_protocol_options: matches!(c.protocol, Some(Protocol::H2 | Protocol::H2C))
            .then(Empty::default),
        transport_socket,
    }
}

/// The cluster for an extension service. Endpoints resolve through the
/// same discovery channel, keyed by the extension cluster name itself.
/// The `h2` protocol means TLS to the extension, `h2c` cleartext.
pub fn extension_cluster(ec: &dag::ExtensionCluster) -> Cluster {
    let transport_socket = matches!(ec.protocol, Protocol::H2).then(|| {
        let validation = ec.upstream_validation.as_ref();
        let sni = validation.and_then(|v| v.subject_name.as_deref());
        crate::tls::upstream_transport_socket(validation, sni, &["h2"])
    });

    Cluster {
        name: ec.name.clone(),
        discovery_type: "EDS",
        eds_cluster_config: Some(eds_config(ec.name.clone())),
        connect_timeout: ProtoDuration(CONNECT_TIMEOUT),
        lb_policy: lb_policy(ec.load_balancer_strategy),
        http2_protocol_options: matches!(ec.protocol, Protocol::H2 | Protocol::H2C)
            .then(Empty::default),
        transport_socket,
    }
}

fn upstream_transport(c: &dag::Cluster, alpn: &[&str]) -> TransportSocket {
    let sni = c
        .upstream_validation
        .as_ref()
        .and_then(|v| v.subject_name.as_deref());
    crate::tls::upstream_transport_socket(c.upstream_validation.as_ref(), sni, alpn)
}

fn eds_config(service_name: String) -> EdsClusterConfig {
    EdsClusterConfig {
        eds_config: ConfigSource::management(MANAGEMENT_CLUSTER_NAME),
        service_name,
    }
}

fn lb_policy(strategy: LoadBalancerStrategy) -> Option<&'static str> {
    match strategy {
        // Round robin is the proxy default and stays implicit.
        LoadBalancerStrategy::Default => None,
        LoadBalancerStrategy::WeightedLeastRequest => Some("LEAST_REQUEST"),
        LoadBalancerStrategy::Random => Some("RANDOM"),
        LoadBalancerStrategy::Cookie | LoadBalancerStrategy::RequestHash => Some("RING_HASH"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::TransportSocketConfig;
    use pretty_assertions::assert_eq;
    use trellis_controller_core::{PeerValidationContext, Service, WeightedService};

    fn backend(protocol: Option<Protocol>) -> dag::Cluster {
        dag::Cluster {
            protocol,
            ..dag::Cluster::new(WeightedService {
                service: Service {
                    namespace: "default".to_string(),
                    name: "kuard".to_string(),
                    port: 8080,
                },
                weight: None,
            })
        }
    }

    #[test]
    fn eds_cluster_basics() {
        let c = cluster(&backend(None));
        assert_eq!(c.name, "default/kuard/8080");
        assert_eq!(c.discovery_type, "EDS");
        assert_eq!(c.connect_timeout, ProtoDuration(Duration::from_millis(250)));
        assert_eq!(c.lb_policy, None);
        assert_eq!(c.http2_protocol_options, None);
        assert_eq!(c.transport_socket, None);

        let eds = c.eds_cluster_config.unwrap();
        assert_eq!(eds.service_name, "default/kuard/8080");
        assert_eq!(
            eds.eds_config.api_config_source.grpc_services[0]
                .envoy_grpc
                .cluster_name,
            MANAGEMENT_CLUSTER_NAME,
        );
    }

    #[test]
    fn lb_strategies() {
        let strategy = |s| {
            let mut b = backend(None);
            b.load_balancer_strategy = s;
            cluster(&b).lb_policy
        };
        assert_eq!(strategy(LoadBalancerStrategy::Default), None);
        assert_eq!(
            strategy(LoadBalancerStrategy::WeightedLeastRequest),
            Some("LEAST_REQUEST")
        );
        assert_eq!(strategy(LoadBalancerStrategy::Random), Some("RANDOM"));
        assert_eq!(strategy(LoadBalancerStrategy::Cookie), Some("RING_HASH"));
        assert_eq!(
            strategy(LoadBalancerStrategy::RequestHash),
            Some("RING_HASH")
        );
    }

    #[test]
    fn h2c_upstreams_speak_cleartext_http2() {
        let c = cluster(&backend(Some(Protocol::H2C)));
        assert_eq!(c.name, "default/kuard/8080/h2c");
        assert_eq!(c.http2_protocol_options, Some(Empty::default()));
        assert_eq!(c.transport_socket, None);
    }

    #[test]
    fn tls_upstreams_pin_their_validation_context() {
        let mut b = backend(Some(Protocol::Tls));
        b.upstream_validation = Some(PeerValidationContext {
            ca: b"backend-ca".to_vec(),
            subject_name: Some("backend.example.com".to_string()),
            skip_client_cert_validation: false,
        });
        let c = cluster(&b);

        let socket = c.transport_socket.unwrap();
        match socket.typed_config {
            TransportSocketConfig::Upstream(ctx) => {
                assert_eq!(ctx.sni, Some("backend.example.com".to_string()));
                let validation = ctx.common_tls_context.validation_context.unwrap();
                assert!(validation.trusted_ca.is_some());
                assert!(validation.match_typed_subject_alt_names.is_some());
            }
            other => panic!("expected an upstream context, got {other:?}"),
        }
    }

    #[test]
    fn extension_clusters_resolve_through_their_own_name() {
        let ec = dag::ExtensionCluster {
            name: dag::ExtensionCluster::name_for("auth-system", "authserver"),
            services: vec![],
            protocol: Protocol::H2,
            upstream_validation: None,
            load_balancer_strategy: LoadBalancerStrategy::Default,
            response_timeout: Default::default(),
        };
        let c = extension_cluster(&ec);
        assert_eq!(c.name, "extension/auth-system/authserver");
        assert_eq!(
            c.eds_cluster_config.unwrap().service_name,
            "extension/auth-system/authserver"
        );
        assert_eq!(c.http2_protocol_options, Some(Empty::default()));
        // h2 speaks TLS even without a validation context.
        assert!(c.transport_socket.is_some());

        let cleartext = extension_cluster(&dag::ExtensionCluster {
            protocol: Protocol::H2C,
            ..ec
        });
        assert_eq!(cleartext.transport_socket, None);
    }
}
